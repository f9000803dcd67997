//! The messaging-fabric seam.
//!
//! The archiver consumes the fabric through [`Fabric`]: subscribe to a URI
//! pattern, publish payload objects to a URI, and build authorization
//! chains on behalf of a requesting key. A network-backed implementation
//! lives outside this crate; [`memory::MemoryFabric`] provides the
//! in-process implementation used by tests and local runs.

pub mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// A payload-object number: an opaque `u32` conventionally rendered as a
/// dotted quad (`2.0.8.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PONum(pub u32);

impl PONum {
    pub const fn from_quad(a: u8, b: u8, c: u8, d: u8) -> Self {
        PONum(((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | (d as u32))
    }
}

impl fmt::Display for PONum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{}.{}.{}.{}",
            (v >> 24) & 0xff,
            (v >> 16) & 0xff,
            (v >> 8) & 0xff,
            v & 0xff
        )
    }
}

impl FromStr for PONum {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut quad = [0u8; 4];
        for slot in quad.iter_mut() {
            *slot = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| FabricError::BadPONum(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(FabricError::BadPONum(s.to_owned()));
        }
        Ok(PONum::from_quad(quad[0], quad[1], quad[2], quad[3]))
    }
}

/// A typed payload object: numeric type tag plus opaque body.
#[derive(Debug, Clone)]
pub struct PayloadObject {
    pub ponum: PONum,
    pub body: Vec<u8>,
}

/// One inbound message from a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    /// Key of the publisher, as attested by the fabric.
    pub from: String,
    /// Concrete URI the message was published on.
    pub uri: String,
    pub pos: Vec<PayloadObject>,
}

impl Message {
    /// The first payload object carrying the given PO number, if any.
    pub fn po(&self, ponum: PONum) -> Option<&PayloadObject> {
        self.pos.iter().find(|po| po.ponum == ponum)
    }
}

/// The action a chain authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("could not subscribe to {uri}: {message}")]
    Subscribe { uri: String, message: String },

    #[error("could not publish to {uri}: {message}")]
    Publish { uri: String, message: String },

    #[error("chain build failed for {key} on {uri}: {message}")]
    ChainBuild {
        key: String,
        uri: String,
        message: String,
    },

    #[error("fabric connection lost")]
    Disconnected,

    #[error("malformed payload object number {0:?}")]
    BadPONum(String),
}

/// The messaging fabric contract.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Subscribe to a URI pattern; messages on matching concrete URIs are
    /// delivered on the returned channel until it is dropped.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Message>, FabricError>;

    /// Publish payload objects on a URI under this client's identity.
    async fn publish(&self, uri: &str, pos: Vec<PayloadObject>) -> Result<(), FabricError>;

    /// Attempt to build an authorization chain proving `key` may perform
    /// `access` on `uri`. Returns whether a chain exists.
    async fn build_chain(&self, key: &str, uri: &str, access: Access)
        -> Result<bool, FabricError>;
}
