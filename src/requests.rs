//! Archive requests: contracts describing which URIs to subscribe to, how
//! to extract metadata, and how to extract numeric values.
//!
//! A request with pattern `P` matches a concrete URI `U` iff `U` matches
//! `P` under `+`/`*` semantics. Each (concrete URI, PO, value expression)
//! triple names one stream; its UUID is derived content-addressed from the
//! triple, so restarts reproduce identities without consulting any
//! external state.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::envelope::{self, EnvelopeError};
use crate::fabric::{PONum, PayloadObject};
use crate::models::UnitOfTime;
use crate::uri;

/// Messages published on URIs with this suffix carry archive-request
/// payloads rather than data.
pub const ARCHIVE_REQUEST_SUFFIX: &str = "!meta/archive";

/// Namespace for content-addressed stream UUIDs.
const STREAM_NAMESPACE: Uuid = Uuid::from_u128(0x9c46_8cbb_5f2a_4f31_9e2a_77d3_41c0_8d6f);

/// How a request sources metadata for its streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataMode {
    /// Inherit records from every SrcURI that is a prefix of the stream URI.
    #[default]
    Inherit,
    /// Read tag/value pairs from the payload object directly.
    Payload,
}

/// Wire form of an archive request, as published on the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveRequestWire {
    #[serde(rename = "URI")]
    uri: String,
    #[serde(rename = "PO")]
    po: String,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Metadata", default)]
    metadata: MetadataMode,
    #[serde(rename = "Time", default)]
    time: Option<String>,
    #[serde(rename = "TimeUnit", default)]
    time_unit: Option<u8>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "Unit", default)]
    unit: Option<String>,
    #[serde(rename = "SrcURI", default)]
    src_uri: Option<String>,
}

/// A parsed, normalized archive request.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRequest {
    /// Pattern URI to subscribe to.
    pub pattern: String,
    /// Payload object number of interest.
    pub po: PONum,
    /// Expression extracting the numeric value from the payload.
    pub value_expr: String,
    pub metadata_mode: MetadataMode,
    /// Expression extracting the reading timestamp; `ts` when unset.
    pub time_expr: String,
    /// Scale of the extracted timestamp.
    pub time_unit: UnitOfTime,
    /// Human-readable stream name annotation.
    pub name: String,
    /// Engineering unit annotation.
    pub unit: String,
    /// Anchors metadata ownership; the pattern URI's static prefix when
    /// unset.
    pub src_uri: Option<String>,
}

#[derive(Debug, Error)]
pub enum RequestParseError {
    #[error("archive request body undecodable: {0}")]
    Body(#[from] EnvelopeError),

    #[error("archive request has a bad PO number: {0}")]
    BadPONum(String),

    #[error("archive request has an empty {0}")]
    EmptyField(&'static str),
}

/// Collapse interior whitespace so trivially different spellings of the
/// same expression derive the same stream UUID.
pub fn normalize_expr(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl ArchiveRequest {
    /// Parse a published archive-request payload object.
    pub fn from_po(po: &PayloadObject) -> Result<Self, RequestParseError> {
        let wire: ArchiveRequestWire = envelope::decode(po)?;
        if wire.uri.trim().is_empty() {
            return Err(RequestParseError::EmptyField("URI"));
        }
        if wire.value.trim().is_empty() {
            return Err(RequestParseError::EmptyField("Value"));
        }
        let ponum = wire
            .po
            .parse::<PONum>()
            .map_err(|_| RequestParseError::BadPONum(wire.po.clone()))?;
        let time_unit = match wire.time_unit {
            Some(raw) => UnitOfTime::try_from(raw).unwrap_or(UnitOfTime::Nanoseconds),
            None => UnitOfTime::Nanoseconds,
        };
        Ok(ArchiveRequest {
            pattern: uri::clean(&wire.uri).to_owned(),
            po: ponum,
            value_expr: normalize_expr(&wire.value),
            metadata_mode: wire.metadata,
            time_expr: wire
                .time
                .map(|t| normalize_expr(&t))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "ts".to_owned()),
            time_unit,
            name: wire.name.unwrap_or_default(),
            unit: wire.unit.unwrap_or_default(),
            src_uri: wire.src_uri.map(|s| uri::clean(&s).to_owned()),
        })
    }

    /// True iff this request applies to the concrete URI.
    pub fn matches(&self, concrete: &str) -> bool {
        uri::matches(&self.pattern, concrete)
    }

    /// The stream identity for a concrete URI under this request.
    pub fn stream_uuid(&self, concrete: &str) -> Uuid {
        stream_uuid(concrete, self.po, &self.value_expr)
    }

    /// The SrcURI anchoring metadata for a given concrete URI: the declared
    /// one, or the pattern's static prefix (segments before the first
    /// wildcard).
    pub fn metadata_src_uri(&self, concrete: &str) -> String {
        if let Some(src) = &self.src_uri {
            return src.clone();
        }
        let mut prefix = Vec::new();
        for (pseg, useg) in self.pattern.split('/').zip(uri::clean(concrete).split('/')) {
            if pseg == "+" || pseg == "*" {
                break;
            }
            prefix.push(useg);
        }
        if prefix.is_empty() {
            uri::clean(concrete).to_owned()
        } else {
            prefix.join("/")
        }
    }
}

/// Deterministic stream identity from the (URI, PO, value expression)
/// triple.
pub fn stream_uuid(concrete: &str, po: PONum, value_expr: &str) -> Uuid {
    let material = format!(
        "{}|{}|{}",
        uri::clean(concrete),
        po,
        normalize_expr(value_expr)
    );
    Uuid::new_v5(&STREAM_NAMESPACE, material.as_bytes())
}

/// In-memory registry of parsed archive requests, keyed by their identity
/// (pattern, PO, value expression). Re-publication supersedes.
#[derive(Default)]
pub struct RequestRegistry {
    requests: RwLock<HashMap<(String, PONum, String), ArchiveRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or supersede. Returns true when the request was new.
    pub fn register(&self, request: ArchiveRequest) -> bool {
        let key = (
            request.pattern.clone(),
            request.po,
            request.value_expr.clone(),
        );
        self.requests.write().insert(key, request).is_none()
    }

    /// All requests whose pattern matches the concrete URI.
    pub fn matching(&self, concrete: &str) -> Vec<ArchiveRequest> {
        self.requests
            .read()
            .values()
            .filter(|r| r.matches(concrete))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }
}
