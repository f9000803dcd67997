//! Framing of inbound subscription messages and outbound query replies as
//! typed payload objects.
//!
//! Bodies are msgpack with named fields, so payloads stay self-describing
//! across archiver versions. PO numbers are opaque integers in the 2.0.8.x
//! family (2.0.7.8 for archive requests).

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fabric::{PONum, PayloadObject};
use crate::models::{ChangedRange, MetadataGroup, StatisticTimeseries, Timeseries};

/// Query request: `{Query, Nonce}`.
pub const PO_KV_QUERY: PONum = PONum::from_quad(2, 0, 8, 1);
/// Metadata reply group.
pub const PO_METADATA_REPLY: PONum = PONum::from_quad(2, 0, 8, 2);
/// Raw timeseries reply group.
pub const PO_TIMESERIES_REPLY: PONum = PONum::from_quad(2, 0, 8, 4);
/// Statistics reply group.
pub const PO_STATISTICS_REPLY: PONum = PONum::from_quad(2, 0, 8, 6);
/// Changed-range reply group.
pub const PO_CHANGED_REPLY: PONum = PONum::from_quad(2, 0, 8, 8);
/// Query error reply.
pub const PO_QUERY_ERROR: PONum = PONum::from_quad(2, 0, 8, 9);
/// Archive request publication.
pub const PO_ARCHIVE_REQUEST: PONum = PONum::from_quad(2, 0, 7, 8);
/// Metadata record publication.
pub const PO_METADATA: PONum = PONum::from_quad(2, 0, 3, 2);

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload body is not valid msgpack: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("could not encode payload body: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// A query submitted over the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueQuery {
    #[serde(rename = "Query")]
    pub query: String,
    #[serde(rename = "Nonce")]
    pub nonce: u32,
}

/// Error reply carrying the offending query and its nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryError {
    #[serde(rename = "Query")]
    pub query: String,
    #[serde(rename = "Nonce")]
    pub nonce: u32,
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReply {
    #[serde(rename = "Nonce")]
    pub nonce: u32,
    #[serde(rename = "Data")]
    pub data: Vec<MetadataGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesReply {
    #[serde(rename = "Nonce")]
    pub nonce: u32,
    #[serde(rename = "Data")]
    pub data: Vec<Timeseries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsReply {
    #[serde(rename = "Nonce")]
    pub nonce: u32,
    #[serde(rename = "Data")]
    pub data: Vec<StatisticTimeseries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedReply {
    #[serde(rename = "Nonce")]
    pub nonce: u32,
    #[serde(rename = "Changed")]
    pub changed: Vec<ChangedRange>,
}

/// Encode a typed body into a payload object.
pub fn encode<T: Serialize>(ponum: PONum, body: &T) -> Result<PayloadObject, EnvelopeError> {
    Ok(PayloadObject {
        ponum,
        body: rmp_serde::to_vec_named(body)?,
    })
}

/// Decode a payload object body.
pub fn decode<T: DeserializeOwned>(po: &PayloadObject) -> Result<T, EnvelopeError> {
    Ok(rmp_serde::from_slice(&po.body)?)
}

/// Reply signal URI for a requester key: the key minus its final character,
/// with `,queries` appended.
pub fn signal_uri(key: &str) -> String {
    let mut trimmed = key.to_owned();
    trimmed.pop();
    format!("{trimmed},queries")
}

/// A decoded, schemaless payload body. Value expressions and metadata
/// extraction walk this structure.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    /// Decode a payload body as a schemaless value.
    pub fn from_po(po: &PayloadObject) -> Result<Self, EnvelopeError> {
        Ok(rmp_serde::from_slice(&po.body)?)
    }

    /// Follow a dotted key path (`a.b.c`) through nested maps.
    pub fn lookup(&self, path: &str) -> Option<&PayloadValue> {
        let mut cur = self;
        for seg in path.split('.') {
            match cur {
                PayloadValue::Map(m) => cur = m.get(seg)?,
                _ => return None,
            }
        }
        Some(cur)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PayloadValue::Float(f) => Some(*f),
            PayloadValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PayloadValue::Int(i) => Some(*i),
            PayloadValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Top-level string-valued entries, used for metadata extraction.
    pub fn string_entries(&self) -> Vec<(String, String)> {
        match self {
            PayloadValue::Map(m) => m
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect(),
            _ => Vec::new(),
        }
    }
}
