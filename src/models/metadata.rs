//! Metadata documents: tag/value records owned by a source URI.
//!
//! A record is keyed by (Key, SrcURI). Inheritance propagates a record to
//! every stream URI of which SrcURI is a segment-prefix; the `path` field
//! holds the concrete stream URI the record was materialized for.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::uot::UnitOfTime;

/// A metadata value: a plain string, or a list (used by DISTINCT replies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Str(String),
    List(Vec<String>),
}

impl From<&str> for RecordValue {
    fn from(s: &str) -> Self {
        RecordValue::Str(s.to_owned())
    }
}

impl From<String> for RecordValue {
    fn from(s: String) -> Self {
        RecordValue::Str(s)
    }
}

/// One tag/value document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: RecordValue,
    #[serde(rename = "SrcURI")]
    pub src_uri: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "UUID", skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(rename = "UnitofTime", skip_serializing_if = "Option::is_none")]
    pub unit_of_time: Option<UnitOfTime>,
}

impl MetadataRecord {
    /// Read a named field as a string, `None` if absent on this record.
    /// Field names use the canonical spellings (`Key`, `Value`, `SrcURI`,
    /// `Path`, `UUID`, `UnitofTime`).
    pub fn field(&self, name: &str) -> Option<String> {
        match canonical_field(name).as_str() {
            "Key" => Some(self.key.clone()),
            "Value" => match &self.value {
                RecordValue::Str(s) => Some(s.clone()),
                RecordValue::List(l) => Some(l.join(",")),
            },
            "SrcURI" => Some(self.src_uri.clone()),
            "Path" => Some(self.path.clone()),
            "UUID" => self.uuid.map(|u| u.to_string()),
            "UnitofTime" => self.unit_of_time.map(|u| u8::from(u).to_string()),
            _ => None,
        }
    }
}

/// A group of records returned together for one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataGroup {
    #[serde(rename = "Records")]
    pub records: Vec<MetadataRecord>,
}

impl MetadataGroup {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// True when the tag names a record field rather than a metadata key.
pub fn is_record_field(name: &str) -> bool {
    matches!(
        canonical_field(name).as_str(),
        "Key" | "Value" | "SrcURI" | "Path" | "UUID" | "UnitofTime"
    )
}

/// Map query-language field spellings onto the stored document fields.
pub fn canonical_field(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "uuid" => "UUID".to_owned(),
        "path" => "Path".to_owned(),
        "srcuri" => "SrcURI".to_owned(),
        "key" => "Key".to_owned(),
        "value" => "Value".to_owned(),
        "unitoftime" => "UnitofTime".to_owned(),
        _ => name.to_owned(),
    }
}

/// Predicate over one document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals the given string.
    Eq(String),
    /// Field differs from the given string (absent fields match).
    Neq(String),
    /// SQL-style pattern with `%` wildcards.
    Like(String),
    /// Field is present on the document.
    Has,
}

impl Predicate {
    /// Evaluate against a field value (`None` when the document lacks the
    /// field).
    pub fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (Predicate::Eq(want), Some(v)) => want == v,
            (Predicate::Eq(_), None) => false,
            (Predicate::Neq(want), Some(v)) => want != v,
            (Predicate::Neq(_), None) => true,
            (Predicate::Like(pat), Some(v)) => like_match(pat, v),
            (Predicate::Like(_), None) => false,
            (Predicate::Has, v) => v.is_some(),
        }
    }
}

/// A finite map of field path to predicate; all entries must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause(pub BTreeMap<String, Predicate>);

impl WhereClause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, pred: Predicate) -> Self {
        self.0.insert(canonical_field(field), pred);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, record: &MetadataRecord) -> bool {
        self.0
            .iter()
            .all(|(field, pred)| pred.matches(record.field(field).as_deref()))
    }
}

/// Match an SQL-style `%` pattern without a regex engine: the literal
/// chunks between wildcards must appear in order, anchored at both ends
/// unless the pattern starts/ends with `%`.
fn like_match(pattern: &str, value: &str) -> bool {
    let chunks: Vec<&str> = pattern.split('%').collect();
    if chunks.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(chunk) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(chunk);
        } else {
            match rest.find(chunk) {
                Some(pos) => rest = &rest[pos + chunk.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str, src: &str, path: &str) -> MetadataRecord {
        MetadataRecord {
            key: key.into(),
            value: value.into(),
            src_uri: src.into(),
            path: path.into(),
            uuid: None,
            unit_of_time: None,
        }
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("scratch/%", "scratch/r1/temp"));
        assert!(like_match("%temp", "scratch/r1/temp"));
        assert!(like_match("%r1%", "scratch/r1/temp"));
        assert!(like_match("scratch/r1/temp", "scratch/r1/temp"));
        assert!(!like_match("scratch/%", "other/r1"));
        assert!(!like_match("%r9%", "scratch/r1/temp"));
    }

    #[test]
    fn where_clause_conjunction() {
        let rec = record("Building", "Soda", "scratch", "scratch/r1/temp");
        let w = WhereClause::new()
            .with("Key", Predicate::Eq("Building".into()))
            .with("Path", Predicate::Like("scratch/%".into()));
        assert!(w.matches(&rec));

        let w = w.with("SrcURI", Predicate::Eq("other".into()));
        assert!(!w.matches(&rec));
    }

    #[test]
    fn field_spellings_are_normalized() {
        let mut rec = record("k", "v", "s", "p");
        rec.uuid = Some(Uuid::nil());
        let w = WhereClause::new().with("uuid", Predicate::Eq(Uuid::nil().to_string()));
        assert!(w.matches(&rec));
    }

    #[test]
    fn neq_matches_absent_fields() {
        let rec = record("k", "v", "s", "p");
        assert!(Predicate::Neq("x".into()).matches(rec.field("UUID").as_deref()));
    }
}
