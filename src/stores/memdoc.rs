//! Indexed in-process document backend for the metadata store.
//!
//! Documents are upserted on (Key, SrcURI); secondary indexes cover UUID,
//! Path, SrcURI, and Key. Concurrent upserts of the same (Key, SrcURI) are
//! last-writer-wins.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::models::metadata::canonical_field;
use crate::models::{MetadataGroup, MetadataRecord, RecordValue, UnitOfTime, WhereClause};
use crate::stores::{MetadataStore, StoreError};

const INDEXED_FIELDS: [&str; 4] = ["UUID", "Path", "SrcURI", "Key"];

#[derive(Default)]
struct DocTable {
    next_id: u64,
    by_id: HashMap<u64, MetadataRecord>,
    /// (Key, SrcURI) → doc id.
    primary: HashMap<(String, String), u64>,
    /// field → value → doc ids.
    indexes: HashMap<&'static str, HashMap<String, HashSet<u64>>>,
}

impl DocTable {
    fn index_insert(&mut self, id: u64, rec: &MetadataRecord) {
        for field in INDEXED_FIELDS {
            if let Some(value) = rec.field(field) {
                self.indexes
                    .entry(field)
                    .or_default()
                    .entry(value)
                    .or_default()
                    .insert(id);
            }
        }
    }

    fn index_remove(&mut self, id: u64, rec: &MetadataRecord) {
        for field in INDEXED_FIELDS {
            if let Some(value) = rec.field(field) {
                if let Some(by_value) = self.indexes.get_mut(field) {
                    if let Some(ids) = by_value.get_mut(&value) {
                        ids.remove(&id);
                    }
                }
            }
        }
    }

    /// Candidate doc ids for a where clause: the smallest index posting
    /// among equality predicates on indexed fields, or everything.
    fn candidates(&self, where_: &WhereClause) -> Vec<u64> {
        let mut best: Option<&HashSet<u64>> = None;
        for (field, pred) in &where_.0 {
            let crate::models::Predicate::Eq(value) = pred else {
                continue;
            };
            if !INDEXED_FIELDS.contains(&field.as_str()) {
                continue;
            }
            match self
                .indexes
                .get(field.as_str())
                .and_then(|by_value| by_value.get(value))
            {
                Some(ids) => {
                    if best.map_or(true, |b| ids.len() < b.len()) {
                        best = Some(ids);
                    }
                }
                // equality on an indexed field with no posting: nothing matches
                None => return Vec::new(),
            }
        }
        match best {
            Some(ids) => ids.iter().copied().collect(),
            None => self.by_id.keys().copied().collect(),
        }
    }

    fn remove_doc(&mut self, id: u64) -> Option<MetadataRecord> {
        let rec = self.by_id.remove(&id)?;
        self.primary.remove(&(rec.key.clone(), rec.src_uri.clone()));
        self.index_remove(id, &rec);
        Some(rec)
    }
}

/// The in-process metadata document store.
pub struct MemDocStore {
    table: RwLock<DocTable>,
}

impl MemDocStore {
    /// Construct the store and build the mandatory secondary indexes.
    /// Index creation failure is config-fatal for the archiver.
    pub fn new() -> Result<Self, StoreError> {
        let store = MemDocStore {
            table: RwLock::new(DocTable::default()),
        };
        store.ensure_indexes()?;
        Ok(store)
    }

    fn ensure_indexes(&self) -> Result<(), StoreError> {
        let mut table = self.table.write();
        for field in INDEXED_FIELDS {
            table.indexes.entry(field).or_default();
        }
        for field in INDEXED_FIELDS {
            if !table.indexes.contains_key(field) {
                return Err(StoreError::IndexCreation(format!("metadata.{field}")));
            }
        }
        Ok(())
    }

    /// Split selected tags into record fields (`uuid`, `Path`, ...) and
    /// metadata keys (anything else, e.g. `Building`).
    fn partition_tags(tags: &[String]) -> (Vec<String>, HashSet<String>) {
        let mut fields = Vec::new();
        let mut keys = HashSet::new();
        for tag in tags {
            if crate::models::metadata::is_record_field(tag) {
                fields.push(canonical_field(tag));
            } else {
                keys.insert(tag.clone());
            }
        }
        (fields, keys)
    }

    fn project(rec: &MetadataRecord, tags: &[String]) -> MetadataRecord {
        if tags.is_empty() {
            return rec.clone();
        }
        let (fields, keys) = Self::partition_tags(tags);
        // selecting by metadata key returns the whole record for context
        if !keys.is_empty() {
            return rec.clone();
        }
        let selected: HashSet<String> = fields.into_iter().collect();
        let keep = |name: &str| selected.contains(name);
        MetadataRecord {
            key: if keep("Key") { rec.key.clone() } else { String::new() },
            value: if keep("Value") {
                rec.value.clone()
            } else {
                RecordValue::Str(String::new())
            },
            src_uri: if keep("SrcURI") {
                rec.src_uri.clone()
            } else {
                String::new()
            },
            path: if keep("Path") {
                rec.path.clone()
            } else {
                String::new()
            },
            uuid: if keep("UUID") { rec.uuid } else { None },
            unit_of_time: if keep("UnitofTime") {
                rec.unit_of_time
            } else {
                None
            },
        }
    }
}

#[async_trait]
impl MetadataStore for MemDocStore {
    async fn save(&self, records: &[MetadataRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            debug!("aborting metadata insert with 0 records");
            return Ok(());
        }
        let mut table = self.table.write();
        for rec in records {
            let key = (rec.key.clone(), rec.src_uri.clone());
            if let Some(&id) = table.primary.get(&key) {
                let old = table.by_id.remove(&id);
                if let Some(old) = old {
                    table.index_remove(id, &old);
                }
                table.by_id.insert(id, rec.clone());
                table.index_insert(id, rec);
            } else {
                let id = table.next_id;
                table.next_id += 1;
                table.primary.insert(key, id);
                table.by_id.insert(id, rec.clone());
                table.index_insert(id, rec);
            }
        }
        Ok(())
    }

    async fn get_metadata(
        &self,
        tags: &[String],
        where_: &WhereClause,
    ) -> Result<MetadataGroup, StoreError> {
        let (_, key_tags) = Self::partition_tags(tags);
        let table = self.table.read();
        let mut ids = table.candidates(where_);
        ids.sort_unstable();
        let records = ids
            .into_iter()
            .filter_map(|id| table.by_id.get(&id))
            .filter(|rec| where_.matches(rec))
            .filter(|rec| key_tags.is_empty() || key_tags.contains(&rec.key))
            .map(|rec| Self::project(rec, tags))
            .collect();
        Ok(MetadataGroup { records })
    }

    async fn get_distinct(
        &self,
        tag: &str,
        where_: &WhereClause,
    ) -> Result<Vec<String>, StoreError> {
        let field = canonical_field(tag);
        let table = self.table.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut ids = table.candidates(where_);
        ids.sort_unstable();
        for id in ids {
            let Some(rec) = table.by_id.get(&id) else {
                continue;
            };
            if !where_.matches(rec) {
                continue;
            }
            if let Some(value) = rec.field(&field) {
                if seen.insert(value.clone()) {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }

    async fn get_unit_of_time(&self, uuid: Uuid) -> Result<UnitOfTime, StoreError> {
        let table = self.table.read();
        let ids = table
            .indexes
            .get("UUID")
            .and_then(|by_value| by_value.get(&uuid.to_string()));
        let Some(ids) = ids.filter(|ids| !ids.is_empty()) else {
            return Err(StoreError::NotFound(uuid));
        };
        let uot = ids
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .find_map(|rec| rec.unit_of_time)
            .unwrap_or_default();
        Ok(uot)
    }

    async fn remove(&self, tags: &[String], where_: &WhereClause) -> Result<usize, StoreError> {
        let selected: HashSet<String> = tags.iter().map(|t| canonical_field(t)).collect();
        let mut table = self.table.write();
        let doomed: Vec<u64> = table
            .candidates(where_)
            .into_iter()
            .filter(|id| {
                table.by_id.get(id).is_some_and(|rec| {
                    where_.matches(rec)
                        && (selected.is_empty() || selected.contains(&canonical_field(&rec.key)))
                })
            })
            .collect();
        let mut removed = 0;
        for id in doomed {
            if table.remove_doc(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
