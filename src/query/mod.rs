//! The query evaluator: translates parsed queries into metadata-store and
//! timeseries-store calls, gated per stream by the dot master, and
//! composes the reply payload set.

pub mod ast;

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::dots::DotMaster;
use crate::fabric::Access;
use crate::models::{
    ChangedRange, MetadataGroup, MetadataRecord, RecordValue, StatisticTimeseries, Timeseries,
    WhereClause,
};
use crate::stores::{MetadataStore, StoreError, TimeseriesStore};

pub use ast::{DataParams, DataSelector, DataShape, ParsedQuery};

/// Position-annotated parse failure from the external query parser.
#[derive(Debug, Error)]
#[error("error ({message}) in query at {pos}")]
pub struct ParseError {
    pub message: String,
    pub pos: usize,
}

/// The query-language parser seam. The parser is consumed as a black box
/// emitting tagged variants.
pub trait QueryParser: Send + Sync {
    fn parse(&self, query: &str) -> Result<ParsedQuery, ParseError>;
}

impl<F> QueryParser for F
where
    F: Fn(&str) -> Result<ParsedQuery, ParseError> + Send + Sync,
{
    fn parse(&self, query: &str) -> Result<ParsedQuery, ParseError> {
        self(query)
    }
}

#[derive(Debug, Error)]
pub enum QueryEvalError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The composed result set for one query. At most one of the vectors is
/// non-empty per variant, but replies may legally carry several groups.
#[derive(Debug, Default)]
pub struct QueryResults {
    pub metadata: Vec<MetadataGroup>,
    pub timeseries: Vec<Timeseries>,
    pub statistics: Vec<StatisticTimeseries>,
    pub changed: Vec<ChangedRange>,
}

pub struct QueryEvaluator {
    md: Arc<dyn MetadataStore>,
    ts: Arc<dyn TimeseriesStore>,
    gate: Arc<DotMaster>,
}

impl QueryEvaluator {
    pub fn new(
        md: Arc<dyn MetadataStore>,
        ts: Arc<dyn TimeseriesStore>,
        gate: Arc<DotMaster>,
    ) -> Self {
        QueryEvaluator { md, ts, gate }
    }

    /// Evaluate a parsed query on behalf of `vk`. All-or-nothing: any store
    /// failure aborts the whole query.
    pub async fn evaluate(
        &self,
        vk: &str,
        query: ParsedQuery,
    ) -> Result<QueryResults, QueryEvalError> {
        match query {
            ParsedQuery::Select { tags, where_clause } => {
                let group = self.select_tags(vk, &tags, &where_clause).await?;
                Ok(QueryResults {
                    metadata: if group.is_empty() { Vec::new() } else { vec![group] },
                    ..QueryResults::default()
                })
            }
            ParsedQuery::Distinct { tag, where_clause } => {
                let values = self.distinct_tag(vk, &tag, &where_clause).await?;
                let record = MetadataRecord {
                    key: tag,
                    value: RecordValue::List(values),
                    src_uri: String::new(),
                    path: String::new(),
                    uuid: None,
                    unit_of_time: None,
                };
                Ok(QueryResults {
                    metadata: vec![MetadataGroup {
                        records: vec![record],
                    }],
                    ..QueryResults::default()
                })
            }
            ParsedQuery::Data(params) => self.select_data(vk, params).await,
        }
    }

    /// Fetch records for the tags, dropping any record whose SrcURI the
    /// requester cannot read. The permission state consulted is the current
    /// one, not the state at ingestion time.
    async fn select_tags(
        &self,
        vk: &str,
        tags: &[String],
        where_clause: &WhereClause,
    ) -> Result<MetadataGroup, QueryEvalError> {
        // fetch SrcURI alongside the projection so the gate has something
        // to check, then blank it back out if it was not requested
        let mut fetch_tags = tags.to_vec();
        let fields_only = !tags.is_empty()
            && tags
                .iter()
                .all(|t| crate::models::metadata::is_record_field(t));
        let srcuri_requested = !fields_only
            || tags.iter().any(|t| t.eq_ignore_ascii_case("srcuri"));
        if !srcuri_requested {
            fetch_tags.push("SrcURI".to_owned());
        }
        let fetched = self.md.get_metadata(&fetch_tags, where_clause).await?;
        let mut records = Vec::with_capacity(fetched.records.len());
        for mut rec in fetched.records {
            if !self.gate.can(vk, &rec.src_uri, Access::Read).await {
                continue;
            }
            if !srcuri_requested {
                rec.src_uri = String::new();
            }
            records.push(rec);
        }
        Ok(MetadataGroup { records })
    }

    async fn distinct_tag(
        &self,
        vk: &str,
        tag: &str,
        where_clause: &WhereClause,
    ) -> Result<Vec<String>, QueryEvalError> {
        // evaluated record by record rather than via the backend's distinct
        // so each contributing record passes the gate
        let fetched = self.md.get_metadata(&[], where_clause).await?;
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for rec in fetched.records {
            if !self.gate.can(vk, &rec.src_uri, Access::Read).await {
                continue;
            }
            if let Some(value) = rec.field(tag) {
                if seen.insert(value.clone()) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }

    /// The streams the where clause selects, filtered to those the
    /// requester may read. Forbidden UUIDs are dropped silently.
    async fn resolve_streams(
        &self,
        vk: &str,
        where_clause: &WhereClause,
    ) -> Result<Vec<Uuid>, QueryEvalError> {
        let tags = ["UUID".to_owned(), "Path".to_owned()];
        let group = self.md.get_metadata(&tags, where_clause).await?;
        let mut seen = HashSet::new();
        let mut allowed = Vec::new();
        for rec in &group.records {
            let Some(uuid) = rec.uuid else {
                continue;
            };
            if !seen.insert(uuid) {
                continue;
            }
            if self.gate.can(vk, &rec.path, Access::Read).await {
                allowed.push(uuid);
            } else {
                debug!(%uuid, path = rec.path, "dropping forbidden stream from query");
            }
        }
        Ok(allowed)
    }

    async fn select_data(
        &self,
        vk: &str,
        params: DataParams,
    ) -> Result<QueryResults, QueryEvalError> {
        let uuids = self.resolve_streams(vk, &params.where_clause).await?;
        let mut results = QueryResults::default();
        match params.shape {
            DataShape::Raw => {
                results.timeseries = match params.selector {
                    DataSelector::In { start, end } => self.ts.get_data(&uuids, start, end).await?,
                    DataSelector::Before(t) => self.ts.prev(&uuids, t).await?,
                    DataSelector::After(t) => self.ts.next(&uuids, t).await?,
                };
            }
            DataShape::Statistical { pointwidth } => {
                let (start, end) = in_bounds(params.selector);
                results.statistics = self
                    .ts
                    .statistical_data(&uuids, pointwidth, start, end)
                    .await?;
            }
            DataShape::Window { width } => {
                let (start, end) = in_bounds(params.selector);
                results.statistics = self.ts.window_data(&uuids, width, start, end).await?;
            }
            DataShape::Changed {
                from_gen,
                to_gen,
                resolution,
            } => {
                results.changed = self
                    .ts
                    .changed_ranges(&uuids, from_gen, to_gen, resolution)
                    .await?;
            }
        }
        Ok(results)
    }
}

/// Windowed shapes only make sense over a range; a point selector
/// degenerates to the empty range at that instant.
fn in_bounds(selector: DataSelector) -> (i64, i64) {
    match selector {
        DataSelector::In { start, end } => (start, end),
        DataSelector::Before(t) | DataSelector::After(t) => (t, t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::engine::memory::MemoryEngine;
    use crate::fabric::memory::MemoryFabric;
    use crate::models::Predicate;
    use crate::stores::{MemDocStore, StreamStore};

    fn record(key: &str, value: &str, src: &str, path: &str, uuid: Option<Uuid>) -> MetadataRecord {
        MetadataRecord {
            key: key.into(),
            value: value.into(),
            src_uri: src.into(),
            path: path.into(),
            uuid,
            unit_of_time: None,
        }
    }

    async fn evaluator_with(
        records: Vec<MetadataRecord>,
        grants: &[(&str, &str)],
    ) -> QueryEvaluator {
        let md = Arc::new(MemDocStore::new().expect("indexes"));
        md.save(&records).await.expect("seed");
        let fab = MemoryFabric::new("archiver");
        for (key, pattern) in grants {
            fab.grant(key, pattern, Access::Read);
        }
        let gate = Arc::new(DotMaster::new(Arc::new(fab), Duration::from_secs(60)));
        let ts = Arc::new(StreamStore::new(Arc::new(MemoryEngine::new())));
        QueryEvaluator::new(md, ts, gate)
    }

    #[tokio::test]
    async fn select_with_no_matches_yields_no_groups() {
        let eval = evaluator_with(Vec::new(), &[]).await;
        let results = eval
            .evaluate(
                "k=",
                ParsedQuery::Select {
                    tags: vec!["uuid".into()],
                    where_clause: WhereClause::new().with("Path", Predicate::Eq("x/y".into())),
                },
            )
            .await
            .expect("evaluate");
        assert!(results.metadata.is_empty());
    }

    #[tokio::test]
    async fn distinct_only_counts_readable_records() {
        let records = vec![
            record("Building", "Soda", "a/r1", "a/r1/temp", None),
            record("Building", "Cory", "a/r2", "a/r2/temp", None),
        ];
        let eval = evaluator_with(records, &[("k=", "a/r1/*")]).await;
        let results = eval
            .evaluate(
                "k=",
                ParsedQuery::Distinct {
                    tag: "Value".into(),
                    where_clause: WhereClause::new()
                        .with("Key", Predicate::Eq("Building".into())),
                },
            )
            .await
            .expect("evaluate");
        let rec = &results.metadata[0].records[0];
        assert_eq!(rec.value, RecordValue::List(vec!["Soda".into()]));
    }

    #[tokio::test]
    async fn forbidden_uuids_drop_without_error() {
        let u1 = Uuid::from_u128(1);
        let u2 = Uuid::from_u128(2);
        let records = vec![
            record("Path", "a/r1/temp", "a/r1/temp", "a/r1/temp", Some(u1)),
            record("Path", "a/r2/temp", "a/r2/temp", "a/r2/temp", Some(u2)),
        ];
        let eval = evaluator_with(records, &[("k=", "a/r1/*")]).await;
        let uuids = eval
            .resolve_streams(
                "k=",
                &WhereClause::new().with("Path", Predicate::Like("a/%".into())),
            )
            .await
            .expect("resolve");
        assert_eq!(uuids, vec![u1]);
    }
}
