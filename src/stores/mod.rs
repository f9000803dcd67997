//! Store adapters: the metadata document store (C2) and the timeseries
//! store (C3), consumed by the view manager and the query evaluator through
//! these traits.

pub mod memdoc;
pub mod timeseries;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::EngineError;
use crate::models::{
    ChangedRange, MetadataGroup, MetadataRecord, StatisticTimeseries, Timeseries, UnitOfTime,
    WhereClause,
};

pub use memdoc::MemDocStore;
pub use timeseries::StreamStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Sentinel distinguishing "must create" from real I/O failures.
    #[error("stream does not exist")]
    StreamNotExist,

    #[error("no stream named {0}")]
    NotFound(Uuid),

    #[error("engine deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("could not create index on {0}")]
    IndexCreation(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage fault: {0}")]
    Fault(String),
}

/// Document CRUD with upsert semantics keyed on (Key, SrcURI).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Upsert each record; empty input is a no-op.
    async fn save(&self, records: &[MetadataRecord]) -> Result<(), StoreError>;

    /// Records matching `where`, projected onto `tags` (empty selects all
    /// fields). The backend's internal document id is never included.
    async fn get_metadata(
        &self,
        tags: &[String],
        where_: &WhereClause,
    ) -> Result<MetadataGroup, StoreError>;

    /// Distinct values of `tag` among records matching `where`.
    async fn get_distinct(
        &self,
        tag: &str,
        where_: &WhereClause,
    ) -> Result<Vec<String>, StoreError>;

    /// Stored unit of time for the stream, defaulting to seconds when unset.
    /// Fails with not-found when no document references the UUID.
    async fn get_unit_of_time(&self, uuid: Uuid) -> Result<UnitOfTime, StoreError>;

    /// Delete matching records, scoped to the projected tags. Returns the
    /// number of documents removed.
    async fn remove(&self, tags: &[String], where_: &WhereClause) -> Result<usize, StoreError>;
}

/// Stream lifecycle plus reads/writes over (UUID, time).
#[async_trait]
pub trait TimeseriesStore: Send + Sync {
    async fn register_stream(
        &self,
        uuid: Uuid,
        uri: &str,
        name: &str,
        unit: &str,
    ) -> Result<(), StoreError>;

    async fn stream_exists(&self, uuid: Uuid) -> Result<bool, StoreError>;

    async fn add_readings(&self, readings: &Timeseries) -> Result<(), StoreError>;

    async fn get_data(
        &self,
        uuids: &[Uuid],
        start: i64,
        end: i64,
    ) -> Result<Vec<Timeseries>, StoreError>;

    async fn statistical_data(
        &self,
        uuids: &[Uuid],
        pointwidth: u8,
        start: i64,
        end: i64,
    ) -> Result<Vec<StatisticTimeseries>, StoreError>;

    async fn window_data(
        &self,
        uuids: &[Uuid],
        width: u64,
        start: i64,
        end: i64,
    ) -> Result<Vec<StatisticTimeseries>, StoreError>;

    async fn prev(&self, uuids: &[Uuid], before: i64) -> Result<Vec<Timeseries>, StoreError>;

    async fn next(&self, uuids: &[Uuid], after: i64) -> Result<Vec<Timeseries>, StoreError>;

    async fn changed_ranges(
        &self,
        uuids: &[Uuid],
        from_gen: u64,
        to_gen: u64,
        resolution: u8,
    ) -> Result<Vec<ChangedRange>, StoreError>;

    async fn delete_data(&self, uuids: &[Uuid], start: i64, end: i64) -> Result<(), StoreError>;

    /// Merge annotation updates via compare-and-set against the current
    /// version; keys are lower-cased. A failed CAS surfaces as a conflict
    /// and is not retried.
    async fn add_annotations(
        &self,
        uuid: Uuid,
        updates: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Current annotations and their version.
    async fn annotations(&self, uuid: Uuid) -> Result<(HashMap<String, String>, u64), StoreError>;

    /// Current generation of the stream.
    async fn current_generation(&self, uuid: Uuid) -> Result<u64, StoreError>;

    /// True iff `time` converted to nanoseconds lies in `[0, MAXIMUM_TIME]`.
    fn valid_timestamp(&self, time: i64, unit: UnitOfTime) -> bool;

    async fn disconnect(&self) -> Result<(), StoreError>;
}
