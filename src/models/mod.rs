//! Canonical in-memory representations shared across the archiver:
//! metadata records, timeseries readings, statistical roll-ups, and the
//! unit-of-time scale attached to producer timestamps.

pub mod metadata;
pub mod timeseries;
pub mod uot;

pub use metadata::{MetadataGroup, MetadataRecord, Predicate, RecordValue, WhereClause};
pub use timeseries::{
    ChangedRange, StatisticTimeseries, StatisticsReading, TimeRange, Timeseries,
    TimeseriesReading,
};
pub use uot::UnitOfTime;
