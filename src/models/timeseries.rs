//! Timeseries readings, statistical windows, and changed-range results.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::uot::UnitOfTime;

/// A single numeric reading. Time is always nanoseconds since the epoch;
/// `unit` records the producer's intended display scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesReading {
    #[serde(rename = "Time")]
    pub time: i64,
    #[serde(rename = "Unit")]
    pub unit: UnitOfTime,
    #[serde(rename = "Value")]
    pub value: f64,
}

/// Readings for one stream, tagged with the engine generation observed at
/// read (or produced by the write).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeseries {
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    #[serde(rename = "Generation")]
    pub generation: u64,
    #[serde(rename = "Records")]
    pub records: Vec<TimeseriesReading>,
}

/// Statistical summary of one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticsReading {
    #[serde(rename = "Time")]
    pub time: i64,
    #[serde(rename = "Min")]
    pub min: f64,
    #[serde(rename = "Mean")]
    pub mean: f64,
    #[serde(rename = "Max")]
    pub max: f64,
    #[serde(rename = "Count")]
    pub count: u64,
}

/// Windowed statistics for one stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticTimeseries {
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    #[serde(rename = "Generation")]
    pub generation: u64,
    #[serde(rename = "Records")]
    pub records: Vec<StatisticsReading>,
}

/// A half-open time range attributed to a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(rename = "StartTime")]
    pub start_time: i64,
    #[serde(rename = "EndTime")]
    pub end_time: i64,
    #[serde(rename = "Generation")]
    pub generation: u64,
}

/// Ranges of one stream that changed between two generations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangedRange {
    #[serde(rename = "UUID")]
    pub uuid: Uuid,
    #[serde(rename = "Ranges")]
    pub ranges: Vec<TimeRange>,
}
