//! The columnar timeseries-engine seam.
//!
//! Mirrors the shape of a generation-versioned point store: streams are
//! addressed by UUID within a collection, reads are served as a lazy point
//! sequence plus a generation and a terminal error token, and every
//! mutation bumps the stream generation. [`memory::MemoryEngine`] is the
//! in-process implementation; a network client would implement the same
//! pair of traits.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Largest representable timestamp, in nanoseconds.
pub const MAXIMUM_TIME: i64 = 48 << 56;

/// A raw point: nanosecond timestamp and value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub time: i64,
    pub value: f64,
}

/// Statistical summary of one window starting at `time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatPoint {
    pub time: i64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub count: u64,
}

/// A half-open range touched between two generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeRange {
    pub start: i64,
    pub end: i64,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no stream with uuid {0}")]
    NoSuchStream(Uuid),

    #[error("stream {0} already exists")]
    StreamExists(Uuid),

    #[error("no point in the requested direction")]
    NoSuchPoint,

    #[error("annotation version conflict: expected {expected}, found {found}")]
    AnnotationConflict { expected: u64, found: u64 },

    #[error("engine disconnected")]
    Disconnected,

    #[error("engine fault: {0}")]
    Fault(String),
}

/// Raw-value read: the point channel MUST be fully drained before the
/// version and error tokens are awaited, or the producer stalls.
pub struct ValueStream {
    pub points: mpsc::Receiver<RawPoint>,
    pub version: oneshot::Receiver<u64>,
    pub error: oneshot::Receiver<Result<(), EngineError>>,
}

/// Windowed read; same drain discipline as [`ValueStream`].
pub struct StatStream {
    pub points: mpsc::Receiver<StatPoint>,
    pub version: oneshot::Receiver<u64>,
    pub error: oneshot::Receiver<Result<(), EngineError>>,
}

/// Changed-range read; same drain discipline.
pub struct ChangeStream {
    pub ranges: mpsc::Receiver<ChangeRange>,
    pub error: oneshot::Receiver<Result<(), EngineError>>,
}

/// A handle to one stream. Handles may be constructed for UUIDs that do not
/// exist yet; `exists` distinguishes.
#[async_trait]
pub trait EngineStream: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn exists(&self) -> Result<bool, EngineError>;

    /// Bulk insert; returns the generation produced by the write.
    async fn insert(&self, points: &[RawPoint]) -> Result<u64, EngineError>;

    /// Current stream generation.
    async fn version(&self) -> Result<u64, EngineError>;

    /// Raw points with `start <= time < end`, in time order.
    async fn raw_values(&self, start: i64, end: i64) -> ValueStream;

    /// Power-of-two aligned windows, each `2^pointwidth` ns long. The bottom
    /// `pointwidth` bits of `start` and `end` are cleared; windows whose
    /// start lies in `[start, end)` are returned; empty windows are omitted.
    async fn aligned_windows(&self, start: i64, end: i64, pointwidth: u8) -> StatStream;

    /// Arbitrary-width windows. If `(end - start)` is not a multiple of
    /// `width`, `end` is lowered to `start + width * ((end - start) / width)`.
    async fn windows(&self, start: i64, end: i64, width: u64) -> StatStream;

    /// Nearest point strictly before `time` (backwards) or at/after `time`
    /// (forwards), with the generation observed.
    async fn nearest(&self, time: i64, backwards: bool) -> Result<(RawPoint, u64), EngineError>;

    /// Ranges that changed between two generations, accurate to
    /// `2^resolution` ns.
    async fn changes(&self, from_gen: u64, to_gen: u64, resolution: u8) -> ChangeStream;

    /// Delete points in `[start, end)`; returns the new generation.
    async fn delete_range(&self, start: i64, end: i64) -> Result<u64, EngineError>;

    /// Current annotations and their version.
    async fn annotations(&self) -> Result<(HashMap<String, String>, u64), EngineError>;

    /// Compare-and-set annotation update against `expected` version.
    async fn compare_and_set_annotation(
        &self,
        expected: u64,
        updates: HashMap<String, String>,
    ) -> Result<(), EngineError>;
}

/// Connection-level operations.
#[async_trait]
pub trait TimeseriesEngine: Send + Sync {
    /// A handle for the UUID, whether or not the stream exists.
    fn stream_from_uuid(&self, uuid: Uuid) -> Arc<dyn EngineStream>;

    /// Create a stream in `collection` with the given tags.
    async fn create(
        &self,
        uuid: Uuid,
        collection: &str,
        tags: HashMap<String, String>,
    ) -> Result<Arc<dyn EngineStream>, EngineError>;

    async fn disconnect(&self) -> Result<(), EngineError>;
}
