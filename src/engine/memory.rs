//! In-process timeseries engine with generation-versioned streams.
//!
//! Points live in a per-stream ordered map; every mutation bumps the
//! stream generation and records the touched range, which is what
//! changed-range reads diff. Reads are served through bounded channels by a
//! producer task, preserving the drain-before-error discipline of the
//! network engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::engine::{
    ChangeRange, ChangeStream, EngineError, EngineStream, RawPoint, StatPoint, StatStream,
    TimeseriesEngine, ValueStream,
};

const READ_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy)]
struct PointRec {
    value: f64,
    gen: u64,
}

#[derive(Default)]
struct StreamState {
    #[allow(dead_code)]
    collection: String,
    #[allow(dead_code)]
    tags: HashMap<String, String>,
    points: BTreeMap<i64, PointRec>,
    generation: u64,
    mutations: Vec<ChangeRange>,
    annotations: HashMap<String, String>,
    ann_version: u64,
}

#[derive(Default)]
struct EngineInner {
    streams: HashMap<Uuid, StreamState>,
    closed: bool,
}

/// Shared in-process engine; cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Mutex<EngineInner>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryStream {
    uuid: Uuid,
    // Weak by design: a cached handle must not keep a disconnected engine
    // alive.
    inner: Weak<Mutex<EngineInner>>,
}

impl MemoryStream {
    fn with_stream<T>(
        &self,
        f: impl FnOnce(&mut StreamState) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let inner = self.inner.upgrade().ok_or(EngineError::Disconnected)?;
        let mut guard = inner.lock();
        if guard.closed {
            return Err(EngineError::Disconnected);
        }
        let state = guard
            .streams
            .get_mut(&self.uuid)
            .ok_or(EngineError::NoSuchStream(self.uuid))?;
        f(state)
    }

    /// Snapshot points in `[start, end)` plus the generation. A reversed
    /// range is empty.
    fn snapshot(&self, start: i64, end: i64) -> Result<(Vec<RawPoint>, u64), EngineError> {
        self.with_stream(|s| {
            let pts = if start < end {
                s.points
                    .range(start..end)
                    .map(|(t, p)| RawPoint {
                        time: *t,
                        value: p.value,
                    })
                    .collect()
            } else {
                Vec::new()
            };
            Ok((pts, s.generation))
        })
    }
}

fn window_stats(points: &[RawPoint], start: i64, end: i64) -> Option<StatPoint> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0u64;
    for p in points {
        if p.time < start || p.time >= end {
            continue;
        }
        min = min.min(p.value);
        max = max.max(p.value);
        sum += p.value;
        count += 1;
    }
    (count > 0).then(|| StatPoint {
        time: start,
        min,
        mean: sum / count as f64,
        max,
        count,
    })
}

fn spawn_stat_producer(stats: Vec<StatPoint>, generation: u64) -> StatStream {
    let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
    let (vtx, vrx) = oneshot::channel();
    let (etx, erx) = oneshot::channel();
    tokio::spawn(async move {
        for p in stats {
            if tx.send(p).await.is_err() {
                break;
            }
        }
        let _ = vtx.send(generation);
        let _ = etx.send(Ok(()));
    });
    StatStream {
        points: rx,
        version: vrx,
        error: erx,
    }
}

fn failed_stat_stream(err: EngineError) -> StatStream {
    let (_tx, rx) = mpsc::channel(1);
    let (vtx, vrx) = oneshot::channel();
    let (etx, erx) = oneshot::channel();
    let _ = vtx.send(0);
    let _ = etx.send(Err(err));
    StatStream {
        points: rx,
        version: vrx,
        error: erx,
    }
}

#[async_trait]
impl EngineStream for MemoryStream {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn exists(&self) -> Result<bool, EngineError> {
        let inner = self.inner.upgrade().ok_or(EngineError::Disconnected)?;
        let guard = inner.lock();
        if guard.closed {
            return Err(EngineError::Disconnected);
        }
        Ok(guard.streams.contains_key(&self.uuid))
    }

    async fn insert(&self, points: &[RawPoint]) -> Result<u64, EngineError> {
        self.with_stream(|s| {
            if points.is_empty() {
                return Ok(s.generation);
            }
            let gen = s.generation + 1;
            let mut lo = i64::MAX;
            let mut hi = i64::MIN;
            for p in points {
                lo = lo.min(p.time);
                hi = hi.max(p.time);
                s.points.insert(p.time, PointRec { value: p.value, gen });
            }
            s.mutations.push(ChangeRange {
                start: lo,
                end: hi.saturating_add(1),
                version: gen,
            });
            s.generation = gen;
            Ok(gen)
        })
    }

    async fn version(&self) -> Result<u64, EngineError> {
        self.with_stream(|s| Ok(s.generation))
    }

    async fn raw_values(&self, start: i64, end: i64) -> ValueStream {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
        let (vtx, vrx) = oneshot::channel();
        let (etx, erx) = oneshot::channel();
        match self.snapshot(start, end) {
            Ok((points, generation)) => {
                tokio::spawn(async move {
                    for p in points {
                        if tx.send(p).await.is_err() {
                            break;
                        }
                    }
                    let _ = vtx.send(generation);
                    let _ = etx.send(Ok(()));
                });
            }
            Err(e) => {
                let _ = vtx.send(0);
                let _ = etx.send(Err(e));
            }
        }
        ValueStream {
            points: rx,
            version: vrx,
            error: erx,
        }
    }

    async fn aligned_windows(&self, start: i64, end: i64, pointwidth: u8) -> StatStream {
        if pointwidth >= 62 {
            return failed_stat_stream(EngineError::Fault(format!(
                "pointwidth {pointwidth} out of range"
            )));
        }
        let width = 1i64 << pointwidth;
        let mask = !(width - 1);
        let start = start & mask;
        let end = end & mask;
        match self.snapshot(start, end.saturating_add(width)) {
            Ok((points, generation)) => {
                let mut stats = Vec::new();
                let mut w = start;
                while w < end {
                    if let Some(sp) = window_stats(&points, w, w.saturating_add(width)) {
                        stats.push(sp);
                    }
                    w = match w.checked_add(width) {
                        Some(next) => next,
                        None => break,
                    };
                }
                spawn_stat_producer(stats, generation)
            }
            Err(e) => failed_stat_stream(e),
        }
    }

    async fn windows(&self, start: i64, end: i64, width: u64) -> StatStream {
        if width == 0 || width > i64::MAX as u64 {
            return failed_stat_stream(EngineError::Fault(format!("bad window width {width}")));
        }
        let width = width as i64;
        if end <= start {
            return match self.with_stream(|s| Ok(s.generation)) {
                Ok(gen) => spawn_stat_producer(Vec::new(), gen),
                Err(e) => failed_stat_stream(e),
            };
        }
        let end = start + width * ((end - start) / width);
        match self.snapshot(start, end) {
            Ok((points, generation)) => {
                let mut stats = Vec::new();
                let mut w = start;
                while w < end {
                    if let Some(sp) = window_stats(&points, w, w + width) {
                        stats.push(sp);
                    }
                    w += width;
                }
                spawn_stat_producer(stats, generation)
            }
            Err(e) => failed_stat_stream(e),
        }
    }

    async fn nearest(&self, time: i64, backwards: bool) -> Result<(RawPoint, u64), EngineError> {
        self.with_stream(|s| {
            let found = if backwards {
                s.points.range(..time).next_back()
            } else {
                s.points.range(time..).next()
            };
            match found {
                Some((t, p)) => Ok((
                    RawPoint {
                        time: *t,
                        value: p.value,
                    },
                    s.generation,
                )),
                None => Err(EngineError::NoSuchPoint),
            }
        })
    }

    async fn changes(&self, from_gen: u64, to_gen: u64, resolution: u8) -> ChangeStream {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_DEPTH);
        let (etx, erx) = oneshot::channel();
        let resolution = resolution.min(48);
        let collected = self.with_stream(|s| {
            let mask = if resolution == 0 {
                !0i64
            } else {
                !((1i64 << resolution) - 1)
            };
            let step = 1i64 << resolution;
            let mut ranges: Vec<ChangeRange> = s
                .mutations
                .iter()
                .filter(|m| m.version > from_gen && m.version <= to_gen)
                .map(|m| ChangeRange {
                    start: m.start & mask,
                    end: (m.end.saturating_add(step - 1)) & mask,
                    version: m.version,
                })
                .collect();
            ranges.sort_by_key(|r| r.start);
            // coalesce overlapping / adjacent ranges
            let mut merged: Vec<ChangeRange> = Vec::new();
            for r in ranges {
                match merged.last_mut() {
                    Some(last) if r.start <= last.end => {
                        last.end = last.end.max(r.end);
                        last.version = last.version.max(r.version);
                    }
                    _ => merged.push(r),
                }
            }
            Ok(merged)
        });
        match collected {
            Ok(merged) => {
                tokio::spawn(async move {
                    for r in merged {
                        if tx.send(r).await.is_err() {
                            break;
                        }
                    }
                    let _ = etx.send(Ok(()));
                });
            }
            Err(e) => {
                let _ = etx.send(Err(e));
            }
        }
        ChangeStream {
            ranges: rx,
            error: erx,
        }
    }

    async fn delete_range(&self, start: i64, end: i64) -> Result<u64, EngineError> {
        self.with_stream(|s| {
            if end <= start {
                return Ok(s.generation);
            }
            let doomed: Vec<i64> = s.points.range(start..end).map(|(t, _)| *t).collect();
            let gen = s.generation + 1;
            for t in &doomed {
                s.points.remove(t);
            }
            s.mutations.push(ChangeRange {
                start,
                end,
                version: gen,
            });
            s.generation = gen;
            Ok(gen)
        })
    }

    async fn annotations(&self) -> Result<(HashMap<String, String>, u64), EngineError> {
        self.with_stream(|s| Ok((s.annotations.clone(), s.ann_version)))
    }

    async fn compare_and_set_annotation(
        &self,
        expected: u64,
        updates: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        self.with_stream(|s| {
            if s.ann_version != expected {
                return Err(EngineError::AnnotationConflict {
                    expected,
                    found: s.ann_version,
                });
            }
            s.annotations.extend(updates);
            s.ann_version += 1;
            Ok(())
        })
    }
}

#[async_trait]
impl TimeseriesEngine for MemoryEngine {
    fn stream_from_uuid(&self, uuid: Uuid) -> Arc<dyn EngineStream> {
        Arc::new(MemoryStream {
            uuid,
            inner: Arc::downgrade(&self.inner),
        })
    }

    async fn create(
        &self,
        uuid: Uuid,
        collection: &str,
        tags: HashMap<String, String>,
    ) -> Result<Arc<dyn EngineStream>, EngineError> {
        {
            let mut guard = self.inner.lock();
            if guard.closed {
                return Err(EngineError::Disconnected);
            }
            if guard.streams.contains_key(&uuid) {
                return Err(EngineError::StreamExists(uuid));
            }
            guard.streams.insert(
                uuid,
                StreamState {
                    collection: collection.to_owned(),
                    tags,
                    ..StreamState::default()
                },
            );
        }
        Ok(self.stream_from_uuid(uuid))
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}
