//! Timeseries store adapter over a [`TimeseriesEngine`].
//!
//! Owns the stream-handle cache and the per-call deadline; value and
//! statistics channels are always drained to completion before the error
//! token is inspected, so the engine-side producer is never leaked.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::{self, EngineError, EngineStream, RawPoint, TimeseriesEngine};
use crate::models::uot::convert_time;
use crate::models::{
    ChangedRange, StatisticTimeseries, StatisticsReading, TimeRange, Timeseries,
    TimeseriesReading, UnitOfTime,
};
use crate::stats;
use crate::stores::{StoreError, TimeseriesStore};

/// Deadline applied to every engine call.
pub const ENGINE_DEADLINE: Duration = Duration::from_secs(60);

/// Decrements the in-flight write counter when dropped, so the release
/// happens on every exit path. Counts individual readings.
struct WriteGuard(i64);

impl WriteGuard {
    fn enter(readings: i64) -> Self {
        stats::CURRENT_WRITES.fetch_add(readings, Ordering::Relaxed);
        WriteGuard(readings)
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        stats::CURRENT_WRITES.fetch_sub(self.0, Ordering::Relaxed);
    }
}

async fn with_deadline<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(ENGINE_DEADLINE, fut).await {
        Ok(res) => res.map_err(StoreError::from),
        Err(_) => Err(StoreError::DeadlineExceeded(ENGINE_DEADLINE)),
    }
}

/// The timeseries store adapter.
pub struct StreamStore {
    engine: Arc<dyn TimeseriesEngine>,
    // Read-mostly; writers only on miss-fill. The cache holds handles, not
    // stream lifetimes: on engine reconnect it is simply cleared.
    cache: RwLock<HashMap<Uuid, Arc<dyn EngineStream>>>,
}

impl StreamStore {
    pub fn new(engine: Arc<dyn TimeseriesEngine>) -> Self {
        StreamStore {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the stream handle: cache first, then the engine. A missing
    /// stream yields [`StoreError::StreamNotExist`] and is never cached.
    async fn get_stream(&self, uuid: Uuid) -> Result<Arc<dyn EngineStream>, StoreError> {
        if let Some(stream) = self.cache.read().get(&uuid) {
            return Ok(Arc::clone(stream));
        }
        let stream = self.engine.stream_from_uuid(uuid);
        if with_deadline(stream.exists()).await? {
            self.cache.write().insert(uuid, Arc::clone(&stream));
            return Ok(stream);
        }
        Err(StoreError::StreamNotExist)
    }

    /// Resolve the UUIDs that name actual streams, skipping the rest.
    async fn uuids_to_streams(&self, uuids: &[Uuid]) -> Vec<Arc<dyn EngineStream>> {
        let mut streams = Vec::with_capacity(uuids.len());
        for &id in uuids {
            match self.get_stream(id).await {
                Ok(s) => streams.push(s),
                Err(StoreError::StreamNotExist) => continue,
                Err(e) => error!(uuid = %id, error = %e, "could not resolve stream"),
            }
        }
        streams
    }

    async fn nearest_batch(
        &self,
        uuids: &[Uuid],
        time: i64,
        backwards: bool,
    ) -> Result<Vec<Timeseries>, StoreError> {
        let mut results = Vec::new();
        for stream in self.uuids_to_streams(uuids).await {
            match with_deadline(stream.nearest(time, backwards)).await {
                Ok((point, generation)) => results.push(Timeseries {
                    uuid: stream.uuid(),
                    generation,
                    records: vec![TimeseriesReading {
                        time: point.time,
                        unit: UnitOfTime::Nanoseconds,
                        value: point.value,
                    }],
                }),
                // a stream with no point in that direction contributes nothing
                Err(StoreError::Engine(EngineError::NoSuchPoint)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl TimeseriesStore for StreamStore {
    async fn register_stream(
        &self,
        uuid: Uuid,
        uri: &str,
        name: &str,
        unit: &str,
    ) -> Result<(), StoreError> {
        info!(%uuid, uri, name, unit, "initializing timeseries stream");
        let tags = HashMap::from([
            ("name".to_owned(), name.to_owned()),
            ("unit".to_owned(), unit.to_owned()),
        ]);
        match tokio::time::timeout(ENGINE_DEADLINE, self.engine.create(uuid, uri, tags)).await {
            Ok(Ok(stream)) => {
                self.cache.write().insert(uuid, stream);
                Ok(())
            }
            // lost a creation race; the stream is there, which is what we want
            Ok(Err(EngineError::StreamExists(_))) => {
                let stream = self.engine.stream_from_uuid(uuid);
                self.cache.write().insert(uuid, stream);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(StoreError::DeadlineExceeded(ENGINE_DEADLINE)),
        }
    }

    async fn stream_exists(&self, uuid: Uuid) -> Result<bool, StoreError> {
        match self.get_stream(uuid).await {
            Ok(_) => Ok(true),
            Err(StoreError::StreamNotExist) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn add_readings(&self, readings: &Timeseries) -> Result<(), StoreError> {
        let stream = self.get_stream(readings.uuid).await?;
        let _guard = WriteGuard::enter(readings.records.len() as i64);
        let points: Vec<RawPoint> = readings
            .records
            .iter()
            .map(|r| RawPoint {
                time: r.time,
                value: r.value,
            })
            .collect();
        with_deadline(stream.insert(&points)).await?;
        stats::COMPLETED_WRITES.fetch_add(readings.records.len() as i64, Ordering::Relaxed);
        Ok(())
    }

    async fn get_data(
        &self,
        uuids: &[Uuid],
        start: i64,
        end: i64,
    ) -> Result<Vec<Timeseries>, StoreError> {
        let mut results = Vec::new();
        for stream in self.uuids_to_streams(uuids).await {
            let drained = tokio::time::timeout(ENGINE_DEADLINE, async {
                let mut vs = stream.raw_values(start, end).await;
                let mut ts = Timeseries {
                    uuid: stream.uuid(),
                    ..Timeseries::default()
                };
                // must consume every point before version and error
                while let Some(point) = vs.points.recv().await {
                    ts.records.push(TimeseriesReading {
                        time: point.time,
                        unit: UnitOfTime::Nanoseconds,
                        value: point.value,
                    });
                }
                ts.generation = vs.version.await.unwrap_or(0);
                match vs.error.await {
                    Ok(Ok(())) => Ok(ts),
                    Ok(Err(e)) => Err(StoreError::from(e)),
                    Err(_) => Err(StoreError::Fault("engine read aborted".into())),
                }
            })
            .await
            .map_err(|_| StoreError::DeadlineExceeded(ENGINE_DEADLINE))??;
            results.push(drained);
        }
        Ok(results)
    }

    async fn statistical_data(
        &self,
        uuids: &[Uuid],
        pointwidth: u8,
        start: i64,
        end: i64,
    ) -> Result<Vec<StatisticTimeseries>, StoreError> {
        let mut results = Vec::new();
        for stream in self.uuids_to_streams(uuids).await {
            let drained = tokio::time::timeout(ENGINE_DEADLINE, async {
                let ss = stream.aligned_windows(start, end, pointwidth).await;
                drain_stat_stream(stream.uuid(), ss).await
            })
            .await
            .map_err(|_| StoreError::DeadlineExceeded(ENGINE_DEADLINE))??;
            results.push(drained);
        }
        Ok(results)
    }

    async fn window_data(
        &self,
        uuids: &[Uuid],
        width: u64,
        start: i64,
        end: i64,
    ) -> Result<Vec<StatisticTimeseries>, StoreError> {
        let mut results = Vec::new();
        for stream in self.uuids_to_streams(uuids).await {
            let drained = tokio::time::timeout(ENGINE_DEADLINE, async {
                let ss = stream.windows(start, end, width).await;
                drain_stat_stream(stream.uuid(), ss).await
            })
            .await
            .map_err(|_| StoreError::DeadlineExceeded(ENGINE_DEADLINE))??;
            results.push(drained);
        }
        Ok(results)
    }

    async fn prev(&self, uuids: &[Uuid], before: i64) -> Result<Vec<Timeseries>, StoreError> {
        self.nearest_batch(uuids, before, true).await
    }

    async fn next(&self, uuids: &[Uuid], after: i64) -> Result<Vec<Timeseries>, StoreError> {
        self.nearest_batch(uuids, after, false).await
    }

    async fn changed_ranges(
        &self,
        uuids: &[Uuid],
        from_gen: u64,
        to_gen: u64,
        resolution: u8,
    ) -> Result<Vec<ChangedRange>, StoreError> {
        let mut results = Vec::new();
        for stream in self.uuids_to_streams(uuids).await {
            let drained = tokio::time::timeout(ENGINE_DEADLINE, async {
                let mut cs = stream.changes(from_gen, to_gen, resolution).await;
                let mut cr = ChangedRange {
                    uuid: stream.uuid(),
                    ..ChangedRange::default()
                };
                while let Some(range) = cs.ranges.recv().await {
                    cr.ranges.push(TimeRange {
                        start_time: range.start,
                        end_time: range.end,
                        generation: range.version,
                    });
                }
                match cs.error.await {
                    Ok(Ok(())) => Ok(cr),
                    Ok(Err(e)) => Err(StoreError::from(e)),
                    Err(_) => Err(StoreError::Fault("engine read aborted".into())),
                }
            })
            .await
            .map_err(|_| StoreError::DeadlineExceeded(ENGINE_DEADLINE))??;
            results.push(drained);
        }
        Ok(results)
    }

    async fn delete_data(&self, uuids: &[Uuid], start: i64, end: i64) -> Result<(), StoreError> {
        for stream in self.uuids_to_streams(uuids).await {
            with_deadline(stream.delete_range(start, end)).await?;
        }
        Ok(())
    }

    async fn add_annotations(
        &self,
        uuid: Uuid,
        updates: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let stream = self.get_stream(uuid).await?;
        let lowered: HashMap<String, String> = updates
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        let (_, version) = with_deadline(stream.annotations()).await?;
        with_deadline(stream.compare_and_set_annotation(version, lowered)).await
    }

    async fn annotations(&self, uuid: Uuid) -> Result<(HashMap<String, String>, u64), StoreError> {
        let stream = self.get_stream(uuid).await?;
        with_deadline(stream.annotations()).await
    }

    async fn current_generation(&self, uuid: Uuid) -> Result<u64, StoreError> {
        let stream = self.get_stream(uuid).await?;
        with_deadline(stream.version()).await
    }

    fn valid_timestamp(&self, time: i64, unit: UnitOfTime) -> bool {
        match convert_time(time, unit, UnitOfTime::Nanoseconds) {
            Ok(ns) => (0..=engine::MAXIMUM_TIME).contains(&ns),
            Err(_) => false,
        }
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.cache.write().clear();
        with_deadline(self.engine.disconnect()).await
    }
}

async fn drain_stat_stream(
    uuid: Uuid,
    mut ss: crate::engine::StatStream,
) -> Result<StatisticTimeseries, StoreError> {
    let mut ts = StatisticTimeseries {
        uuid,
        ..StatisticTimeseries::default()
    };
    // must consume every point before version and error
    while let Some(point) = ss.points.recv().await {
        ts.records.push(StatisticsReading {
            time: point.time,
            min: point.min,
            mean: point.mean,
            max: point.max,
            count: point.count,
        });
    }
    ts.generation = ss.version.await.unwrap_or(0);
    match ss.error.await {
        Ok(Ok(())) => Ok(ts),
        Ok(Err(e)) => Err(StoreError::from(e)),
        Err(_) => Err(StoreError::Fault("engine read aborted".into())),
    }
}
