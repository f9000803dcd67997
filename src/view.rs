//! The view manager: one subscription per configured namespace wildcard,
//! demultiplexing inbound messages into stream registrations, timeseries
//! batches, and metadata records.
//!
//! Ordering is preserved within a single concrete URI (one subscription
//! task per namespace, one flush worker); across URIs there is no
//! guarantee. Batches move to the stores through a bounded queue, so a slow
//! engine backs pressure up into the fabric subscription.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::envelope::{self, PayloadValue};
use crate::fabric::{Fabric, Message};
use crate::models::uot::convert_time;
use crate::models::{MetadataRecord, Timeseries, TimeseriesReading, UnitOfTime};
use crate::prefix::PrefixStore;
use crate::requests::{ArchiveRequest, MetadataMode, RequestRegistry, ARCHIVE_REQUEST_SUFFIX};
use crate::stats;
use crate::stores::{MetadataStore, StoreError, TimeseriesStore};
use crate::uri;

/// Flush a per-stream batch once it holds this many readings.
const BATCH_SIZE: usize = 128;
/// Flush everything at least this often.
const BATCH_AGE: Duration = Duration::from_secs(1);
/// Depth of the bounded flush queue; when full, ingestion blocks.
const FLUSH_QUEUE_DEPTH: usize = 16;
/// Subscription retry backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Work shipped to the flush worker.
enum FlushJob {
    Readings(Timeseries),
    Metadata(Vec<MetadataRecord>),
}

/// Wire form of a published metadata record.
#[derive(Debug, Deserialize)]
struct MetadataWire {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "SrcURI")]
    src_uri: String,
}

pub struct ViewManager {
    fabric: Arc<dyn Fabric>,
    ts: Arc<dyn TimeseriesStore>,
    prefix: Arc<PrefixStore>,
    registry: Arc<RequestRegistry>,
    md: Arc<dyn MetadataStore>,
    /// Streams already initialized this process lifetime.
    seen: Mutex<HashSet<Uuid>>,
    flush_tx: mpsc::Sender<FlushJob>,
}

impl ViewManager {
    /// Build the view manager and its single flush worker. The returned
    /// pool must be joined after the subscription tasks finish so queued
    /// writes complete before disconnect.
    pub fn new(
        fabric: Arc<dyn Fabric>,
        md: Arc<dyn MetadataStore>,
        ts: Arc<dyn TimeseriesStore>,
        prefix: Arc<PrefixStore>,
        registry: Arc<RequestRegistry>,
    ) -> (Arc<Self>, crate::pool::WorkerPool) {
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_QUEUE_DEPTH);
        let pool = {
            let md = Arc::clone(&md);
            let ts = Arc::clone(&ts);
            // a single worker keeps batches for one stream in order
            crate::pool::WorkerPool::start(flush_rx, 1, move |job: FlushJob| {
                let md = Arc::clone(&md);
                let ts = Arc::clone(&ts);
                async move { run_flush(md, ts, job).await }
            })
        };
        let vm = Arc::new(ViewManager {
            fabric,
            ts,
            prefix,
            registry,
            md,
            seen: Mutex::new(HashSet::new()),
            flush_tx,
        });
        (vm, pool)
    }

    /// Subscribe to `namespace/*` and pump messages until shutdown.
    /// Fabric errors move the task to stalled and it retries with
    /// exponential backoff.
    pub fn subscribe_namespace(
        self: &Arc<Self>,
        namespace: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let vm = Arc::clone(self);
        tokio::spawn(async move {
            let pattern = format!("{}/*", uri::clean(&namespace));
            let mut backoff = BACKOFF_BASE;
            let mut batcher = Batcher::new();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match vm.fabric.subscribe(&pattern).await {
                    Ok(mut rx) => {
                        info!(namespace = %pattern, "subscription active");
                        backoff = BACKOFF_BASE;
                        let mut tick = tokio::time::interval(BATCH_AGE);
                        let stalled = loop {
                            tokio::select! {
                                msg = rx.recv() => match msg {
                                    Some(msg) => vm.process(&mut batcher, msg).await,
                                    None => break true,
                                },
                                _ = tick.tick() => {
                                    if batcher.last_flush.elapsed() >= BATCH_AGE {
                                        batcher.flush_all(&vm.flush_tx).await;
                                    }
                                }
                                _ = shutdown.changed() => {
                                    // draining: consume whatever is already
                                    // queued, then release the subscription
                                    while let Ok(msg) = rx.try_recv() {
                                        vm.process(&mut batcher, msg).await;
                                    }
                                    break false;
                                }
                            }
                        };
                        batcher.flush_all(&vm.flush_tx).await;
                        if !stalled {
                            break;
                        }
                        warn!(namespace = %pattern, "subscription lost; retrying");
                    }
                    Err(e) => {
                        warn!(namespace = %pattern, error = %e, "could not subscribe");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(BACKOFF_CEILING);
            }
            batcher.flush_all(&vm.flush_tx).await;
            info!(namespace = %pattern, "subscription drained");
        })
    }

    /// Route one inbound message.
    async fn process(&self, batcher: &mut Batcher, msg: Message) {
        let concrete = uri::clean(&msg.uri).to_owned();

        if concrete.ends_with(ARCHIVE_REQUEST_SUFFIX) {
            self.handle_archive_request(&msg);
            return;
        }

        for po in &msg.pos {
            if po.ponum == envelope::PO_METADATA {
                self.handle_metadata_record(batcher, po, &concrete).await;
            }
        }

        for request in self.registry.matching(&concrete) {
            let Some(po) = msg.po(request.po) else {
                continue;
            };
            let payload = match PayloadValue::from_po(po) {
                Ok(v) => v,
                Err(e) => {
                    debug!(uri = %concrete, error = %e, "undecodable payload object");
                    continue;
                }
            };
            let uuid = request.stream_uuid(&concrete);
            if !self.ensure_stream(&request, &concrete, uuid, batcher).await {
                continue;
            }
            if request.metadata_mode == MetadataMode::Payload {
                self.extract_payload_metadata(batcher, &request, &concrete, uuid, &payload);
            }
            self.extract_reading(batcher, &request, uuid, &payload).await;
            if batcher.stream_len(uuid) >= BATCH_SIZE {
                batcher.flush_stream(uuid, &self.flush_tx).await;
            }
            if batcher.metadata.len() >= BATCH_SIZE {
                batcher.flush_metadata(&self.flush_tx).await;
            }
        }
    }

    fn handle_archive_request(&self, msg: &Message) {
        for po in &msg.pos {
            if po.ponum != envelope::PO_ARCHIVE_REQUEST {
                continue;
            }
            match ArchiveRequest::from_po(po) {
                Ok(request) => {
                    info!(pattern = %request.pattern, po = %request.po, "archive request registered");
                    self.registry.register(request);
                }
                Err(e) => warn!(uri = %msg.uri, error = %e, "bad archive request"),
            }
        }
    }

    /// A freshly published metadata record: persist it, register its URI,
    /// and materialize it onto every stream it is a prefix of.
    async fn handle_metadata_record(
        &self,
        batcher: &mut Batcher,
        po: &crate::fabric::PayloadObject,
        concrete: &str,
    ) {
        let wire: MetadataWire = match envelope::decode(po) {
            Ok(w) => w,
            Err(e) => {
                debug!(uri = %concrete, error = %e, "undecodable metadata record");
                return;
            }
        };
        let src_uri = uri::clean(&wire.src_uri).to_owned();
        if let Err(e) = self.prefix.add_metadata_uri(&src_uri) {
            error!(uri = %src_uri, error = %e, "could not register metadata uri");
            return;
        }
        batcher.metadata.push(MetadataRecord {
            key: wire.key.clone(),
            value: wire.value.clone().into(),
            src_uri: src_uri.clone(),
            path: src_uri.clone(),
            uuid: None,
            unit_of_time: None,
        });
        // propagate onto streams already live under this prefix
        let supers = match self.prefix.timeseries_superstrings(&src_uri) {
            Ok(s) => s,
            Err(e) => {
                error!(uri = %src_uri, error = %e, "could not scan timeseries superstrings");
                return;
            }
        };
        for stream_uri in supers {
            if !uri::is_prefix_of(&src_uri, &stream_uri) {
                continue;
            }
            let uuids = match self.prefix.uuids_for(&stream_uri) {
                Ok(u) => u,
                Err(e) => {
                    error!(uri = %stream_uri, error = %e, "could not resolve stream uuids");
                    continue;
                }
            };
            for uuid in uuids {
                batcher.metadata.push(MetadataRecord {
                    key: wire.key.clone(),
                    value: wire.value.clone().into(),
                    src_uri: src_uri.clone(),
                    path: stream_uri.clone(),
                    uuid: Some(uuid),
                    unit_of_time: None,
                });
            }
        }
    }

    /// First sighting of (request, URI): register the URI and UUID in the
    /// prefix index, create the engine stream if needed, and materialize
    /// inherited metadata. Returns false when the stream could not be set
    /// up (the reading is then dropped and replayed by the producer).
    async fn ensure_stream(
        &self,
        request: &ArchiveRequest,
        concrete: &str,
        uuid: Uuid,
        batcher: &mut Batcher,
    ) -> bool {
        if self.seen.lock().contains(&uuid) {
            return true;
        }
        if let Err(e) = self.prefix.add_timeseries_uri(concrete) {
            error!(uri = %concrete, error = %e, "could not register timeseries uri");
            return false;
        }
        if let Err(e) = self.prefix.add_uuid_for_uri(concrete, uuid) {
            error!(uri = %concrete, error = %e, "could not register uuid mapping");
            return false;
        }
        match self.ts.stream_exists(uuid).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self
                    .ts
                    .register_stream(uuid, concrete, &request.name, &request.unit)
                    .await
                {
                    error!(%uuid, uri = %concrete, error = %e, "could not create stream");
                    return false;
                }
            }
            Err(e) => {
                error!(%uuid, error = %e, "could not check stream existence");
                return false;
            }
        }
        stats::CURRENT_STREAMS.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().insert(uuid);

        // identity record: lets tag queries resolve this stream by Path
        batcher.metadata.push(MetadataRecord {
            key: "Path".to_owned(),
            value: concrete.into(),
            src_uri: concrete.to_owned(),
            path: concrete.to_owned(),
            uuid: Some(uuid),
            unit_of_time: Some(request.time_unit),
        });

        if request.metadata_mode == MetadataMode::Inherit {
            self.inherit_metadata(batcher, concrete, uuid).await;
        }
        true
    }

    /// Materialize every record whose SrcURI is a proper prefix of the
    /// stream URI. Records still waiting in the current batch count too, so
    /// a stream arriving right behind its metadata does not miss it.
    async fn inherit_metadata(&self, batcher: &mut Batcher, concrete: &str, uuid: Uuid) {
        use crate::models::{Predicate, RecordValue, WhereClause};
        let mut inherited: Vec<(String, RecordValue, String)> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for prefix in uri::prefixes(concrete) {
            if prefix == concrete {
                continue;
            }
            let clause = WhereClause::new().with("SrcURI", Predicate::Eq(prefix.clone()));
            match self.md.get_metadata(&[], &clause).await {
                Ok(group) => {
                    for rec in group.records {
                        if seen.insert((rec.key.clone(), prefix.clone())) {
                            inherited.push((rec.key, rec.value, prefix.clone()));
                        }
                    }
                }
                Err(e) => {
                    warn!(uri = %prefix, error = %e, "could not read inheritable metadata");
                }
            }
            for rec in &batcher.metadata {
                if rec.src_uri == prefix && seen.insert((rec.key.clone(), prefix.clone())) {
                    inherited.push((rec.key.clone(), rec.value.clone(), prefix.clone()));
                }
            }
        }
        for (key, value, src_uri) in inherited {
            batcher.metadata.push(MetadataRecord {
                key,
                value,
                src_uri,
                path: concrete.to_owned(),
                uuid: Some(uuid),
                unit_of_time: None,
            });
        }
    }

    /// Apply the value expression; a numeric yield is appended to the
    /// stream's batch.
    async fn extract_reading(
        &self,
        batcher: &mut Batcher,
        request: &ArchiveRequest,
        uuid: Uuid,
        payload: &PayloadValue,
    ) {
        let Some(value) = payload.lookup(&request.value_expr).and_then(PayloadValue::as_f64)
        else {
            return;
        };
        let time_ns = payload
            .lookup(&request.time_expr)
            .and_then(PayloadValue::as_i64)
            .and_then(|t| convert_time(t, request.time_unit, UnitOfTime::Nanoseconds).ok())
            .unwrap_or_else(|| {
                chrono::Utc::now()
                    .timestamp_nanos_opt()
                    .unwrap_or_default()
            });
        if !self.ts.valid_timestamp(time_ns, UnitOfTime::Nanoseconds) {
            debug!(%uuid, time = time_ns, "dropping reading with out-of-range timestamp");
            return;
        }
        batcher.push_reading(
            uuid,
            TimeseriesReading {
                time: time_ns,
                unit: UnitOfTime::Nanoseconds,
                value,
            },
        );
    }

    fn extract_payload_metadata(
        &self,
        batcher: &mut Batcher,
        request: &ArchiveRequest,
        concrete: &str,
        uuid: Uuid,
        payload: &PayloadValue,
    ) {
        let src_uri = request.metadata_src_uri(concrete);
        if let Err(e) = self.prefix.add_metadata_uri(&src_uri) {
            error!(uri = %src_uri, error = %e, "could not register metadata uri");
        }
        for (key, value) in payload.string_entries() {
            batcher.metadata.push(MetadataRecord {
                key,
                value: value.into(),
                src_uri: src_uri.clone(),
                path: concrete.to_owned(),
                uuid: Some(uuid),
                unit_of_time: None,
            });
        }
    }
}

struct Batcher {
    readings: HashMap<Uuid, Vec<TimeseriesReading>>,
    metadata: Vec<MetadataRecord>,
    last_flush: Instant,
}

impl Batcher {
    fn new() -> Self {
        Batcher {
            readings: HashMap::new(),
            metadata: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    fn push_reading(&mut self, uuid: Uuid, reading: TimeseriesReading) {
        self.readings.entry(uuid).or_default().push(reading);
    }

    fn stream_len(&self, uuid: Uuid) -> usize {
        self.readings.get(&uuid).map_or(0, Vec::len)
    }

    async fn flush_stream(&mut self, uuid: Uuid, tx: &mpsc::Sender<FlushJob>) {
        if let Some(records) = self.readings.remove(&uuid) {
            if records.is_empty() {
                return;
            }
            let job = FlushJob::Readings(Timeseries {
                uuid,
                generation: 0,
                records,
            });
            if tx.send(job).await.is_err() {
                error!(%uuid, "flush queue closed; dropping batch");
            }
        }
    }

    async fn flush_metadata(&mut self, tx: &mpsc::Sender<FlushJob>) {
        if self.metadata.is_empty() {
            return;
        }
        let records = std::mem::take(&mut self.metadata);
        if tx.send(FlushJob::Metadata(records)).await.is_err() {
            error!("flush queue closed; dropping metadata batch");
        }
    }

    async fn flush_all(&mut self, tx: &mpsc::Sender<FlushJob>) {
        let uuids: Vec<Uuid> = self.readings.keys().copied().collect();
        for uuid in uuids {
            self.flush_stream(uuid, tx).await;
        }
        self.flush_metadata(tx).await;
        self.last_flush = Instant::now();
    }
}

/// Commit one flush job, retrying transient store faults with backoff.
async fn run_flush(md: Arc<dyn MetadataStore>, ts: Arc<dyn TimeseriesStore>, job: FlushJob) {
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=ATTEMPTS {
        let result = match &job {
            FlushJob::Readings(batch) => ts.add_readings(batch).await,
            FlushJob::Metadata(records) => md.save(records).await,
        };
        match result {
            Ok(()) => return,
            Err(StoreError::StreamNotExist) | Err(StoreError::NotFound(_)) => {
                error!("flush against missing stream; dropping batch");
                return;
            }
            Err(e) if attempt < ATTEMPTS => {
                warn!(error = %e, attempt, "flush failed; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                error!(error = %e, "flush failed; batch lost");
                return;
            }
        }
    }
}
