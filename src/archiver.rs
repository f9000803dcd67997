//! Top-level wiring: connects the fabric, the stores, the permission gate,
//! the view manager, and the query evaluator, and owns the serve loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::dots::DotMaster;
use crate::engine::TimeseriesEngine;
use crate::envelope::{self, KeyValueQuery, QueryError};
use crate::errors::Error;
use crate::fabric::{Fabric, Message, PayloadObject};
use crate::pool::WorkerPool;
use crate::prefix::PrefixStore;
use crate::query::{QueryEvaluator, QueryParser, QueryResults};
use crate::requests::RequestRegistry;
use crate::stores::{MetadataStore, StreamStore, TimeseriesStore};
use crate::view::ViewManager;

/// Workers serving inbound queries.
const QUERY_WORKERS: usize = 1000;
/// Pause between namespace subscriptions at startup.
const SUBSCRIBE_STAGGER: Duration = Duration::from_millis(250);

pub struct Archiver {
    config: Config,
    fabric: Arc<dyn Fabric>,
    md: Arc<dyn MetadataStore>,
    ts: Arc<dyn TimeseriesStore>,
    prefix: Arc<PrefixStore>,
    registry: Arc<RequestRegistry>,
    evaluator: QueryEvaluator,
    parser: Arc<dyn QueryParser>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Archiver {
    /// Wire up the archiver. Fails on config-fatal conditions: unopenable
    /// prefix index, unparsable expiry, or index creation failure upstream.
    pub fn new(
        config: Config,
        fabric: Arc<dyn Fabric>,
        md: Arc<dyn MetadataStore>,
        engine: Arc<dyn TimeseriesEngine>,
        parser: Arc<dyn QueryParser>,
    ) -> Result<Arc<Self>, Error> {
        let expiry = config.block_expiry()?;
        let prefix = Arc::new(PrefixStore::open(Path::new(&config.archiver.prefix_db))?);
        let ts: Arc<dyn TimeseriesStore> = Arc::new(StreamStore::new(engine));
        let gate = Arc::new(DotMaster::new(Arc::clone(&fabric), expiry));
        let registry = Arc::new(RequestRegistry::new());
        let evaluator = QueryEvaluator::new(Arc::clone(&md), Arc::clone(&ts), gate);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Archiver {
            config,
            fabric,
            md,
            ts,
            prefix,
            registry,
            evaluator,
            parser,
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// The slot URI queries arrive on.
    pub fn query_slot_uri(&self) -> String {
        format!(
            "{}/s.giles/_/i.archiver/slot/query",
            self.config.bosswave.deploy_ns
        )
    }

    /// The signal URI replies for `signal` go out on.
    pub fn query_signal_uri(&self, signal: &str) -> String {
        format!(
            "{}/s.giles/_/i.archiver/signal/{}",
            self.config.bosswave.deploy_ns, signal
        )
    }

    /// Request shutdown; `serve` drains and returns.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until `SIGINT`/`SIGTERM` or [`Archiver::stop`]. Subscriptions
    /// drain, pending writes complete, then the timeseries store
    /// disconnects.
    pub async fn serve(self: &Arc<Self>) -> Result<(), Error> {
        if self.config.archiver.periodic_report {
            tokio::spawn(crate::stats::report_loop(self.shutdown_rx.clone()));
        }

        let (vm, flush_pool) = ViewManager::new(
            Arc::clone(&self.fabric),
            Arc::clone(&self.md),
            Arc::clone(&self.ts),
            Arc::clone(&self.prefix),
            Arc::clone(&self.registry),
        );

        let slot = self.query_slot_uri();
        let query_rx = self.fabric.subscribe(&slot).await?;
        info!(uri = %slot, "listening for queries");
        let query_pool = {
            let archiver = Arc::clone(self);
            WorkerPool::start(query_rx, QUERY_WORKERS, move |msg: Message| {
                let archiver = Arc::clone(&archiver);
                async move { archiver.listen_query(msg).await }
            })
        };

        let mut subscriptions = Vec::new();
        for namespace in &self.config.bosswave.listen_ns {
            subscriptions.push(vm.subscribe_namespace(namespace.clone(), self.shutdown_rx.clone()));
            tokio::time::sleep(SUBSCRIBE_STAGGER).await;
        }

        self.wait_shutdown().await;
        info!("shutting down; draining subscriptions");

        for handle in subscriptions {
            let _ = handle.await;
        }
        // dropping the view manager closes the flush queue; the pool then
        // finishes whatever writes are still queued
        drop(vm);
        flush_pool.join().await;
        query_pool.abort();
        self.ts.disconnect().await?;
        info!("archiver stopped");
        Ok(())
    }

    async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        if *rx.borrow() {
            return;
        }
        #[cfg(unix)]
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        #[cfg(unix)]
        let term_fut = async move {
            match term.as_mut() {
                Some(term) => {
                    term.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let term_fut = std::future::pending::<()>();

        tokio::select! {
            _ = rx.changed() => {}
            _ = tokio::signal::ctrl_c() => {
                let _ = self.shutdown_tx.send(true);
            }
            _ = term_fut => {
                let _ = self.shutdown_tx.send(true);
            }
        }
    }

    /// Parse and evaluate one query string on behalf of `vk`.
    pub async fn handle_query(&self, vk: &str, query: &str) -> Result<QueryResults, Error> {
        let parsed = self
            .parser
            .parse(query)
            .map_err(crate::query::QueryEvalError::from)?;
        Ok(self.evaluator.evaluate(vk, parsed).await?)
    }

    /// One inbound query message: decode, evaluate, reply on the signal.
    async fn listen_query(self: Arc<Self>, msg: Message) {
        let started = std::time::Instant::now();
        let Some(po) = msg.po(envelope::PO_KV_QUERY) else {
            return;
        };
        let query: KeyValueQuery = match envelope::decode(po) {
            Ok(q) => q,
            Err(e) => {
                error!(from = %msg.from, error = %e, "received query was not msgpack");
                return;
            }
        };
        let signal = self.query_signal_uri(&envelope::signal_uri(&msg.from));
        info!(from = %msg.from, query = %query.query, nonce = query.nonce, "got query");

        let results = match self.handle_query(&msg.from, &query.query).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "error evaluating query");
                let payload = QueryError {
                    query: query.query.clone(),
                    nonce: query.nonce,
                    error: e.to_string(),
                };
                self.publish_reply(&signal, envelope::encode(envelope::PO_QUERY_ERROR, &payload))
                    .await;
                return;
            }
        };

        let mut reply: Vec<Result<PayloadObject, envelope::EnvelopeError>> = Vec::new();
        if !results.metadata.is_empty() {
            reply.push(envelope::encode(
                envelope::PO_METADATA_REPLY,
                &envelope::MetadataReply {
                    nonce: query.nonce,
                    data: results.metadata.clone(),
                },
            ));
        }
        if !results.timeseries.is_empty() {
            reply.push(envelope::encode(
                envelope::PO_TIMESERIES_REPLY,
                &envelope::TimeseriesReply {
                    nonce: query.nonce,
                    data: results.timeseries.clone(),
                },
            ));
        }
        if !results.statistics.is_empty() {
            reply.push(envelope::encode(
                envelope::PO_STATISTICS_REPLY,
                &envelope::StatisticsReply {
                    nonce: query.nonce,
                    data: results.statistics.clone(),
                },
            ));
        }
        if !results.changed.is_empty() {
            reply.push(envelope::encode(
                envelope::PO_CHANGED_REPLY,
                &envelope::ChangedReply {
                    nonce: query.nonce,
                    changed: results.changed.clone(),
                },
            ));
        }
        // no results still answers with an empty metadata payload
        if reply.is_empty() {
            reply.push(envelope::encode(
                envelope::PO_METADATA_REPLY,
                &envelope::MetadataReply {
                    nonce: query.nonce,
                    data: Vec::new(),
                },
            ));
        }

        info!(
            to = %msg.from,
            md = results.metadata.len(),
            ts = results.timeseries.len(),
            stats = results.statistics.len(),
            changed = results.changed.len(),
            took = ?started.elapsed(),
            "query reply"
        );
        let mut pos = Vec::with_capacity(reply.len());
        for encoded in reply {
            match encoded {
                Ok(po) => pos.push(po),
                Err(e) => {
                    error!(error = %e, "could not encode reply payload");
                    return;
                }
            }
        }
        if let Err(e) = self.fabric.publish(&signal, pos).await {
            error!(error = %e, "error sending response");
        }
    }

    async fn publish_reply(
        &self,
        signal: &str,
        po: Result<PayloadObject, envelope::EnvelopeError>,
    ) {
        match po {
            Ok(po) => {
                if let Err(e) = self.fabric.publish(signal, vec![po]).await {
                    error!(error = %e, "error sending response");
                }
            }
            Err(e) => error!(error = %e, "could not encode reply payload"),
        }
    }
}
