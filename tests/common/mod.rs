//! Shared harness: a full archiver over the in-process fabric and engine.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use granary::archiver::Archiver;
use granary::config::Config;
use granary::engine::memory::MemoryEngine;
use granary::envelope;
use granary::fabric::memory::MemoryFabric;
use granary::fabric::{Access, Fabric, PONum};
use granary::query::{ParseError, ParsedQuery, QueryParser};
use granary::stores::MemDocStore;
use serde::Serialize;
use tempfile::TempDir;

/// Maps canned query strings to parse trees; the real parser is an
/// external collaborator.
#[derive(Default)]
pub struct StubParser {
    map: Mutex<HashMap<String, ParsedQuery>>,
}

impl StubParser {
    pub fn insert(&self, query: &str, parsed: ParsedQuery) {
        self.map.lock().unwrap().insert(query.to_owned(), parsed);
    }
}

impl QueryParser for StubParser {
    fn parse(&self, query: &str) -> Result<ParsedQuery, ParseError> {
        self.map
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .ok_or_else(|| ParseError {
                message: format!("unknown query {query:?}"),
                pos: 0,
            })
    }
}

pub struct Harness {
    pub fabric: MemoryFabric,
    pub engine: Arc<MemoryEngine>,
    pub archiver: Arc<Archiver>,
    pub parser: Arc<StubParser>,
    pub serve: tokio::task::JoinHandle<Result<(), granary::Error>>,
    _dir: TempDir,
}

impl Harness {
    /// Stop the archiver and wait for a clean exit.
    pub async fn shutdown(self) {
        self.archiver.stop();
        self.serve
            .await
            .expect("serve task panicked")
            .expect("serve returned an error");
    }
}

/// Boot an archiver listening on `scratch`, with read grants for the given
/// (key, pattern) pairs.
pub async fn start(grants: &[(&str, &str)]) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.archiver.block_expiry = "60s".to_owned();
    config.archiver.periodic_report = false;
    config.archiver.prefix_db = dir
        .path()
        .join("prefix.db")
        .to_string_lossy()
        .into_owned();
    config.bosswave.deploy_ns = "granary.ns".to_owned();
    config.bosswave.listen_ns = vec!["scratch".to_owned()];

    let fabric = MemoryFabric::new("archiver");
    for (key, pattern) in grants {
        fabric.grant(key, pattern, Access::Read);
    }
    let engine = Arc::new(MemoryEngine::new());
    let md = Arc::new(MemDocStore::new().expect("metadata indexes"));
    let parser = Arc::new(StubParser::default());
    let engine_seam: Arc<dyn granary::engine::TimeseriesEngine> = engine.clone() as Arc<dyn granary::engine::TimeseriesEngine>;
    let parser_seam: Arc<dyn QueryParser> = parser.clone() as Arc<dyn QueryParser>;
    let archiver = Archiver::new(config, Arc::new(fabric.clone()), md, engine_seam, parser_seam)
        .expect("archiver init");

    let serve = {
        let archiver = Arc::clone(&archiver);
        tokio::spawn(async move { archiver.serve().await })
    };
    // let the query slot and namespace subscriptions come up
    tokio::time::sleep(Duration::from_millis(500)).await;

    Harness {
        fabric,
        engine,
        archiver,
        parser,
        serve,
        _dir: dir,
    }
}

/// Publish an archive request for `pattern` extracting `value_expr` from
/// the given PO.
pub async fn publish_archive_request(fabric: &MemoryFabric, pattern: &str, po: &str, value: &str) {
    #[derive(Serialize)]
    struct Wire<'a> {
        #[serde(rename = "URI")]
        uri: &'a str,
        #[serde(rename = "PO")]
        po: &'a str,
        #[serde(rename = "Value")]
        value: &'a str,
        #[serde(rename = "Name")]
        name: &'a str,
        #[serde(rename = "Unit")]
        unit: &'a str,
    }
    let body = envelope::encode(
        envelope::PO_ARCHIVE_REQUEST,
        &Wire {
            uri: pattern,
            po,
            value,
            name: "sensor",
            unit: "C",
        },
    )
    .expect("encode archive request");
    fabric
        .as_key("producer=")
        .publish("scratch/!meta/archive", vec![body])
        .await
        .expect("publish archive request");
}

/// Publish one numeric reading `{val, ts}` on `uri` under PO 2.0.0.0.
pub async fn publish_reading(fabric: &MemoryFabric, uri: &str, val: f64, ts: i64) {
    #[derive(Serialize)]
    struct Body {
        val: f64,
        ts: i64,
    }
    let po = envelope::encode(PONum::from_quad(2, 0, 0, 0), &Body { val, ts })
        .expect("encode reading");
    fabric
        .as_key("producer=")
        .publish(uri, vec![po])
        .await
        .expect("publish reading");
}

/// Publish a metadata record `{Key, Value, SrcURI}`.
pub async fn publish_metadata(fabric: &MemoryFabric, on_uri: &str, key: &str, value: &str, src: &str) {
    #[derive(Serialize)]
    struct Wire<'a> {
        #[serde(rename = "Key")]
        key: &'a str,
        #[serde(rename = "Value")]
        value: &'a str,
        #[serde(rename = "SrcURI")]
        src_uri: &'a str,
    }
    let po = envelope::encode(
        envelope::PO_METADATA,
        &Wire {
            key,
            value,
            src_uri: src,
        },
    )
    .expect("encode metadata");
    fabric
        .as_key("producer=")
        .publish(on_uri, vec![po])
        .await
        .expect("publish metadata");
}

/// Poll until `cond` holds or the timeout elapses.
pub async fn wait_until<F>(mut cond: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}
