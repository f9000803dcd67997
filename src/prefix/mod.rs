//! Persistent prefix index: the durable association between namespace URIs
//! and stream UUIDs.
//!
//! One embedded ordered-kv file with three logical buckets:
//! - `timeseries`: concrete timeseries URIs, keyed by the URI string with an
//!   entry sequence number as the value; scanned by prefix.
//! - `metadata`: concrete metadata URIs, same layout.
//! - `uuid`: one logical sub-bucket per concrete URI, flattened into
//!   composite `uri \0 uuid` keys whose values are the 16-byte UUIDs.
//!
//! A URI may legitimately carry several UUIDs (one per payload-object /
//! value-expression pair); readers de-duplicate.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fjall::{Keyspace, KeyspaceCreateOptions, PersistMode};
use parking_lot::Mutex;
use snafu::{Backtrace, ResultExt, Snafu};
use uuid::Uuid;

const SEQ_KEY: &str = "seq";

/// Faults from the embedded store. Callers treat these as retryable storage
/// faults unless marked fatal at startup.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PrefixStoreError {
    #[snafu(display("could not open prefix index at {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: fjall::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("prefix index I/O fault: {source}"))]
    Io {
        source: fjall::Error,
        backtrace: Backtrace,
    },
}

/// Persistent mapping of metadata URIs, timeseries URIs, and URI → UUID
/// registrations, with ordered prefix scans.
pub struct PrefixStore {
    db: fjall::Database,
    timeseries: Keyspace,
    metadata: Keyspace,
    uuids: Keyspace,
    meta: Keyspace,
    seq_lock: Mutex<()>,
}

impl PrefixStore {
    /// Open (creating if necessary) the index file and its buckets.
    pub fn open(path: &Path) -> Result<Self, PrefixStoreError> {
        let db = fjall::Database::builder(path)
            .open()
            .context(OpenSnafu { path })?;
        let timeseries = db
            .keyspace("timeseries", KeyspaceCreateOptions::default)
            .context(OpenSnafu { path })?;
        let metadata = db
            .keyspace("metadata", KeyspaceCreateOptions::default)
            .context(OpenSnafu { path })?;
        let uuids = db
            .keyspace("uuid", KeyspaceCreateOptions::default)
            .context(OpenSnafu { path })?;
        let meta = db
            .keyspace("_meta", KeyspaceCreateOptions::default)
            .context(OpenSnafu { path })?;
        Ok(PrefixStore {
            db,
            timeseries,
            metadata,
            uuids,
            meta,
            seq_lock: Mutex::new(()),
        })
    }

    fn next_seq(&self) -> Result<u64, PrefixStoreError> {
        let _guard = self.seq_lock.lock();
        let next = match self.meta.get(SEQ_KEY).context(IoSnafu)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_ref().try_into().unwrap_or([0; 8]);
                u64::from_be_bytes(bytes) + 1
            }
            None => 1,
        };
        self.meta
            .insert(SEQ_KEY, next.to_be_bytes())
            .context(IoSnafu)?;
        Ok(next)
    }

    /// Record a concrete metadata URI. Idempotent.
    pub fn add_metadata_uri(&self, uri: &str) -> Result<(), PrefixStoreError> {
        if self.metadata.get(uri).context(IoSnafu)?.is_some() {
            return Ok(());
        }
        let seq = self.next_seq()?;
        self.metadata
            .insert(uri, seq.to_be_bytes())
            .context(IoSnafu)?;
        self.db.persist(PersistMode::SyncAll).context(IoSnafu)?;
        Ok(())
    }

    /// Record a concrete timeseries URI. Idempotent.
    pub fn add_timeseries_uri(&self, uri: &str) -> Result<(), PrefixStoreError> {
        if self.timeseries.get(uri).context(IoSnafu)?.is_some() {
            return Ok(());
        }
        let seq = self.next_seq()?;
        self.timeseries
            .insert(uri, seq.to_be_bytes())
            .context(IoSnafu)?;
        self.db.persist(PersistMode::SyncAll).context(IoSnafu)?;
        Ok(())
    }

    /// Register a UUID under its concrete URI.
    pub fn add_uuid_for_uri(&self, uri: &str, uuid: Uuid) -> Result<(), PrefixStoreError> {
        let mut key = Vec::with_capacity(uri.len() + 17);
        key.extend_from_slice(uri.as_bytes());
        key.push(0);
        key.extend_from_slice(uuid.as_bytes());
        self.uuids.insert(key, uuid.as_bytes()).context(IoSnafu)?;
        self.db.persist(PersistMode::SyncAll).context(IoSnafu)?;
        Ok(())
    }

    /// All stored metadata URIs having `prefix` as a string prefix.
    pub fn metadata_superstrings(&self, prefix: &str) -> Result<Vec<String>, PrefixStoreError> {
        Self::scan_keys(&self.metadata, prefix)
    }

    /// All stored timeseries URIs having `prefix` as a string prefix.
    pub fn timeseries_superstrings(&self, prefix: &str) -> Result<Vec<String>, PrefixStoreError> {
        Self::scan_keys(&self.timeseries, prefix)
    }

    /// Union of the UUID registrations under every timeseries superstring of
    /// `uri`, de-duplicated.
    pub fn uuids_for(&self, uri: &str) -> Result<Vec<Uuid>, PrefixStoreError> {
        let mut found: HashSet<[u8; 16]> = HashSet::new();
        for suri in self.timeseries_superstrings(uri)? {
            let mut bucket_prefix = Vec::with_capacity(suri.len() + 1);
            bucket_prefix.extend_from_slice(suri.as_bytes());
            bucket_prefix.push(0);
            for kv in self.uuids.prefix(bucket_prefix) {
                let value = kv.value().context(IoSnafu)?;
                if let Ok(bytes) = <[u8; 16]>::try_from(value.as_ref()) {
                    found.insert(bytes);
                }
            }
        }
        Ok(found.into_iter().map(Uuid::from_bytes).collect())
    }

    fn scan_keys(ks: &Keyspace, prefix: &str) -> Result<Vec<String>, PrefixStoreError> {
        let mut matching = Vec::new();
        for kv in ks.prefix(prefix) {
            let key = kv.key().context(IoSnafu)?;
            matching.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(matching)
    }
}
