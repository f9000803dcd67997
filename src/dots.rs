//! The permission gate ("dot master"): per (key, URI, action) decisions
//! backed by fabric chain builds, with a bounded-TTL cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use crate::fabric::{Access, Fabric};

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    allowed: bool,
    expires_at: Instant,
}

/// TTL-expiring cache of chain-build results. Lookup never panics; a
/// failed build is reported as deny and left uncached so the next caller
/// retries.
pub struct DotMaster {
    fabric: Arc<dyn Fabric>,
    expiry: Duration,
    cache: DashMap<(String, String, Access), CacheEntry>,
}

impl DotMaster {
    pub fn new(fabric: Arc<dyn Fabric>, expiry: Duration) -> Self {
        DotMaster {
            fabric,
            expiry,
            cache: DashMap::new(),
        }
    }

    /// Denials flap more than grants; cache them for a shorter bound.
    fn negative_expiry(&self) -> Duration {
        (self.expiry / 10).max(Duration::from_secs(1))
    }

    /// May `key` perform `access` on `uri`?
    pub async fn can(&self, key: &str, uri: &str, access: Access) -> bool {
        let cache_key = (key.to_owned(), uri.to_owned(), access);
        if let Some(entry) = self.cache.get(&cache_key) {
            // expired entries are treated as absent even though present
            if Instant::now() < entry.expires_at {
                return entry.allowed;
            }
        }

        let allowed = match self.fabric.build_chain(key, uri, access).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(key, uri, error = %e, "chain build failed; denying");
                return false;
            }
        };
        let ttl = if allowed {
            self.expiry
        } else {
            self.negative_expiry()
        };
        self.cache.insert(
            cache_key,
            CacheEntry {
                allowed,
                expires_at: Instant::now() + ttl,
            },
        );
        allowed
    }

    /// Drop any cached decision for (key, uri).
    pub fn invalidate(&self, key: &str, uri: &str) {
        self.cache.retain(|(k, u, _), _| !(k == key && u == uri));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::memory::MemoryFabric;

    #[tokio::test]
    async fn grants_and_denials_follow_the_chain_table() {
        let fab = MemoryFabric::new("archiver");
        fab.grant("k1", "scratch/*", Access::Read);
        let gate = DotMaster::new(Arc::new(fab), Duration::from_secs(60));

        assert!(gate.can("k1", "scratch/r1/temp", Access::Read).await);
        assert!(!gate.can("k1", "other/r1", Access::Read).await);
        assert!(!gate.can("k2", "scratch/r1/temp", Access::Read).await);
    }

    #[tokio::test]
    async fn positive_entries_serve_from_cache_until_expiry() {
        let fab = MemoryFabric::new("archiver");
        fab.grant("k1", "scratch/*", Access::Read);
        let gate = DotMaster::new(Arc::new(fab.clone()), Duration::from_millis(40));

        assert!(gate.can("k1", "scratch/r1", Access::Read).await);
        // the chain is gone, but the cached decision still serves
        fab.revoke("k1", "scratch/*", Access::Read);
        assert!(gate.can("k1", "scratch/r1", Access::Read).await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // past TTL the entry is ignored even though present
        assert!(!gate.can("k1", "scratch/r1", Access::Read).await);
    }

    #[tokio::test]
    async fn invalidation_forces_a_rebuild() {
        let fab = MemoryFabric::new("archiver");
        fab.grant("k1", "scratch/*", Access::Read);
        let gate = DotMaster::new(Arc::new(fab), Duration::from_secs(60));

        assert!(gate.can("k1", "scratch/r1", Access::Read).await);
        gate.invalidate("k1", "scratch/r1");
        assert!(gate.can("k1", "scratch/r1", Access::Read).await);
    }
}
