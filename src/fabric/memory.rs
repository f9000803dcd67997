//! In-process fabric: pattern-matched pub/sub over tokio channels plus a
//! grant table standing in for the chain registry.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::fabric::{Access, Fabric, FabricError, Message, PayloadObject};
use crate::uri;

const SUBSCRIPTION_DEPTH: usize = 256;

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct Inner {
    subs: Mutex<Vec<Subscription>>,
    /// (key, uri pattern, access) triples that chains can be built for.
    grants: Mutex<Vec<(String, String, Access)>>,
}

/// A shared in-process fabric. Cloning produces another client handle over
/// the same bus; [`MemoryFabric::as_key`] gives the clone its own identity.
#[derive(Clone)]
pub struct MemoryFabric {
    inner: Arc<Inner>,
    key: String,
}

impl MemoryFabric {
    pub fn new(key: &str) -> Self {
        MemoryFabric {
            inner: Arc::new(Inner::default()),
            key: key.to_owned(),
        }
    }

    /// Another handle over the same bus publishing as `key`.
    pub fn as_key(&self, key: &str) -> Self {
        MemoryFabric {
            inner: Arc::clone(&self.inner),
            key: key.to_owned(),
        }
    }

    /// The identity this handle publishes under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record that `key` can build a chain for `access` on URIs matching
    /// `pattern`.
    pub fn grant(&self, key: &str, pattern: &str, access: Access) {
        self.inner
            .grants
            .lock()
            .push((key.to_owned(), pattern.to_owned(), access));
    }

    /// Remove a previously recorded grant.
    pub fn revoke(&self, key: &str, pattern: &str, access: Access) {
        self.inner
            .grants
            .lock()
            .retain(|(k, p, a)| !(k == key && p == pattern && *a == access));
    }
}

#[async_trait]
impl Fabric for MemoryFabric {
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Message>, FabricError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        self.inner.subs.lock().push(Subscription {
            pattern: pattern.to_owned(),
            tx,
        });
        Ok(rx)
    }

    async fn publish(&self, target: &str, pos: Vec<PayloadObject>) -> Result<(), FabricError> {
        let msg = Message {
            from: self.key.clone(),
            uri: target.to_owned(),
            pos,
        };
        // Snapshot matching senders so the lock is not held across await.
        let targets: Vec<mpsc::Sender<Message>> = {
            let mut subs = self.inner.subs.lock();
            subs.retain(|s| !s.tx.is_closed());
            subs.iter()
                .filter(|s| uri::matches(&s.pattern, target))
                .map(|s| s.tx.clone())
                .collect()
        };
        for tx in targets {
            // A full subscriber queue blocks the publisher: backpressure.
            if tx.send(msg.clone()).await.is_err() {
                continue;
            }
        }
        Ok(())
    }

    async fn build_chain(
        &self,
        key: &str,
        target: &str,
        access: Access,
    ) -> Result<bool, FabricError> {
        let grants = self.inner.grants.lock();
        Ok(grants
            .iter()
            .any(|(k, pattern, a)| k == key && *a == access && uri::matches(pattern, target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::PONum;

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let fab = MemoryFabric::new("archiver");
        let mut rx = fab.subscribe("scratch/*").await.unwrap();
        let mut other = fab.subscribe("elsewhere/*").await.unwrap();

        let producer = fab.as_key("producer");
        producer
            .publish(
                "scratch/r1/temp",
                vec![PayloadObject {
                    ponum: PONum::from_quad(2, 0, 0, 0),
                    body: vec![],
                }],
            )
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.uri, "scratch/r1/temp");
        assert_eq!(msg.from, "producer");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn chains_require_a_grant() {
        let fab = MemoryFabric::new("archiver");
        fab.grant("k1", "scratch/r1/*", Access::Read);
        assert!(fab
            .build_chain("k1", "scratch/r1/temp", Access::Read)
            .await
            .unwrap());
        assert!(!fab
            .build_chain("k1", "scratch/r2/temp", Access::Read)
            .await
            .unwrap());
        assert!(!fab
            .build_chain("k2", "scratch/r1/temp", Access::Read)
            .await
            .unwrap());
    }
}
