//! Fixed-capacity dispatcher for inbound query messages and ingestion
//! bursts.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// A bounded pool of workers draining one channel. When the sending side
/// closes, workers finish whatever is still queued and stop.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks, each invoking `handler` on received messages.
    pub fn start<T, F, Fut>(rx: mpsc::Receiver<T>, workers: usize, handler: F) -> Self
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        // hold the lock only for the receive itself so other
                        // workers can pick up the next message concurrently
                        let msg = { rx.lock().await.recv().await };
                        match msg {
                            Some(msg) => handler(msg).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();
        WorkerPool { handles }
    }

    /// Wait for the channel to drain and every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Stop immediately, abandoning queued messages.
    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
