//! Process-wide ingestion counters and the periodic report task.
//!
//! The counters are observational only and never gate correctness.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Streams with at least one committed reading this process lifetime.
pub static CURRENT_STREAMS: AtomicI64 = AtomicI64::new(0);

/// Writes currently in flight against the timeseries engine.
pub static CURRENT_WRITES: AtomicI64 = AtomicI64::new(0);

/// Writes completed successfully since startup. Monotone.
pub static COMPLETED_WRITES: AtomicI64 = AtomicI64::new(0);

pub fn current_streams() -> i64 {
    CURRENT_STREAMS.load(Ordering::Relaxed)
}

pub fn current_writes() -> i64 {
    CURRENT_WRITES.load(Ordering::Relaxed)
}

pub fn completed_writes() -> i64 {
    COMPLETED_WRITES.load(Ordering::Relaxed)
}

/// Log a counter line every 10 seconds until shutdown is signalled.
/// `completed` is the delta since the previous line.
pub async fn report_loop(mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(10));
    // the first tick fires immediately; skip it so the first line covers a
    // full interval
    tick.tick().await;
    let mut last_completed = completed_writes();
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let completed = completed_writes();
                info!(
                    active = current_streams(),
                    completed = completed - last_completed,
                    pending = current_writes(),
                    "ingestion counters"
                );
                last_completed = completed;
            }
            _ = shutdown.changed() => return,
        }
    }
}
