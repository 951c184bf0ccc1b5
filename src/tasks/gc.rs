//! Idle Entry Collection Task
//!
//! Background task that periodically drops query cache entries nobody has
//! observed or read for longer than the gc time.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::query::QueryCache;

/// Spawns a background task that periodically collects idle cache entries.
///
/// The task runs in an infinite loop, sleeping for the specified interval
/// between runs. Entries with observers or a fetch in flight are never
/// collected.
///
/// # Arguments
/// * `cache` - Shared query cache handle
/// * `gc_interval_secs` - Interval in seconds between collection runs
///
/// # Returns
/// A JoinHandle for the spawned task, to be aborted on teardown.
///
/// # Example
/// ```ignore
/// let cache = QueryCache::new(Duration::ZERO, Duration::from_secs(300));
/// let gc_handle = spawn_gc_task(cache.clone(), 60);
/// // Later, during teardown:
/// gc_handle.abort();
/// ```
pub fn spawn_gc_task(cache: QueryCache, gc_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(gc_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting cache gc task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = cache.collect_garbage();

            if removed > 0 {
                info!("Cache gc: removed {} idle entries", removed);
            } else {
                debug!("Cache gc: no idle entries found");
            }
        }
    })
}
