//! Query Cache Module
//!
//! Read-through cache of server resources keyed by [`QueryKey`], with
//! per-key fetch de-duplication, staleness, invalidation and observers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{RequestError, Result};
use crate::query::{CacheEntry, CacheStats, QueryKey, QueryState, Subscription};

/// Callback run synchronously after every change to an observed entry.
pub type Observer = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

type ErasedFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type InFlight = Shared<BoxFuture<'static, Result<Value>>>;

// == Query Options ==
/// Per-read options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// When false, reads never trigger a fetch
    pub enabled: bool,
    /// Overrides the cache-wide stale time for this key
    pub stale_time: Option<Duration>,
    /// Overrides the cache-wide gc time for this key
    pub gc_time: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time: None,
            gc_time: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }
}

// == Fetch Handle ==
/// Awaitable result of a fetch started by [`QueryCache::refetch`].
///
/// Dropping the handle does not cancel the fetch; its result still lands in
/// the cache.
pub struct FetchHandle(InFlight);

impl FetchHandle {
    pub async fn wait(self) -> Result<Value> {
        self.0.await
    }
}

// == Internal State ==
struct Slot {
    /// Unique per slot; completions for a removed slot never reach its successor
    id: u64,
    entry: CacheEntry,
    fetcher: Option<ErasedFetcher>,
    in_flight: Option<(u64, InFlight)>,
    observers: Vec<(u64, Observer)>,
    last_accessed: Instant,
    /// Idle time before collection; set by the most recent read
    gc_time: Duration,
}

impl Slot {
    fn notification(&self) -> Option<Notification> {
        if self.observers.is_empty() {
            return None;
        }
        Some(Notification {
            entry: self.entry.clone(),
            observers: self.observers.iter().map(|(_, o)| o.clone()).collect(),
        })
    }

    /// Forgets the in-flight fetch and makes its completion a no-op.
    fn detach_fetch(&mut self) {
        self.entry.cancel_fetches();
        self.in_flight = None;
        self.entry.set_fetching(false);
    }
}

pub(crate) struct Inner {
    slots: HashMap<QueryKey, Slot>,
    stats: CacheStats,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Observer fan-out, always run after the lock is released.
struct Notification {
    entry: CacheEntry,
    observers: Vec<Observer>,
}

impl Notification {
    fn send(self) {
        for observer in &self.observers {
            observer(&self.entry);
        }
    }
}

fn notify_all(notifications: impl IntoIterator<Item = Notification>) {
    for n in notifications {
        n.send();
    }
}

/// Undo record for one optimistic edit.
#[derive(Debug, Clone)]
pub(crate) struct OptimisticTicket {
    pub key: QueryKey,
    pub version: u64,
}

// == Query Cache ==
/// Process-wide cache of fetched results.
///
/// Cheap to clone; clones share the same entries. Methods that may start a
/// fetch spawn onto the current tokio runtime.
///
/// Fetchers run outside the cache lock. Updaters passed to [`write`](Self::write)
/// run inside it and must not call back into the cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
    default_stale_time: Duration,
    gc_time: Duration,
}

impl QueryCache {
    // == Constructor ==
    /// Creates an empty cache.
    ///
    /// # Arguments
    /// * `default_stale_time` - Age at which entries become stale unless a read overrides it
    /// * `gc_time` - Idle time after which unobserved entries are collected
    pub fn new(default_stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: HashMap::new(),
                stats: CacheStats::new(),
                next_id: 0,
            })),
            default_stale_time,
            gc_time,
        }
    }

    // == Read ==
    /// Returns the current state for `key` and, if the entry is absent or
    /// stale and `enabled`, starts a background fetch.
    ///
    /// A fetch already in flight for the key is joined instead of duplicated.
    pub fn read<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: QueryOptions) -> QueryState<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetcher = erase(fetcher);
        let now = Instant::now();

        let (state, notification) = {
            let mut guard = self.inner.lock();
            let slot_id = guard.next_id();
            let Inner { slots, stats, .. } = &mut *guard;
            let stale_time = options.stale_time.unwrap_or(self.default_stale_time);
            let gc_time = options.gc_time.unwrap_or(self.gc_time);
            stats.set_total_entries(slots.len() + usize::from(!slots.contains_key(key)));
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| new_slot(slot_id, key, stale_time, gc_time, now));

            slot.fetcher = Some(fetcher.clone());
            slot.entry.set_stale_time(stale_time);
            slot.gc_time = gc_time;
            slot.last_accessed = now;

            let mut notification = None;
            if options.enabled && slot.entry.is_stale_at(now) {
                if slot.in_flight.is_some() {
                    stats.record_deduplicated();
                } else {
                    stats.record_miss();
                    self.start_fetch(key, slot, stats, fetcher);
                    notification = slot.notification();
                }
            } else if slot.entry.data().is_some() {
                stats.record_hit();
            }

            (QueryState::from_entry(&slot.entry), notification)
        };

        notify_all(notification);
        state
    }

    /// Awaitable read: fresh data is returned from the cache, otherwise the
    /// in-flight fetch is joined or a new one started and its result returned.
    ///
    /// Ignores `options.enabled`; calling this is an explicit request.
    pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: QueryOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let fetcher = erase(fetcher);
        let now = Instant::now();

        let (pending, notification) = {
            let mut guard = self.inner.lock();
            let slot_id = guard.next_id();
            let Inner { slots, stats, .. } = &mut *guard;
            let stale_time = options.stale_time.unwrap_or(self.default_stale_time);
            let gc_time = options.gc_time.unwrap_or(self.gc_time);
            stats.set_total_entries(slots.len() + usize::from(!slots.contains_key(key)));
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| new_slot(slot_id, key, stale_time, gc_time, now));

            slot.fetcher = Some(fetcher.clone());
            slot.entry.set_stale_time(stale_time);
            slot.gc_time = gc_time;
            slot.last_accessed = now;

            if !slot.entry.is_stale_at(now) {
                if let Some(data) = slot.entry.data() {
                    stats.record_hit();
                    return Ok(serde_json::from_value(data.clone())?);
                }
            }

            let joined = slot.in_flight.as_ref().map(|(_, in_flight)| in_flight.clone());
            let pending = match joined {
                Some(in_flight) => {
                    stats.record_deduplicated();
                    in_flight
                }
                None => {
                    stats.record_miss();
                    self.start_fetch(key, slot, stats, fetcher)
                }
            };

            (pending, slot.notification())
        };

        notify_all(notification);
        let value = pending.await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Starts a new fetch for `key` with its registered fetcher, superseding
    /// any fetch already in flight.
    ///
    /// Returns None if no read ever registered a fetcher for the key.
    pub fn refetch(&self, key: &QueryKey) -> Option<FetchHandle> {
        let (handle, notification) = {
            let mut guard = self.inner.lock();
            let Inner { slots, stats, .. } = &mut *guard;
            let slot = slots.get_mut(key)?;
            let fetcher = slot.fetcher.clone()?;
            let in_flight = self.start_fetch(key, slot, stats, fetcher);
            (FetchHandle(in_flight), slot.notification())
        };

        notify_all(notification);
        Some(handle)
    }

    /// Issues a sequenced fetch and records it as the key's in-flight fetch.
    fn start_fetch(
        &self,
        key: &QueryKey,
        slot: &mut Slot,
        stats: &mut CacheStats,
        fetcher: ErasedFetcher,
    ) -> InFlight {
        let seq = slot.entry.begin_fetch();
        slot.entry.set_fetching(true);
        stats.record_fetch();
        debug!("Fetching {} (seq {})", key, seq);

        let cache = Arc::downgrade(&self.inner);
        let slot_id = slot.id;
        let key = key.clone();
        let in_flight = async move {
            let result = fetcher().await;
            complete(&cache, &key, slot_id, seq, result.clone());
            result
        }
        .boxed()
        .shared();

        slot.in_flight = Some((seq, in_flight.clone()));
        // Drives the fetch to completion even if every reader goes away
        tokio::spawn(in_flight.clone().map(|_| ()));
        in_flight
    }

    // == Invalidate ==
    /// Marks every entry under `prefixes` stale.
    ///
    /// Observed entries are refetched right away; the rest refetch on their
    /// next read. A fetch in flight for an invalidated entry may carry data
    /// from before the change, so its result is discarded.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate(&self, prefixes: &[QueryKey]) -> usize {
        let (count, notifications) = {
            let mut guard = self.inner.lock();
            let Inner { slots, stats, .. } = &mut *guard;
            let mut notifications = Vec::new();
            let mut count = 0;

            for (key, slot) in slots.iter_mut() {
                if !key.matches_any(prefixes) {
                    continue;
                }
                count += 1;
                slot.entry.invalidate();
                slot.detach_fetch();

                if !slot.observers.is_empty() {
                    if let Some(fetcher) = slot.fetcher.clone() {
                        self.start_fetch(key, slot, stats, fetcher);
                    }
                }
                notifications.extend(slot.notification());
            }
            stats.record_invalidations(count);
            (count, notifications)
        };

        if count > 0 {
            debug!("Invalidated {} entries under {:?}", count, prefixes);
        }
        notify_all(notifications);
        count
    }

    // == Write ==
    /// Replaces the data for `key` with `updater(previous)`.
    ///
    /// Creates the entry if needed. Returns the entry's new version.
    pub fn write<T, F>(&self, key: &QueryKey, updater: F) -> Result<u64>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        self.write_value(key, None, |current| {
            let current = current.map(serde_json::from_value::<T>).transpose()?;
            Ok(serde_json::to_value(updater(current))?)
        })
        .map(|(version, _)| version)
    }

    /// Untyped write. With `expected_version`, the write only happens if the
    /// entry is still at that version.
    fn write_value<F>(&self, key: &QueryKey, expected_version: Option<u64>, edit: F) -> Result<(u64, bool)>
    where
        F: FnOnce(Option<Value>) -> Result<Value>,
    {
        let now = Instant::now();
        let (version, notification) = {
            let mut guard = self.inner.lock();
            let slot_id = guard.next_id();
            let Inner { slots, stats, .. } = &mut *guard;
            stats.set_total_entries(slots.len() + usize::from(!slots.contains_key(key)));
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| self.default_slot(slot_id, key, now));

            if expected_version.is_some_and(|v| v != slot.entry.version()) {
                return Ok((slot.entry.version(), false));
            }

            let next = edit(slot.entry.data().cloned())?;
            slot.last_accessed = now;
            (slot.entry.set_data(next), slot.notification())
        };

        notify_all(notification);
        Ok((version, true))
    }

    // == Optimistic Support ==
    /// Snapshots `key` and applies `edit` in one critical section.
    ///
    /// Any fetch in flight for the key is detached first so it cannot
    /// overwrite the optimistic value.
    pub(crate) fn apply_optimistic<F>(&self, key: &QueryKey, edit: F) -> Result<OptimisticTicket>
    where
        F: FnOnce(Option<Value>) -> Result<Value>,
    {
        let now = Instant::now();
        let (ticket, notification) = {
            let mut guard = self.inner.lock();
            let slot_id = guard.next_id();
            let Inner { slots, stats, .. } = &mut *guard;
            stats.set_total_entries(slots.len() + usize::from(!slots.contains_key(key)));
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| self.default_slot(slot_id, key, now));

            let next = edit(slot.entry.data().cloned())?;
            slot.detach_fetch();
            let version = slot.entry.apply_optimistic(next);
            slot.last_accessed = now;

            let ticket = OptimisticTicket {
                key: key.clone(),
                version,
            };
            (ticket, slot.notification())
        };

        notify_all(notification);
        Ok(ticket)
    }

    /// Undoes the optimistic edit behind `ticket`, leaving edits made by
    /// other in-flight mutations in place.
    ///
    /// Returns false when the edit was already overwritten by a plain write
    /// or a fetch.
    pub(crate) fn rollback(&self, ticket: OptimisticTicket) -> bool {
        let notification = {
            let mut guard = self.inner.lock();
            let Some(slot) = guard.slots.get_mut(&ticket.key) else {
                return false;
            };
            if !slot.entry.rollback_optimistic(ticket.version) {
                debug!(
                    "Skipping rollback of {}: edit {} was overwritten (now at version {})",
                    ticket.key,
                    ticket.version,
                    slot.entry.version()
                );
                return false;
            }
            slot.notification()
        };

        notify_all(notification);
        true
    }

    /// Confirms the optimistic edit behind `ticket`; later rollbacks of other
    /// edits on the key restore on top of it.
    pub(crate) fn settle(&self, ticket: &OptimisticTicket) {
        if let Some(slot) = self.inner.lock().slots.get_mut(&ticket.key) {
            slot.entry.settle_optimistic(ticket.version);
        }
    }

    /// Replaces the optimistic value with `edit(current)` if the entry was not
    /// touched since the edit. Returns whether the write happened.
    pub(crate) fn reconcile<F>(&self, ticket: &OptimisticTicket, edit: F) -> Result<bool>
    where
        F: FnOnce(Option<Value>) -> Result<Value>,
    {
        if !self.inner.lock().slots.contains_key(&ticket.key) {
            return Ok(false);
        }
        self.write_value(&ticket.key, Some(ticket.version), edit)
            .map(|(_, written)| written)
    }

    /// Discards the result of any fetch in flight for `key`.
    pub fn cancel(&self, key: &QueryKey) {
        let notification = {
            let mut guard = self.inner.lock();
            let Some(slot) = guard.slots.get_mut(key) else {
                return;
            };
            if slot.in_flight.is_none() {
                return;
            }
            slot.detach_fetch();
            slot.notification()
        };
        notify_all(notification);
    }

    // == Subscribe ==
    /// Registers `observer` for changes to `key`. Dropping the returned
    /// guard unsubscribes; fetches already running still complete.
    pub fn subscribe<F>(&self, key: &QueryKey, observer: F) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let observer_id = guard.next_id();
        let slot_id = guard.next_id();
        let Inner { slots, stats, .. } = &mut *guard;
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.default_slot(slot_id, key, now));
        slot.observers.push((observer_id, Arc::new(observer)));
        slot.last_accessed = now;
        stats.set_total_entries(slots.len());

        Subscription::new(Arc::downgrade(&self.inner), key.clone(), observer_id)
    }

    // == Snapshots ==
    /// Copy of the entry for `key`.
    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Cached data for `key` decoded into `T`, without fetching.
    pub fn get_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>> {
        match self.entry(key) {
            Some(entry) => entry.data_as(),
            None => Ok(None),
        }
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .lock()
            .slots
            .get(key)
            .map_or(0, |slot| slot.observers.len())
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock();
        let mut stats = guard.stats.clone();
        stats.set_total_entries(guard.slots.len());
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }

    // == Removal ==
    /// Drops every entry under `prefixes`, observers included.
    pub fn remove(&self, prefixes: &[QueryKey]) -> usize {
        let mut guard = self.inner.lock();
        let before = guard.slots.len();
        guard.slots.retain(|key, _| !key.matches_any(prefixes));
        let removed = before - guard.slots.len();
        let remaining = guard.slots.len();
        guard.stats.set_total_entries(remaining);
        removed
    }

    /// Drops every entry. Used on logout.
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        let removed = guard.slots.len();
        guard.slots.clear();
        guard.stats.set_total_entries(0);
        info!("Query cache cleared ({} entries)", removed);
    }

    // == Garbage Collection ==
    /// Removes entries with no observers and no fetch in flight that have
    /// been idle for at least their gc time.
    ///
    /// Returns the number of entries removed.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let before = guard.slots.len();

        guard.slots.retain(|_, slot| {
            !(slot.observers.is_empty()
                && slot.in_flight.is_none()
                && now.saturating_duration_since(slot.last_accessed) >= slot.gc_time)
        });

        let removed = before - guard.slots.len();
        let remaining = guard.slots.len();
        guard.stats.record_collected(removed);
        guard.stats.set_total_entries(remaining);
        removed
    }

    /// Slot with the cache-wide defaults, for writes and subscriptions.
    fn default_slot(&self, id: u64, key: &QueryKey, now: Instant) -> Slot {
        new_slot(id, key, self.default_stale_time, self.gc_time, now)
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("default_stale_time", &self.default_stale_time)
            .field("gc_time", &self.gc_time)
            .finish()
    }
}

fn new_slot(id: u64, key: &QueryKey, stale_time: Duration, gc_time: Duration, now: Instant) -> Slot {
    Slot {
        id,
        entry: CacheEntry::new(key.clone(), stale_time),
        fetcher: None,
        in_flight: None,
        observers: Vec::new(),
        last_accessed: now,
        gc_time,
    }
}

fn erase<T, F, Fut>(fetcher: F) -> ErasedFetcher
where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || {
        let request = fetcher();
        async move {
            let data = request.await?;
            serde_json::to_value(data).map_err(RequestError::from)
        }
        .boxed()
    })
}

/// Records a fetch completion on its slot.
fn complete(cache: &Weak<Mutex<Inner>>, key: &QueryKey, slot_id: u64, seq: u64, result: Result<Value>) {
    let Some(inner) = cache.upgrade() else {
        return;
    };

    let notification = {
        let mut guard = inner.lock();
        let Inner { slots, stats, .. } = &mut *guard;
        let Some(slot) = slots.get_mut(key).filter(|slot| slot.id == slot_id) else {
            return;
        };

        let was_current = slot.in_flight.as_ref().is_some_and(|(s, _)| *s == seq);
        if was_current {
            slot.in_flight = None;
            slot.entry.set_fetching(false);
        }

        let applied = slot.entry.apply_fetch(seq, result);
        if !applied {
            stats.record_discarded();
            debug!("Discarded completion of {} (seq {})", key, seq);
        }

        if applied || was_current {
            slot.notification()
        } else {
            None
        }
    };

    notify_all(notification);
}

/// Removes one observer. Starts the idle clock when it was the last one.
pub(crate) fn unsubscribe(inner: &Mutex<Inner>, key: &QueryKey, observer_id: u64) {
    let mut guard = inner.lock();
    if let Some(slot) = guard.slots.get_mut(key) {
        slot.observers.retain(|(id, _)| *id != observer_id);
        if slot.observers.is_empty() {
            slot.last_accessed = Instant::now();
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn cache() -> QueryCache {
        QueryCache::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
        value: Value,
    ) -> impl Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move { Ok(value) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_read_absent_entry_starts_fetch() {
        let cache = cache();
        let key = QueryKey::new("students");
        let calls = Arc::new(AtomicUsize::new(0));

        let state: QueryState<Value> =
            cache.read(&key, counting_fetcher(calls.clone(), json!(["s1"])), QueryOptions::new());
        assert!(state.is_pending());
        assert!(state.is_fetching);

        let data: Value = cache
            .fetch(&key, counting_fetcher(calls.clone(), json!(["s1"])), QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(data, json!(["s1"]));
        // The second call joined the first fetch
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn test_fresh_read_is_served_from_cache() {
        let cache = cache();
        let key = QueryKey::new("subjects");
        let calls = Arc::new(AtomicUsize::new(0));

        let _: Value = cache
            .fetch(&key, counting_fetcher(calls.clone(), json!([1])), QueryOptions::new())
            .await
            .unwrap();
        let state: QueryState<Value> =
            cache.read(&key, counting_fetcher(calls.clone(), json!([2])), QueryOptions::new());

        assert_eq!(state.data, Some(json!([1])));
        assert!(!state.is_fetching);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_disabled_read_never_fetches() {
        let cache = cache();
        let key = query_key!["student", "missing"];
        let calls = Arc::new(AtomicUsize::new(0));

        let state: QueryState<Value> = cache.read(
            &key,
            counting_fetcher(calls.clone(), json!({})),
            QueryOptions::new().enabled(false),
        );
        tokio::task::yield_now().await;

        assert!(state.is_pending());
        assert!(!state.is_fetching);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_is_recorded_on_entry() {
        let cache = cache();
        let key = QueryKey::new("exams");

        let result: Result<Value> = cache
            .fetch(
                &key,
                || async { Err::<Value, _>(RequestError::api(500, "boom")) },
                QueryOptions::new(),
            )
            .await;

        assert_eq!(result, Err(RequestError::api(500, "boom")));
        let entry = cache.entry(&key).unwrap();
        assert_eq!(entry.status(), crate::query::QueryStatus::Error);
        assert!(!entry.is_fetching());
    }

    #[tokio::test]
    async fn test_late_completion_does_not_clobber_newer_fetch() {
        let cache = cache();
        let key = QueryKey::new("classes");
        let (tx_a, rx_a) = oneshot::channel::<Value>();
        let (tx_b, rx_b) = oneshot::channel::<Value>();
        let receivers = Arc::new(Mutex::new(vec![rx_b, rx_a]));

        let fetcher = move || {
            let rx = receivers.lock().pop();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(|_| RequestError::Network("closed".into())),
                    None => Err(RequestError::Network("no more responses".into())),
                }
            }
        };

        // Fetch A
        let _: QueryState<Value> = cache.read(&key, fetcher, QueryOptions::new());
        tokio::task::yield_now().await;
        // Fetch B, issued after A
        let handle_b = cache.refetch(&key).unwrap();
        tokio::task::yield_now().await;

        tx_b.send(json!("B")).unwrap();
        handle_b.wait().await.unwrap();
        tx_a.send(json!("A")).unwrap();
        // Let A's completion run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(cache.get_data::<String>(&key).unwrap().as_deref(), Some("B"));
        assert_eq!(cache.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_write_updates_and_notifies() {
        let cache = cache();
        let key = QueryKey::new("levels");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = cache.subscribe(&key, move |entry| {
            sink.lock().push(entry.data().cloned());
        });

        cache.write(&key, |old: Option<Vec<u32>>| {
            let mut list = old.unwrap_or_default();
            list.push(1);
            list
        })
        .unwrap();
        cache.write(&key, |old: Option<Vec<u32>>| {
            let mut list = old.unwrap_or_default();
            list.push(2);
            list
        })
        .unwrap();

        assert_eq!(cache.get_data::<Vec<u32>>(&key).unwrap(), Some(vec![1, 2]));
        assert_eq!(*seen.lock(), vec![Some(json!([1])), Some(json!([1, 2]))]);
    }

    #[tokio::test]
    async fn test_write_with_wrong_type_fails_without_change() {
        let cache = cache();
        let key = QueryKey::new("levels");
        cache.write(&key, |_: Option<String>| "text".to_string()).unwrap();

        let result = cache.write(&key, |old: Option<u32>| old.unwrap_or(0) + 1);
        assert!(matches!(result, Err(RequestError::Decode(_))));
        assert_eq!(cache.get_data::<String>(&key).unwrap().as_deref(), Some("text"));
    }

    #[tokio::test]
    async fn test_invalidate_refetches_observed_entries_only() {
        let cache = cache();
        let observed = query_key!["students", json!({"level": 1})];
        let idle = query_key!["students", json!({"level": 2})];
        let other = QueryKey::new("teachers");
        let calls = Arc::new(AtomicUsize::new(0));

        for key in [&observed, &idle, &other] {
            let _: Value = cache
                .fetch(key, counting_fetcher(calls.clone(), json!([])), QueryOptions::new())
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let _sub = cache.subscribe(&observed, |_| {});
        let count = cache.invalidate(&[QueryKey::new("students")]);
        assert_eq!(count, 2);
        tokio::task::yield_now().await;

        // Observed entry refetched immediately, idle one only marked
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(cache.entry(&idle).unwrap().is_stale());
        assert!(!cache.entry(&other).unwrap().is_stale());

        // Idle entry refetches on its next read
        let _: QueryState<Value> =
            cache.read(&idle, counting_fetcher(calls.clone(), json!([])), QueryOptions::new());
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_invalidate_discards_in_flight_result() {
        let cache = cache();
        let key = QueryKey::new("attendance");
        let (tx, rx) = oneshot::channel::<Value>();
        let rx = Arc::new(Mutex::new(Some(rx)));

        let _: QueryState<Value> = cache.read(
            &key,
            move || {
                let rx = rx.lock().take();
                async move {
                    match rx {
                        Some(rx) => rx.await.map_err(|_| RequestError::Network("closed".into())),
                        None => Ok(json!("refetched")),
                    }
                }
            },
            QueryOptions::new(),
        );
        cache.invalidate(&[key.clone()]);
        tx.send(json!("pre-mutation")).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let entry = cache.entry(&key).unwrap();
        assert!(entry.data().is_none());
        assert!(entry.is_stale());
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let cache = cache();
        let key = QueryKey::new("parents");
        let sub = cache.subscribe(&key, |_| {});
        assert_eq!(cache.observer_count(&key), 1);
        drop(sub);
        assert_eq!(cache.observer_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_garbage_respects_observers_and_idle_time() {
        let cache = QueryCache::new(Duration::ZERO, Duration::from_secs(10));
        let idle = QueryKey::new("events");
        let watched = QueryKey::new("clubs");

        cache.write(&idle, |_: Option<u32>| 1).unwrap();
        cache.write(&watched, |_: Option<u32>| 2).unwrap();
        let _sub = cache.subscribe(&watched, |_| {});

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.collect_garbage(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.collect_garbage(), 1);
        assert!(cache.entry(&idle).is_none());
        assert!(cache.entry(&watched).is_some());
        assert_eq!(cache.stats().collected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_read_gc_time_overrides_cache_default() {
        let cache = QueryCache::new(Duration::ZERO, Duration::from_secs(300));
        let short = QueryKey::new("timetable");
        let default = QueryKey::new("grades");

        let _: Value = cache
            .fetch(&short, || async { Ok(json!([])) }, QueryOptions::new().gc_time(Duration::from_secs(5)))
            .await
            .unwrap();
        let _: Value = cache
            .fetch(&default, || async { Ok(json!([])) }, QueryOptions::new())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.collect_garbage(), 1);
        assert!(cache.entry(&short).is_none());
        assert!(cache.entry(&default).is_some());

        tokio::time::advance(Duration::from_secs(295)).await;
        assert_eq!(cache.collect_garbage(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_entry_count_follows_new_keys_only() {
        let cache = cache();
        let key = QueryKey::new("students");

        let _: QueryState<Value> = cache.read(&key, || async { Ok(json!([])) }, QueryOptions::new());
        let _: QueryState<Value> = cache.read(&key, || async { Ok(json!([])) }, QueryOptions::new());
        cache.write(&key, |_: Option<Value>| json!([1])).unwrap();
        cache.write(&QueryKey::new("teachers"), |_: Option<Value>| json!([])).unwrap();
        cache
            .apply_optimistic(&QueryKey::new("levels"), |_| Ok(json!([])))
            .unwrap();
        let _: Value = cache
            .fetch(&QueryKey::new("exams"), || async { Ok(json!([])) }, QueryOptions::new())
            .await
            .unwrap();

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().total_entries, 4);
    }

    #[tokio::test]
    async fn test_overlapping_optimistic_edits_unwind_to_base() {
        let cache = cache();
        let key = query_key!["student", 7];
        let base = cache.write(&key, |_: Option<Value>| json!({"first_name": "John"})).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = cache.subscribe(&key, move |entry| {
            sink.lock().push(entry.data().cloned());
        });

        let first = cache.apply_optimistic(&key, |_| Ok(json!({"first_name": "Jane"}))).unwrap();
        let second = cache.apply_optimistic(&key, |_| Ok(json!({"first_name": "Mary"}))).unwrap();

        assert!(cache.rollback(second));
        assert!(cache.rollback(first));
        assert_eq!(
            cache.get_data::<Value>(&key).unwrap(),
            Some(json!({"first_name": "John"}))
        );
        assert_eq!(cache.entry(&key).unwrap().version(), base);
        assert_eq!(
            seen.lock().last().cloned().flatten(),
            Some(json!({"first_name": "John"}))
        );
    }

    #[tokio::test]
    async fn test_completion_after_clear_is_dropped() {
        let cache = cache();
        let key = QueryKey::new("user");
        let (tx, rx) = oneshot::channel::<Value>();
        let rx = Arc::new(Mutex::new(Some(rx)));

        let _: QueryState<Value> = cache.read(
            &key,
            move || {
                let rx = rx.lock().take();
                async move {
                    match rx {
                        Some(rx) => rx.await.map_err(|_| RequestError::Network("closed".into())),
                        None => Ok(json!(null)),
                    }
                }
            },
            QueryOptions::new(),
        );
        cache.clear();
        cache.write(&key, |_: Option<String>| "next-session".to_string()).unwrap();

        tx.send(json!("previous-session")).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            cache.get_data::<String>(&key).unwrap().as_deref(),
            Some("next-session")
        );
    }

    #[tokio::test]
    async fn test_remove_by_prefix() {
        let cache = cache();
        cache.write(&query_key!["student", 1], |_: Option<u32>| 1).unwrap();
        cache.write(&query_key!["student", 2], |_: Option<u32>| 2).unwrap();
        cache.write(&QueryKey::new("students"), |_: Option<u32>| 3).unwrap();

        assert_eq!(cache.remove(&[QueryKey::new("student")]), 2);
        assert_eq!(cache.len(), 1);
    }
}
