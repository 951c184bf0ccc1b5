//! Cache Entry Module
//!
//! One cached result set with its status, staleness and ordering metadata.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{RequestError, Result};
use crate::query::QueryKey;

/// Source of entry versions. Never hands out the same number twice, so a
/// version restored by a rollback cannot collide with a later edit.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

// == Query Status ==
/// Outcome of the most recently applied fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No data has been produced yet
    Pending,
    /// Data is present
    Success,
    /// The last applied fetch failed (previous data, if any, is kept)
    Error,
}

// == Cache Entry ==
/// Cached data for one [`QueryKey`].
///
/// Only the query cache mutates entries; everything handed out is a clone.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: QueryKey,
    data: Option<Value>,
    status: QueryStatus,
    error: Option<RequestError>,
    /// Wall-clock time of the last data change
    last_updated_at: Option<DateTime<Utc>>,
    /// Monotonic time of the last data change, drives staleness
    updated_at: Option<Instant>,
    invalidated: bool,
    stale_time: Duration,
    fetching: bool,
    /// Fresh on every data change; restored along with the data on rollback
    version: u64,
    /// Optimistic edits not yet settled, oldest first
    pending: Vec<PendingEdit>,
    /// Sequence number handed to the most recently issued fetch
    issued_seq: u64,
    /// Highest sequence number whose completion was applied (or cancelled)
    applied_seq: u64,
}

/// Data-bearing fields captured before an optimistic edit.
#[derive(Debug, Clone)]
struct EntrySnapshot {
    data: Option<Value>,
    status: QueryStatus,
    error: Option<RequestError>,
    last_updated_at: Option<DateTime<Utc>>,
    updated_at: Option<Instant>,
    invalidated: bool,
    version: u64,
}

/// One outstanding optimistic edit: the version it produced and what it replaced.
#[derive(Debug, Clone)]
struct PendingEdit {
    version: u64,
    snapshot: EntrySnapshot,
}

impl CacheEntry {
    // == Constructor ==
    pub(crate) fn new(key: QueryKey, stale_time: Duration) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Pending,
            error: None,
            last_updated_at: None,
            updated_at: None,
            invalidated: false,
            stale_time,
            fetching: false,
            version: 0,
            pending: Vec::new(),
            issued_seq: 0,
            applied_seq: 0,
        }
    }

    // == Accessors ==
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Decodes the cached data into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.data
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(RequestError::from)
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated_at
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    // == Staleness ==
    /// Whether a read should trigger a refetch.
    ///
    /// Boundary condition: an entry is stale once its age is greater than or
    /// equal to the stale time, so a zero stale time means "always stale".
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    pub(crate) fn is_stale_at(&self, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match self.updated_at {
            Some(updated) => now.saturating_duration_since(updated) >= self.stale_time,
            None => true,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    // == Mutators (cache only) ==
    pub(crate) fn set_stale_time(&mut self, stale_time: Duration) {
        self.stale_time = stale_time;
    }

    pub(crate) fn set_fetching(&mut self, fetching: bool) {
        self.fetching = fetching;
    }

    pub(crate) fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Hands out the next fetch sequence number.
    pub(crate) fn begin_fetch(&mut self) -> u64 {
        self.issued_seq += 1;
        self.issued_seq
    }

    /// Makes every fetch issued so far unable to apply its result.
    pub(crate) fn cancel_fetches(&mut self) {
        self.applied_seq = self.issued_seq;
    }

    /// Applies a fetch completion unless a later-issued fetch already applied.
    ///
    /// Returns false when the completion was discarded.
    pub(crate) fn apply_fetch(&mut self, seq: u64, result: Result<Value>) -> bool {
        if seq <= self.applied_seq {
            return false;
        }
        self.applied_seq = seq;

        match result {
            Ok(value) => {
                self.set_data(value);
            }
            Err(err) => {
                // Keep the last good data around; readers see both
                self.status = QueryStatus::Error;
                self.error = Some(err);
            }
        }
        true
    }

    /// Replaces the data and returns the new version.
    ///
    /// Outstanding optimistic edits can no longer be undone afterwards.
    pub(crate) fn set_data(&mut self, value: Value) -> u64 {
        self.pending.clear();
        self.replace_data(value)
    }

    fn replace_data(&mut self, value: Value) -> u64 {
        self.data = Some(value);
        self.status = QueryStatus::Success;
        self.error = None;
        self.invalidated = false;
        self.last_updated_at = Some(Utc::now());
        self.updated_at = Some(Instant::now());
        self.version = next_version();
        self.version
    }

    // == Optimistic Edits ==
    /// Applies an optimistic value on top of the current data and remembers
    /// what it replaced. Returns the version identifying the edit.
    pub(crate) fn apply_optimistic(&mut self, value: Value) -> u64 {
        let snapshot = self.snapshot();
        let version = self.replace_data(value);
        self.pending.push(PendingEdit { version, snapshot });
        version
    }

    /// Undoes the optimistic edit that produced `version`.
    ///
    /// The topmost edit restores what it replaced, version included. An edit
    /// buried under later ones is spliced out instead: the edit above it now
    /// undoes to the state from before both. Returns false when the edit is no
    /// longer outstanding (settled, or overwritten by a plain write or fetch).
    pub(crate) fn rollback_optimistic(&mut self, version: u64) -> bool {
        let Some(pos) = self.pending.iter().position(|edit| edit.version == version) else {
            return false;
        };
        let edit = self.pending.remove(pos);
        match self.pending.get_mut(pos) {
            Some(above) => above.snapshot = edit.snapshot,
            None => self.restore(edit.snapshot),
        }
        true
    }

    /// Marks the optimistic edit that produced `version` as confirmed.
    ///
    /// Earlier edits still outstanding are dropped with it: the confirmed
    /// value was built on top of them, so they can no longer be undone alone.
    pub(crate) fn settle_optimistic(&mut self, version: u64) {
        if let Some(pos) = self.pending.iter().position(|edit| edit.version == version) {
            self.pending.drain(..=pos);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_edits(&self) -> usize {
        self.pending.len()
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            last_updated_at: self.last_updated_at,
            updated_at: self.updated_at,
            invalidated: self.invalidated,
            version: self.version,
        }
    }

    fn restore(&mut self, snapshot: EntrySnapshot) {
        self.data = snapshot.data;
        self.status = snapshot.status;
        self.error = snapshot.error;
        self.last_updated_at = snapshot.last_updated_at;
        self.updated_at = snapshot.updated_at;
        // An invalidation that arrived during the edit still applies
        self.invalidated = self.invalidated || snapshot.invalidated;
        self.version = snapshot.version;
    }
}

// == Query State ==
/// Typed view of an entry, as returned by a read.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub status: QueryStatus,
    pub error: Option<RequestError>,
    pub is_stale: bool,
    pub is_fetching: bool,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl<T: DeserializeOwned> QueryState<T> {
    pub(crate) fn from_entry(entry: &CacheEntry) -> Self {
        let (data, error) = match entry.data_as::<T>() {
            Ok(data) => (data, entry.error.clone()),
            Err(decode) => (None, Some(decode)),
        };
        Self {
            data,
            status: entry.status,
            error,
            is_stale: entry.is_stale(),
            is_fetching: entry.fetching,
            last_updated_at: entry.last_updated_at,
        }
    }
}

impl<T> QueryState<T> {
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}
