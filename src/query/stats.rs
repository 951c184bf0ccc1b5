//! Cache Statistics Module
//!
//! Tracks how reads were served and how fetch completions were handled.

use serde::Serialize;

// == Cache Stats ==
/// Query cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Reads answered from fresh cached data
    pub hits: u64,
    /// Reads that needed a fetch (absent or stale entry)
    pub misses: u64,
    /// Network fetches issued
    pub fetches: u64,
    /// Reads that joined a fetch already in flight
    pub deduplicated: u64,
    /// Completions dropped because a later-issued fetch had already applied
    pub discarded: u64,
    /// Entries marked stale by invalidation
    pub invalidations: u64,
    /// Idle entries removed by garbage collection
    pub collected: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_fetch(&mut self) {
        self.fetches += 1;
    }

    pub fn record_deduplicated(&mut self) {
        self.deduplicated += 1;
    }

    pub fn record_discarded(&mut self) {
        self.discarded += 1;
    }

    pub fn record_invalidations(&mut self, count: usize) {
        self.invalidations += count as u64;
    }

    pub fn record_collected(&mut self, count: usize) {
        self.collected += count as u64;
    }

    // == Update Entry Count ==
    /// Updates the total entries count.
    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}
