//! Subscription guard for query cache observers.

use std::sync::Weak;

use parking_lot::Mutex;

use crate::query::store::{unsubscribe, Inner};
use crate::query::QueryKey;

/// Keeps an observer registered on one key.
///
/// Dropping the guard unsubscribes. The guard does not keep the cache alive.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cache: Weak<Mutex<Inner>>,
    key: QueryKey,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(cache: Weak<Mutex<Inner>>, key: QueryKey, id: u64) -> Self {
        Self { cache, key, id }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            unsubscribe(&inner, &self.key, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
