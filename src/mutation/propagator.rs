//! Invalidation Propagator Module
//!
//! Turns a mutation's declared invalidation set into cache invalidations,
//! expanding declared cascades of derived keys.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::query::{QueryCache, QueryKey};

// == Invalidation Propagator ==
/// Marks cached reads stale after a successful write.
#[derive(Clone)]
pub struct InvalidationPropagator {
    cache: QueryCache,
    /// (source prefix, derived prefixes) pairs
    cascades: Arc<RwLock<Vec<(QueryKey, Vec<QueryKey>)>>>,
}

impl InvalidationPropagator {
    pub fn new(cache: QueryCache) -> Self {
        Self {
            cache,
            cascades: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Declares that invalidating anything under `from` also invalidates
    /// everything under each of `to`.
    ///
    /// Cascades chain: if `a` cascades to `b` and `b` to `c`, invalidating
    /// `a` reaches `c`. Cycles are fine.
    pub fn cascade(&self, from: QueryKey, to: impl IntoIterator<Item = QueryKey>) {
        let to: Vec<QueryKey> = to.into_iter().collect();
        debug!("Registered cascade {} -> {:?}", from, to);
        self.cascades.write().push((from, to));
    }

    /// Full set of prefixes to invalidate for `prefixes`, cascades applied.
    pub fn expand(&self, prefixes: &[QueryKey]) -> Vec<QueryKey> {
        let rules = self.cascades.read();
        let mut expanded: Vec<QueryKey> = Vec::with_capacity(prefixes.len());
        let mut seen: HashSet<QueryKey> = HashSet::new();
        for prefix in prefixes {
            if seen.insert(prefix.clone()) {
                expanded.push(prefix.clone());
            }
        }

        let mut next = 0;
        while next < expanded.len() {
            let prefix = expanded[next].clone();
            for (from, targets) in rules.iter() {
                if !prefix.starts_with(from) {
                    continue;
                }
                for target in targets {
                    if seen.insert(target.clone()) {
                        expanded.push(target.clone());
                    }
                }
            }
            next += 1;
        }
        expanded
    }

    /// Invalidates every entry under `prefixes` and their cascades.
    ///
    /// Returns the number of cache entries marked stale.
    pub fn propagate(&self, prefixes: &[QueryKey]) -> usize {
        if prefixes.is_empty() {
            return 0;
        }
        let expanded = self.expand(prefixes);
        let count = self.cache.invalidate(&expanded);
        debug!(
            "Propagated invalidation of {} prefixes ({} after cascades), {} entries stale",
            prefixes.len(),
            expanded.len(),
            count
        );
        count
    }
}

impl std::fmt::Debug for InvalidationPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationPropagator")
            .field("cascades", &self.cascades.read().len())
            .finish()
    }
}
