//! Mutation Executor Module
//!
//! Runs writes with an optional optimistic cache edit, rolling the edit back
//! on failure and propagating invalidation on success.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::{MutationError, Result};
use crate::mutation::{InvalidationPropagator, Optimistic};
use crate::query::{OptimisticTicket, QueryCache, QueryKey};

// == Mutation Options ==
/// What a mutation does to the cache around the network call.
pub struct MutationOptions<V, R> {
    pub optimistic: Option<Optimistic<V, R>>,
    /// Prefixes to invalidate once the write succeeds
    pub invalidates: Vec<QueryKey>,
}

impl<V, R> Default for MutationOptions<V, R> {
    fn default() -> Self {
        Self {
            optimistic: None,
            invalidates: Vec::new(),
        }
    }
}

impl<V, R> MutationOptions<V, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(mut self, edit: Optimistic<V, R>) -> Self {
        self.optimistic = Some(edit);
        self
    }

    pub fn invalidates(mut self, prefixes: impl IntoIterator<Item = QueryKey>) -> Self {
        self.invalidates.extend(prefixes);
        self
    }
}

// == Mutation Executor ==
#[derive(Clone, Debug)]
pub struct MutationExecutor {
    cache: QueryCache,
    propagator: InvalidationPropagator,
}

impl MutationExecutor {
    pub fn new(cache: QueryCache, propagator: InvalidationPropagator) -> Self {
        Self { cache, propagator }
    }

    pub fn propagator(&self) -> &InvalidationPropagator {
        &self.propagator
    }

    /// Runs `write(variables)`.
    ///
    /// With an optimistic edit, the touched entry is snapshotted and edited
    /// before the write starts. On failure only this mutation's edit is
    /// undone (unless a plain write or fetch has overwritten the entry since)
    /// and no invalidation runs. Other mutations still in flight on the same
    /// key keep their edits. Failed writes are never retried.
    pub async fn mutate<V, R, F, Fut>(
        &self,
        write: F,
        variables: V,
        options: MutationOptions<V, R>,
    ) -> std::result::Result<R, MutationError>
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let MutationOptions {
            optimistic,
            invalidates,
        } = options;

        let applied = match optimistic {
            Some(Optimistic {
                key,
                apply,
                reconcile,
            }) => {
                let ticket = self
                    .cache
                    .apply_optimistic(&key, |current| apply(current, &variables))
                    .map_err(|err| MutationError::new(err, false))?;
                debug!("Applied optimistic edit to {} (version {})", key, ticket.version);
                Some((ticket, reconcile))
            }
            None => None,
        };

        match write(variables).await {
            Ok(result) => {
                if let Some((ticket, reconcile)) = applied {
                    self.cache.settle(&ticket);
                    if let Some(reconcile) = reconcile {
                        self.reconcile(&ticket, |current| reconcile(current, &result));
                    }
                }
                self.propagator.propagate(&invalidates);
                Ok(result)
            }
            Err(err) => {
                let rolled_back = match applied {
                    Some((ticket, _)) => self.cache.rollback(ticket),
                    None => false,
                };
                warn!("Mutation failed (rolled back: {}): {}", rolled_back, err);
                Err(MutationError::new(err, rolled_back))
            }
        }
    }

    fn reconcile<F>(&self, ticket: &OptimisticTicket, edit: F)
    where
        F: FnOnce(Option<serde_json::Value>) -> Result<serde_json::Value>,
    {
        match self.cache.reconcile(ticket, edit) {
            Ok(true) => debug!("Reconciled {} with server result", ticket.key),
            Ok(false) => debug!("Skipped reconcile of {}: entry changed since edit", ticket.key),
            // The write itself succeeded; a bad reconcile only leaves the optimistic value
            Err(err) => warn!("Failed to reconcile {}: {}", ticket.key, err),
        }
    }
}
