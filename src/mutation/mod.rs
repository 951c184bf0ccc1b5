//! Mutation Module
//!
//! Writes with optimistic edits, rollback and invalidation propagation.

mod executor;
mod optimistic;
mod propagator;

pub use executor::{MutationExecutor, MutationOptions};
pub use optimistic::Optimistic;
pub use propagator::InvalidationPropagator;
