//! Query Module
//!
//! Keyed cache of server reads with staleness, de-duplicated fetches,
//! prefix invalidation and change observers.

mod entry;
mod key;
mod stats;
pub(crate) mod store;
mod subscription;

#[cfg(test)]
mod property_tests;

pub use entry::{CacheEntry, QueryState, QueryStatus};
pub use key::QueryKey;
pub use stats::CacheStats;
pub(crate) use store::OptimisticTicket;
pub use store::{FetchHandle, Observer, QueryCache, QueryOptions};
pub use subscription::Subscription;
