//! Campus Sync - client-side data synchronization for the campus REST API
//!
//! Authenticated request pipeline with single-retry token renewal, a keyed
//! query cache with staleness and invalidation, and a mutation executor with
//! optimistic edits and rollback.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod mutation;
pub mod query;
pub mod tasks;

pub use client::SyncClient;
pub use config::Config;
pub use error::{MutationError, RequestError};
pub use mutation::{MutationOptions, Optimistic};
pub use query::{QueryKey, QueryOptions, QueryState};
pub use tasks::spawn_gc_task;
