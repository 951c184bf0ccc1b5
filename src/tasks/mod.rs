//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a client is alive.
//!
//! # Tasks
//! - Cache GC: Removes idle, unobserved query cache entries at configured intervals

mod gc;

pub use gc::spawn_gc_task;
