//! Request and Response models for the backend API
//!
//! DTOs the core itself sends or interprets. Resource payloads (students,
//! teachers, grades, ...) stay opaque to the core.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{LoginRequest, RefreshRequest};
pub use responses::{list_items, AuthResponse, Page, RefreshResponse};
