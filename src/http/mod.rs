//! HTTP Module
//!
//! Authenticated request pipeline with single-retry token renewal.

mod pipeline;
mod response;

pub use pipeline::{RequestPipeline, LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
pub use response::{RawResponse, TOKEN_NOT_VALID};

// Re-exported so callers can name methods without depending on reqwest
pub use reqwest::Method;
