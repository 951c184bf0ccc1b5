//! Error types for the synchronization layer
//!
//! Provides unified error handling using thiserror.

use std::collections::BTreeMap;

use thiserror::Error;

/// Field name to validation messages, as returned by the backend.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

// == Request Error Enum ==
/// Every way a request through the pipeline can fail.
///
/// Cloneable because a single fetch result is shared by every reader that
/// joined it and is also recorded on the cache entry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// Transport failed, no response was received
    #[error("Network error: {0}")]
    Network(String),

    /// Refresh failed or no refresh token was available; credentials are cleared
    #[error("Authentication expired")]
    AuthExpired,

    /// Server answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        field_errors: Option<FieldErrors>,
    },

    /// A success body (or cached value) could not be decoded into the requested type
    #[error("Decode error: {0}")]
    Decode(String),
}

impl RequestError {
    /// Shorthand for an `Api` error without field detail.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        RequestError::Api {
            status,
            message: message.into(),
            field_errors: None,
        }
    }

    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the caller should send the user back to login.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, RequestError::AuthExpired)
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RequestError::Decode(err.to_string())
        } else {
            RequestError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        RequestError::Decode(err.to_string())
    }
}

// == Mutation Error ==
/// A failed write.
///
/// By the time a caller observes this error, any optimistic edit the mutation
/// applied has already been rolled back (`rolled_back` is false when there was
/// nothing to undo, or a newer write had since replaced the edit).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Mutation failed: {source}")]
pub struct MutationError {
    #[source]
    pub source: RequestError,
    pub rolled_back: bool,
}

impl MutationError {
    pub fn new(source: RequestError, rolled_back: bool) -> Self {
        Self {
            source,
            rolled_back,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for pipeline and cache operations.
pub type Result<T> = std::result::Result<T, RequestError>;
