//! Request DTOs for the backend API
//!
//! Defines the structure of outgoing HTTP request bodies owned by the core.

use serde::Serialize;

/// Request body for `POST /auth/login/`
#[derive(Clone, Serialize)]
pub struct LoginRequest {
    /// Account email
    pub email: String,
    /// Plain password
    pub password: String,
}

impl LoginRequest {
    /// Creates a new LoginRequest
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Request body for `POST /auth/token/refresh/`
#[derive(Clone, Serialize)]
pub struct RefreshRequest<'a> {
    /// The refresh token being exchanged
    pub refresh: &'a str,
}
