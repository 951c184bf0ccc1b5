//! Response DTOs for the backend API
//!
//! Defines the structure of incoming HTTP response bodies the core interprets.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{CredentialPair, UserRecord};
use crate::error::{RequestError, Result};

/// Response body of `POST /auth/token/refresh/`
///
/// `access`/`refresh` is the canonical contract. Older backends answer with
/// `access_token`/`refresh_token`; those are accepted as a fallback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshResponse {
    #[serde(default)]
    access: Option<String>,
    #[serde(default)]
    refresh: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl RefreshResponse {
    /// New access token, if the server sent one
    pub fn access(&self) -> Option<&str> {
        non_empty(self.access.as_deref()).or_else(|| non_empty(self.access_token.as_deref()))
    }

    /// Rotated refresh token, if the server rotated it
    pub fn refresh(&self) -> Option<&str> {
        non_empty(self.refresh.as_deref()).or_else(|| non_empty(self.refresh_token.as_deref()))
    }
}

/// Response body of `POST /auth/login/`
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    #[serde(flatten)]
    tokens: RefreshResponse,
    /// The account that just signed in
    #[serde(default)]
    pub user: Option<UserRecord>,
}

impl AuthResponse {
    /// Both tokens of the new session, or None if either is missing
    pub fn credentials(&self) -> Option<CredentialPair> {
        match (self.tokens.access(), self.tokens.refresh()) {
            (Some(access), Some(refresh)) => Some(CredentialPair::new(access, refresh)),
            _ => None,
        }
    }
}

/// Paginated list envelope: `{count, next, previous, results}`
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// Normalizes a list endpoint payload into its items.
///
/// A bare array is taken as is, a paginated envelope yields its `results`,
/// anything else is treated as an empty list.
pub fn list_items<T: DeserializeOwned>(payload: Value) -> Result<Vec<T>> {
    match payload {
        Value::Array(_) => serde_json::from_value(payload).map_err(RequestError::from),
        Value::Object(ref map) if map.get("results").is_some_and(Value::is_array) => {
            let page: Page<T> = serde_json::from_value(payload)?;
            Ok(page.results)
        }
        _ => Ok(Vec::new()),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_refresh_response_canonical_fields() {
        let resp: RefreshResponse =
            serde_json::from_value(json!({"access": "a2", "refresh": "r2"})).unwrap();
        assert_eq!(resp.access(), Some("a2"));
        assert_eq!(resp.refresh(), Some("r2"));
    }

    #[test]
    fn test_refresh_response_legacy_fields() {
        let resp: RefreshResponse = serde_json::from_value(json!({"access_token": "a2"})).unwrap();
        assert_eq!(resp.access(), Some("a2"));
        assert_eq!(resp.refresh(), None);
    }

    #[test]
    fn test_refresh_response_prefers_canonical() {
        let resp: RefreshResponse =
            serde_json::from_value(json!({"access": "new", "access_token": "old"})).unwrap();
        assert_eq!(resp.access(), Some("new"));
    }

    #[test]
    fn test_refresh_response_without_access() {
        let resp: RefreshResponse = serde_json::from_value(json!({"detail": "ok"})).unwrap();
        assert_eq!(resp.access(), None);
    }

    #[test]
    fn test_auth_response_credentials() {
        let resp: AuthResponse = serde_json::from_value(json!({
            "access_token": "a",
            "refresh_token": "r",
            "token_type": "Bearer",
            "user": {"id": 1, "email": "a@b.c", "role": "admin"}
        }))
        .unwrap();

        assert_eq!(resp.credentials(), Some(CredentialPair::new("a", "r")));
        assert_eq!(resp.user.unwrap().id, 1);
    }

    #[test]
    fn test_auth_response_missing_refresh() {
        let resp: AuthResponse = serde_json::from_value(json!({"access": "a"})).unwrap();
        assert!(resp.credentials().is_none());
    }

    #[test]
    fn test_list_items_bare_array() {
        let items: Vec<u32> = list_items(json!([1, 2, 3])).unwrap();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn test_list_items_paginated() {
        let items: Vec<String> = list_items(json!({
            "count": 2, "next": null, "previous": null, "results": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[test]
    fn test_list_items_other_shape_is_empty() {
        let items: Vec<u32> = list_items(json!({"message": "nothing here"})).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_list_items_bad_element_is_error() {
        let result: Result<Vec<u32>> = list_items(json!(["x"]));
        assert!(matches!(result, Err(RequestError::Decode(_))));
    }
}
