//! Response interpretation: unauthorized detection and error payload decoding.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{FieldErrors, RequestError, Result};

/// Application code the backend uses for an invalid or expired access token.
pub const TOKEN_NOT_VALID: &str = "token_not_valid";

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl RawResponse {
    fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// 401, or any status carrying the `token_not_valid` application code.
    pub fn is_unauthorized(&self) -> bool {
        if self.status == StatusCode::UNAUTHORIZED {
            return true;
        }
        if self.status.is_success() {
            return false;
        }
        self.json().is_some_and(|body| {
            ["code", "detail"]
                .iter()
                .any(|field| body.get(field).and_then(Value::as_str) == Some(TOKEN_NOT_VALID))
        })
    }

    /// Decodes a success body. An empty body decodes as JSON `null`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return serde_json::from_value(Value::Null).map_err(RequestError::from);
        }
        serde_json::from_slice(&self.body).map_err(RequestError::from)
    }

    /// Builds the `Api` error for a non-success response.
    pub fn into_api_error(self) -> RequestError {
        let status = self.status.as_u16();
        let Some(body) = self.json() else {
            return RequestError::api(status, generic_message(status));
        };

        let message = ["message", "detail", "error"]
            .iter()
            .find_map(|field| body.get(field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| generic_message(status));

        RequestError::Api {
            status,
            message,
            field_errors: field_errors(&body),
        }
    }
}

fn generic_message(status: u16) -> String {
    format!("HTTP error: status {}", status)
}

/// Validation detail: an `errors` object, or DRF-style top-level
/// `{"field": ["msg", ...]}` entries.
fn field_errors(body: &Value) -> Option<FieldErrors> {
    let source = match body.get("errors") {
        Some(Value::Object(map)) => map,
        _ => body.as_object()?,
    };

    let errors: FieldErrors = source
        .iter()
        .filter(|(field, _)| !matches!(field.as_str(), "message" | "detail" | "error" | "code"))
        .filter_map(|(field, value)| {
            let messages = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                Value::String(msg) if body.get("errors").is_some() => vec![msg.clone()],
                _ => return None,
            };
            (!messages.is_empty()).then(|| (field.clone(), messages))
        })
        .collect();

    (!errors.is_empty()).then_some(errors)
}
