//! Credential Types
//!
//! The access/refresh token pair and the signed-in user record.

use std::fmt;

use serde::{Deserialize, Serialize};

// == Credential Pair ==
/// Access and refresh token, always read and written together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    /// Short-lived bearer token attached to every request
    pub access: String,
    /// Long-lived token exchanged for a new access token
    pub refresh: String,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }

    /// Pair after a successful refresh. The refresh token is kept unless the
    /// server rotated it.
    pub fn renewed(&self, access: String, rotated_refresh: Option<String>) -> Self {
        Self {
            access,
            refresh: rotated_refresh.unwrap_or_else(|| self.refresh.clone()),
        }
    }
}

// Tokens must never end up in logs.
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

// == User Record ==
/// Role of the signed-in account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
    Staff,
}

/// Current user, persisted next to the credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Remaining profile fields the core does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl UserRecord {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renewed_keeps_refresh_without_rotation() {
        let pair = CredentialPair::new("a1", "r1");
        let renewed = pair.renewed("a2".to_string(), None);
        assert_eq!(renewed, CredentialPair::new("a2", "r1"));
    }

    #[test]
    fn test_renewed_takes_rotated_refresh() {
        let pair = CredentialPair::new("a1", "r1");
        let renewed = pair.renewed("a2".to_string(), Some("r2".to_string()));
        assert_eq!(renewed, CredentialPair::new("a2", "r2"));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let pair = CredentialPair::new("secret-access", "secret-refresh");
        let printed = format!("{:?}", pair);
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_user_record_keeps_unknown_fields() {
        let user: UserRecord = serde_json::from_value(json!({
            "id": 7,
            "email": "jane@school.test",
            "first_name": "Jane",
            "last_name": "Doe",
            "role": "teacher",
            "last_login": "2024-09-01T08:00:00Z"
        }))
        .unwrap();

        assert_eq!(user.role, Role::Teacher);
        assert!(user.is_active);
        assert_eq!(user.full_name(), "Jane Doe");
        assert_eq!(user.extra["last_login"], "2024-09-01T08:00:00Z");
    }
}
