//! Vault operation names and their typed payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operations published to `{scope}.forVault.{op}`.
pub mod ops {
    pub const BOOTSTRAP: &str = "app.bootstrap";
    pub const CREDENTIALS_REFRESH: &str = "credentials.refresh";
    pub const SESSION_ROTATE: &str = "session.rotate";
}

/// Push types delivered on `{scope}.forApp.{type}`.
pub mod notifications {
    pub const CREDENTIALS_ROTATE: &str = "credentials.rotate";
    pub const SESSION_ROTATE: &str = "session.rotate";
}

/// Credential material as issued by the vault: either a `.creds` document or the
/// token and seed separately.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialBundle {
    Creds(String),
    Parts { jwt: String, seed: String },
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialBundle::Creds(_) => f.write_str("CredentialBundle::Creds(<redacted>)"),
            CredentialBundle::Parts { .. } => f.write_str("CredentialBundle::Parts(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub device_id: String,
    pub device_type: String,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_ttl_hours: Option<u32>,
    /// Base64 X25519 public key when a session should be established.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RotationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_before_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_rotation_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(alias = "vault_public_key")]
    pub vault_session_public_key: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub credentials: CredentialBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub credential_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_info: Option<RotationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    ScheduledRotation,
    ExpiryImminent,
}

/// Pushed by the vault ahead of credential expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRotation {
    pub credentials: CredentialBundle,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub credential_id: String,
    pub reason: RotationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_credential_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRefreshRequest {
    pub credential_id: String,
}

/// Issued credentials in a refresh reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialGrant {
    pub credentials: CredentialBundle,
    pub expires_at: DateTime<Utc>,
    pub credential_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRotateRequest {
    pub session_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<String>,
}
