//! Short-lived user credentials.
//!
//! A credential pairs a bearer token (the user JWT) with the identity that signs
//! handshake nonces. It is immutable; rotation replaces the whole value.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use vaultlink_core::protocol::CredentialBundle;
use zeroize::Zeroizing;

use crate::identity::{IdentityError, SigningIdentity, SoftwareIdentity};

const JWT_MARKER: &str = "JWT";
const SEED_MARKER: &str = "SEED";

#[derive(Debug, Default, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    jti: Option<String>,
}

#[derive(Clone)]
pub struct Credential {
    token: String,
    identity: Arc<dyn SigningIdentity>,
    seed: Option<Arc<Zeroizing<String>>>,
    expires_at: DateTime<Utc>,
    credential_id: String,
}

impl Credential {
    /// Credential backed by any signing backend.
    pub fn new(
        token: impl Into<String>,
        identity: Arc<dyn SigningIdentity>,
        expires_at: DateTime<Utc>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            identity,
            seed: None,
            expires_at,
            credential_id: credential_id.into(),
        }
    }

    /// Credential backed by an in-memory `SU…` seed.
    pub fn from_seed(
        token: impl Into<String>,
        seed: &str,
        expires_at: DateTime<Utc>,
        credential_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = SoftwareIdentity::from_seed(seed)?;
        Ok(Self {
            token: token.into(),
            identity: Arc::new(identity),
            seed: Some(Arc::new(Zeroizing::new(seed.trim().to_string()))),
            expires_at,
            credential_id: credential_id.into(),
        })
    }

    /// Parse a `.creds` document. Expiry and id come from the token's `exp` and
    /// `jti` claims; a token without `exp` never expires.
    pub fn from_creds(text: &str) -> Result<Self, IdentityError> {
        let token = armored_block(text, JWT_MARKER)
            .ok_or_else(|| IdentityError::MalformedCredential("missing JWT block".into()))?;
        let seed = Zeroizing::new(
            armored_block(text, SEED_MARKER)
                .ok_or_else(|| IdentityError::MalformedCredential("missing seed block".into()))?,
        );

        let claims = token_claims(&token)?;
        let expires_at = match claims.exp {
            Some(exp) => Utc
                .timestamp_opt(exp, 0)
                .single()
                .ok_or_else(|| IdentityError::MalformedCredential("invalid exp claim".into()))?,
            None => DateTime::<Utc>::MAX_UTC,
        };
        let credential_id = claims.jti.unwrap_or_default();

        Self::from_seed(token, &seed, expires_at, credential_id)
    }

    /// Build from vault-issued material. The supplied expiry and id win over any
    /// token claims.
    pub fn from_bundle(
        bundle: &CredentialBundle,
        expires_at: DateTime<Utc>,
        credential_id: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let mut credential = match bundle {
            CredentialBundle::Creds(text) => Self::from_creds(text)?,
            CredentialBundle::Parts { jwt, seed } => {
                Self::from_seed(jwt.clone(), seed, expires_at, String::new())?
            }
        };
        credential.expires_at = expires_at;
        credential.credential_id = credential_id.into();
        Ok(credential)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &dyn SigningIdentity {
        self.identity.as_ref()
    }

    /// The encoded seed, when the credential is backed by a software key.
    pub fn seed(&self) -> Option<&str> {
        self.seed.as_ref().map(|s| s.as_str())
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at.signed_duration_since(now)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the remaining lifetime is at or below `margin`.
    pub fn needs_refresh_at(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.remaining_at(now) <= margin
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("public_id", &self.identity.public_id())
            .field("expires_at", &self.expires_at)
            .field("credential_id", &self.credential_id)
            .finish_non_exhaustive()
    }
}

/// First non-empty line after a `-----BEGIN … {marker} …-----` header.
fn armored_block(text: &str, marker: &str) -> Option<String> {
    let mut lines = text.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if line.starts_with("-----BEGIN") && line.contains(marker) {
            return lines
                .find(|l| !l.is_empty())
                .filter(|l| !l.starts_with("---"))
                .map(ToOwned::to_owned);
        }
    }
    None
}

fn token_claims(token: &str) -> Result<TokenClaims, IdentityError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| IdentityError::MalformedCredential("token is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| IdentityError::MalformedCredential(format!("token claims: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| IdentityError::MalformedCredential(format!("token claims: {e}")))
}
