//! End-to-end encrypted sessions with the vault.
//!
//! A session is established from an X25519 exchange (see [`crate::exchange`]) and is
//! independent of transport security. Payloads are sealed with ChaCha20-Poly1305 under
//! a fresh random nonce; the associated data binds the envelope version and the
//! session id, so an envelope cannot be replayed into another session.

use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vaultlink_core::protocol::SessionInfo;

use crate::exchange::{decode_public_key, EphemeralKeypair, SessionKey};
use crate::nonce_cache::NonceCache;

/// Envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

pub const NONCE_LEN: usize = 12;

/// Session encryption errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,

    #[error("nonce reuse detected")]
    NonceReuse,

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session expired: {0}")]
    Expired(String),

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("invalid peer public key")]
    InvalidPeerKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("no session established")]
    NoSession,
}

/// Wire form of an encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub v: u8,
    pub session_id: String,
    /// Base64 12-byte nonce.
    pub nonce: String,
    /// Base64 ciphertext with appended tag.
    pub ciphertext: String,
}

pub struct Session {
    id: String,
    cipher: ChaCha20Poly1305,
    local_public: [u8; 32],
    remote_public: [u8; 32],
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    seen: Mutex<NonceCache>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        key: &SessionKey,
        local_public: [u8; 32],
        remote_public: [u8; 32],
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            local_public,
            remote_public,
            created_at: Utc::now(),
            expires_at,
            seen: Mutex::new(NonceCache::new()),
        }
    }

    /// Complete an exchange from the vault's `session_info`.
    pub fn establish(
        keypair: &EphemeralKeypair,
        info: &SessionInfo,
    ) -> Result<Self, SessionError> {
        let remote_public = decode_public_key(&info.vault_session_public_key)?;
        let key = keypair.derive(&remote_public, &info.session_id)?;
        Ok(Self::new(
            info.session_id.clone(),
            &key,
            keypair.public_key(),
            remote_public,
            info.expires_at,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_public_key(&self) -> &[u8; 32] {
        &self.local_public
    }

    pub fn remote_public_key(&self) -> &[u8; 32] {
        &self.remote_public
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, SessionError> {
        self.seal_at(plaintext, Utc::now())
    }

    pub fn seal_at(
        &self,
        plaintext: &[u8],
        now: DateTime<Utc>,
    ) -> Result<EncryptedEnvelope, SessionError> {
        if self.is_expired_at(now) {
            return Err(SessionError::Expired(self.id.clone()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aad = associated_data(ENVELOPE_VERSION, &self.id);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| SessionError::Encryption)?;

        Ok(EncryptedEnvelope {
            v: ENVELOPE_VERSION,
            session_id: self.id.clone(),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, SessionError> {
        self.open_at(envelope, Utc::now())
    }

    /// Decrypt with replay protection.
    ///
    /// # Errors
    /// Returns `SessionError::NonceReuse` if the nonce already authenticated once.
    pub fn open_at(
        &self,
        envelope: &EncryptedEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, SessionError> {
        if envelope.v != ENVELOPE_VERSION {
            return Err(SessionError::UnsupportedVersion(envelope.v));
        }
        if envelope.session_id != self.id {
            return Err(SessionError::UnknownSession(envelope.session_id.clone()));
        }
        if self.is_expired_at(now) {
            return Err(SessionError::Expired(self.id.clone()));
        }

        let nonce: [u8; NONCE_LEN] = STANDARD
            .decode(&envelope.nonce)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| SessionError::InvalidEnvelope("nonce".into()))?;
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|_| SessionError::InvalidEnvelope("ciphertext".into()))?;

        // Check the cache BEFORE decryption (fail fast)
        if !self.seen().check(&nonce) {
            return Err(SessionError::NonceReuse);
        }

        let aad = associated_data(envelope.v, &envelope.session_id);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SessionError::Decryption)?;

        // Only record after successful authentication
        if !self.seen().check_and_insert(nonce) {
            return Err(SessionError::NonceReuse);
        }
        Ok(plaintext)
    }

    fn seen(&self) -> MutexGuard<'_, NonceCache> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn associated_data(version: u8, session_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + session_id.len());
    aad.push(version);
    aad.extend_from_slice(session_id.as_bytes());
    aad
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    /// App and vault ends of one session.
    pub(crate) fn session_pair(id: &str, ttl: Duration) -> (Session, Session) {
        let app = EphemeralKeypair::generate();
        let vault = EphemeralKeypair::generate();
        let expires_at = Utc::now() + ttl;

        let app_key = app.derive(&vault.public_key(), id).unwrap();
        let vault_key = vault.derive(&app.public_key(), id).unwrap();
        (
            Session::new(id, &app_key, app.public_key(), vault.public_key(), expires_at),
            Session::new(id, &vault_key, vault.public_key(), app.public_key(), expires_at),
        )
    }

    #[test]
    fn test_encrypted_session() {
        let (app, vault) = session_pair("s1", Duration::hours(1));

        let envelope = app.seal(b"hello from app").unwrap();
        assert_eq!(vault.open(&envelope).unwrap(), b"hello from app");

        let envelope = vault.seal(b"hello from vault").unwrap();
        assert_eq!(app.open(&envelope).unwrap(), b"hello from vault");
    }

    #[test]
    fn test_establish_from_session_info() {
        let app = EphemeralKeypair::generate();
        let vault = EphemeralKeypair::generate();
        let info = SessionInfo {
            session_id: "s1".into(),
            vault_session_public_key: vault.public_key_base64(),
            expires_at: Utc::now() + Duration::hours(1),
        };

        let session = Session::establish(&app, &info).unwrap();
        let vault_key = vault.derive(&app.public_key(), "s1").unwrap();
        let peer = Session::new(
            "s1",
            &vault_key,
            vault.public_key(),
            app.public_key(),
            info.expires_at,
        );

        let envelope = peer.seal(b"secret").unwrap();
        assert_eq!(session.open(&envelope).unwrap(), b"secret");
    }

    #[test]
    fn test_replay_protection() {
        let (app, vault) = session_pair("s1", Duration::hours(1));
        let envelope = app.seal(b"important message").unwrap();

        assert!(vault.open(&envelope).is_ok());
        assert!(matches!(vault.open(&envelope), Err(SessionError::NonceReuse)));
    }

    #[test]
    fn test_tampering_fails_closed() {
        let (app, vault) = session_pair("s1", Duration::hours(1));
        let mut envelope = app.seal(b"payload").unwrap();
        let mut bytes = STANDARD.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        envelope.ciphertext = STANDARD.encode(bytes);

        assert!(matches!(vault.open(&envelope), Err(SessionError::Decryption)));
    }

    #[test]
    fn test_failed_decrypt_does_not_burn_nonce() {
        let (app, vault) = session_pair("s1", Duration::hours(1));
        let good = app.seal(b"payload").unwrap();
        let mut bad = good.clone();
        bad.ciphertext = STANDARD.encode(b"garbage that fails authentication");

        assert!(vault.open(&bad).is_err());
        assert_eq!(vault.open(&good).unwrap(), b"payload");
    }

    #[test]
    fn test_envelope_checks() {
        let (app, vault) = session_pair("s1", Duration::hours(1));
        let envelope = app.seal(b"x").unwrap();

        let mut wrong_version = envelope.clone();
        wrong_version.v = 2;
        assert!(matches!(
            vault.open(&wrong_version),
            Err(SessionError::UnsupportedVersion(2))
        ));

        let mut wrong_session = envelope.clone();
        wrong_session.session_id = "s2".into();
        assert!(matches!(
            vault.open(&wrong_session),
            Err(SessionError::UnknownSession(_))
        ));

        let mut short_nonce = envelope;
        short_nonce.nonce = STANDARD.encode([0u8; 4]);
        assert!(matches!(
            vault.open(&short_nonce),
            Err(SessionError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_expired_session_refuses() {
        let (app, vault) = session_pair("s1", Duration::minutes(5));
        let envelope = app.seal(b"x").unwrap();
        let later = Utc::now() + Duration::minutes(10);

        assert!(matches!(
            vault.open_at(&envelope, later),
            Err(SessionError::Expired(_))
        ));
        assert!(matches!(
            app.seal_at(b"x", later),
            Err(SessionError::Expired(_))
        ));
    }

    #[test]
    fn test_nonces_are_fresh() {
        let (app, _vault) = session_pair("s1", Duration::hours(1));
        let a = app.seal(b"same").unwrap();
        let b = app.seal(b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
