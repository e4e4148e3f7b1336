//! X25519 key agreement and HKDF session key derivation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::session::SessionError;

/// HKDF `info` for session keys.
pub const SESSION_KEY_INFO: &[u8] = b"vaultlink-session-v1";

pub const KEY_LEN: usize = 32;

/// Symmetric session key. Zeroized on drop.
pub struct SessionKey(Zeroizing<[u8; KEY_LEN]>);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// One-shot X25519 keypair for a single session.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Base64 public key as sent in `session_public_key`.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    /// Complete the exchange and derive the session key.
    ///
    /// Salt is the session id; a low-order peer key is rejected.
    pub fn derive(
        &self,
        peer_public: &[u8; 32],
        session_id: &str,
    ) -> Result<SessionKey, SessionError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(SessionError::InvalidPeerKey);
        }

        let hk = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), shared.as_bytes());
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(SESSION_KEY_INFO, &mut okm[..])
            .map_err(|_| SessionError::KeyDerivation)?;
        Ok(SessionKey(okm))
    }
}

/// Decode a base64 X25519 public key.
pub fn decode_public_key(encoded: &str) -> Result<[u8; 32], SessionError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| SessionError::InvalidPeerKey)?;
    bytes.try_into().map_err(|_| SessionError::InvalidPeerKey)
}
