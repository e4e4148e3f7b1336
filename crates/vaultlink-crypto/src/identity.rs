//! Ed25519 signing identities and nkey encoding.
//!
//! A **public id** is an nkey: a type prefix byte, the 32-byte Ed25519 public key and
//! a CRC-16/XMODEM checksum (little-endian), base32-encoded without padding. User
//! public ids start with `U`, user seeds with `SU`.
//!
//! # Example
//!
//! ```
//! use vaultlink_crypto::identity::{SigningIdentity, SoftwareIdentity};
//!
//! let identity = SoftwareIdentity::generate();
//! let public_id = identity.public_id();
//! assert!(public_id.as_str().starts_with('U'));
//!
//! let signature = identity.sign(b"server nonce").unwrap();
//! assert!(public_id.verify(b"server nonce", &signature));
//! ```

use std::fmt;

use base32::Alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

const NKEY_ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

/// Prefix byte of an encoded seed (`S`).
pub const PREFIX_BYTE_SEED: u8 = 18 << 3;
/// Prefix byte of a user public key (`U`).
pub const PREFIX_BYTE_USER: u8 = 20 << 3;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid nkey encoding")]
    InvalidEncoding,

    #[error("nkey checksum mismatch")]
    ChecksumMismatch,

    #[error("unexpected nkey prefix byte {0}")]
    InvalidPrefix(u8),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid public key")]
    InvalidKey,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("malformed credential: {0}")]
    MalformedCredential(String),
}

/// Something that can prove possession of a user key.
///
/// Software keys live in memory; other backends (secure enclaves, hardware tokens)
/// implement the same trait and never expose the seed.
pub trait SigningIdentity: Send + Sync {
    fn public_id(&self) -> PublicId;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError>;
}

/// Sign a server nonce and encode the signature as base64url without padding.
pub fn sign_nonce(identity: &dyn SigningIdentity, nonce: &str) -> Result<String, IdentityError> {
    let signature = identity.sign(nonce.as_bytes())?;
    Ok(URL_SAFE_NO_PAD.encode(signature))
}

/// Decode a base64url nonce signature as produced by [`sign_nonce`].
pub fn decode_signature(encoded: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(encoded).ok()
}

/// nkey-encoded user public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicId(String);

impl PublicId {
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(encode(&[PREFIX_BYTE_USER], bytes))
    }

    /// Parse and checksum-verify a `U…` public id.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let raw = decode(s)?;
        if raw[0] != PREFIX_BYTE_USER {
            return Err(IdentityError::InvalidPrefix(raw[0]));
        }
        if raw.len() != 33 {
            return Err(IdentityError::InvalidKeyLength(raw.len() - 1));
        }
        Ok(Self(s.to_string()))
    }

    pub fn to_bytes(&self) -> Result<[u8; 32], IdentityError> {
        let raw = decode(&self.0)?;
        raw[1..]
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(raw.len() - 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify an Ed25519 signature made by this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(bytes) = self.to_bytes() else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&bytes) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicId({})", self.0)
    }
}

/// In-memory Ed25519 identity. The signing key is zeroized on drop.
pub struct SoftwareIdentity {
    signing_key: SigningKey,
}

impl SoftwareIdentity {
    /// Generate a new random identity using the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Load from an encoded `SU…` user seed.
    pub fn from_seed(seed: &str) -> Result<Self, IdentityError> {
        let raw = decode(seed.trim())?;
        if raw.len() != 34 {
            return Err(IdentityError::InvalidKeyLength(raw.len().saturating_sub(2)));
        }
        if raw[0] & 0xF8 != PREFIX_BYTE_SEED {
            return Err(IdentityError::InvalidPrefix(raw[0]));
        }
        let kind = ((raw[0] & 0x07) << 5) | ((raw[1] & 0xF8) >> 3);
        if kind != PREFIX_BYTE_USER {
            return Err(IdentityError::InvalidPrefix(kind));
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&raw[2..]);
        let identity = Self::from_seed_bytes(&key_bytes);
        key_bytes.zeroize();
        Ok(identity)
    }

    /// Encoded `SU…` seed.
    ///
    /// # Security
    /// Handle with care! The seed recreates the identity.
    pub fn seed(&self) -> Zeroizing<String> {
        let prefix = [
            PREFIX_BYTE_SEED | (PREFIX_BYTE_USER >> 5),
            (PREFIX_BYTE_USER & 0x1F) << 3,
        ];
        let key = Zeroizing::new(self.signing_key.to_bytes());
        Zeroizing::new(encode(&prefix, &key))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl SigningIdentity for SoftwareIdentity {
    fn public_id(&self) -> PublicId {
        PublicId::from_bytes(self.signing_key.verifying_key().as_bytes())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for SoftwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareIdentity")
            .field("public_id", &self.public_id())
            .finish_non_exhaustive()
    }
}

fn encode(prefix: &[u8], key: &[u8; 32]) -> String {
    let mut raw = Vec::with_capacity(prefix.len() + key.len() + 2);
    raw.extend_from_slice(prefix);
    raw.extend_from_slice(key);
    let crc = crc16::State::<crc16::XMODEM>::calculate(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());
    let encoded = base32::encode(NKEY_ALPHABET, &raw);
    raw.zeroize();
    encoded
}

/// Decode and checksum-verify an nkey. Returns prefix and key bytes.
fn decode(s: &str) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
    let mut raw = base32::decode(NKEY_ALPHABET, s).ok_or(IdentityError::InvalidEncoding)?;
    if raw.len() < 4 {
        raw.zeroize();
        return Err(IdentityError::InvalidEncoding);
    }
    let body_len = raw.len() - 2;
    let expected = u16::from_le_bytes([raw[body_len], raw[body_len + 1]]);
    if crc16::State::<crc16::XMODEM>::calculate(&raw[..body_len]) != expected {
        raw.zeroize();
        return Err(IdentityError::ChecksumMismatch);
    }
    raw.truncate(body_len);
    Ok(Zeroizing::new(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_id_shape() {
        let identity = SoftwareIdentity::generate();
        let public_id = identity.public_id();

        // 35 bytes -> 56 base32 characters
        assert_eq!(public_id.as_str().len(), 56);
        assert!(public_id.as_str().starts_with('U'));
    }

    #[test]
    fn test_seed_shape_and_roundtrip() {
        let identity = SoftwareIdentity::generate();
        let seed = identity.seed();
        assert!(seed.starts_with("SU"));

        let restored = SoftwareIdentity::from_seed(&seed).unwrap();
        assert_eq!(restored.public_id(), identity.public_id());
    }

    #[test]
    fn test_sign_verify() {
        let identity = SoftwareIdentity::generate();
        let public_id = identity.public_id();
        let signature = identity.sign(b"nonce-123").unwrap();

        assert!(public_id.verify(b"nonce-123", &signature));
        assert!(!public_id.verify(b"nonce-124", &signature));
    }

    #[test]
    fn test_sign_nonce_is_base64url() {
        let identity = SoftwareIdentity::generate();
        let encoded = sign_nonce(&identity, "abc+/=").unwrap();
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));

        let signature = decode_signature(&encoded).unwrap();
        assert!(identity.public_id().verify(b"abc+/=", &signature));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let identity = SoftwareIdentity::generate();
        let mut chars: Vec<char> = identity.public_id().as_str().chars().collect();
        chars[10] = if chars[10] == 'A' { 'B' } else { 'A' };
        let corrupted: String = chars.into_iter().collect();
        assert!(matches!(
            PublicId::parse(&corrupted),
            Err(IdentityError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_public_id_is_not_a_seed() {
        let identity = SoftwareIdentity::generate();
        assert!(SoftwareIdentity::from_seed(identity.public_id().as_str()).is_err());
        assert!(PublicId::parse(&identity.seed()).is_err());
    }

    #[test]
    fn test_debug_hides_seed() {
        let identity = SoftwareIdentity::generate();
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains(identity.seed().as_str()));
    }
}
