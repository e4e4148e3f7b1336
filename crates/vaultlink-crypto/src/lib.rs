//! Cryptographic primitives for Vaultlink.
//!
//! This crate provides:
//! - Ed25519 signing identities with nkey-encoded public ids and seeds
//! - Credential parsing (`.creds` documents and vault-issued bundles)
//! - X25519 + HKDF-SHA256 session key derivation
//! - ChaCha20-Poly1305 session envelopes with nonce-reuse protection
//! - A keyring that keeps the previous session usable through a rotation grace period
//!
//! # Design
//!
//! Sessions are end-to-end between the app and the vault and do not depend on the
//! transport's TLS. Nonces are random, so replay protection is a bounded cache of
//! authenticated nonces rather than a sequence window.

#![forbid(unsafe_code)]

pub mod credential;
pub mod exchange;
pub mod identity;
pub mod keyring;
pub mod nonce_cache;
pub mod session;

pub use credential::Credential;
pub use exchange::{EphemeralKeypair, SessionKey};
pub use identity::{sign_nonce, IdentityError, PublicId, SigningIdentity, SoftwareIdentity};
pub use keyring::{RotationState, SessionKeyring};
pub use nonce_cache::NonceCache;
pub use session::{EncryptedEnvelope, Session, SessionError};
