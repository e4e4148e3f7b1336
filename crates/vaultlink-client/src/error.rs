//! Client error types.

use thiserror::Error;
use vaultlink_core::{FrameError, SubjectError};
use vaultlink_crypto::{IdentityError, SessionError};

/// Connection-level failures. The supervisor decides how to recover from these.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("authorization rejected: {0}")]
    Authorization(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection stale: {0} pings unanswered")]
    StaleConnection(u32),

    #[error("frame rejected: {0}")]
    Frame(#[from] FrameError),

    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Whether reconnecting with the same credential may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_)
                | TransportError::Stream(_)
                | TransportError::HandshakeTimeout
                | TransportError::Protocol(_)
                | TransportError::StaleConnection(_)
        )
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, TransportError::Authorization(_))
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential available: {0}")]
    Unavailable(String),

    #[error("malformed credential: {0}")]
    Malformed(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("credential rotation failed: {0}")]
    Rotation(String),
}

/// Failures of a single request or publish.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("client is not connected")]
    NotConnected,

    #[error("client closed")]
    Closed,

    #[error("vault rejected request: {0}")]
    Rejected(String),

    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl From<FrameError> for RequestError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Subject(e) => RequestError::InvalidSubject(e),
            other => RequestError::Encode(other.to_string()),
        }
    }
}

/// Errors surfaced by the [`crate::VaultClient`] facade outside a single request.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Subject(#[from] SubjectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("client closed")]
    Closed,
}

impl From<vaultlink_common::Error> for ClientError {
    fn from(err: vaultlink_common::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}
