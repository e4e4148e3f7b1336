//! Vaultlink client.
//!
//! Connects to a vault over an authenticated, subject-addressed WebSocket
//! transport and provides:
//! - publish/subscribe with automatic resubscription after reconnects
//! - request-reply correlated by request id, with timeouts and cancellation
//! - credential refresh, vault-pushed rotation and recovery from rejected credentials
//! - end-to-end encrypted sessions with rotation grace

pub mod client;
pub mod correlator;
pub mod credentials;
pub mod error;
pub mod helpers;
pub mod outbound;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use client::{VaultClient, VaultClientBuilder};
pub use correlator::{CancelHandle, PendingReply, Reply};
pub use credentials::{
    CredentialEvent, CredentialManager, CredentialOrigin, CredentialSource, CredsFileSource,
    RefreshReason,
};
pub use error::{ClientError, CredentialError, RequestError, TransportError};
pub use helpers::{bootstrap_request, read_creds, render_payload};
pub use registry::{Delivery, Subscription, SubscriptionId};
pub use session::SessionLayer;
pub use types::{BackoffPolicy, ClientConfig, ConnectionState};
