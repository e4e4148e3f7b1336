//! Credential lifecycle: refresh before expiry, accept vault pushes, recover from
//! authorization failures.
//!
//! The current credential is an `Arc` swapped atomically. Subscriptions and pending
//! requests are never touched by a swap; a new credential takes effect at the next
//! handshake.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use vaultlink_core::protocol::{
    ops, CredentialGrant, CredentialRefreshRequest, CredentialRotation, RotationReason,
};
use vaultlink_crypto::Credential;

use crate::correlator::Correlator;
use crate::error::CredentialError;
use crate::types::{ConnectionState, StateCell};

/// Why a credential is being requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Initial,
    ExpiryImminent,
    AuthorizationRejected,
}

/// The external authority that issues credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, reason: RefreshReason) -> Result<Credential, CredentialError>;
}

/// Reads a `.creds` document from disk on every fetch, so an external process can
/// rewrite it.
#[derive(Debug, Clone)]
pub struct CredsFileSource {
    path: PathBuf,
}

impl CredsFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for CredsFileSource {
    async fn fetch(&self, reason: RefreshReason) -> Result<Credential, CredentialError> {
        debug!("reading credentials from {} ({:?})", self.path.display(), reason);
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CredentialError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Credential::from_creds(&text)?)
    }
}

/// Where an installed credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Configured,
    Source,
    Peer,
    Push(RotationReason),
}

#[derive(Debug, Clone)]
pub enum CredentialEvent {
    Installed {
        credential: Arc<Credential>,
        origin: CredentialOrigin,
    },
    RefreshFailed {
        error: String,
    },
}

pub struct CredentialManager {
    current: RwLock<Option<Arc<Credential>>>,
    source: Option<Arc<dyn CredentialSource>>,
    refresh_margin: chrono::Duration,
    rotation_timeout: Duration,
    refresh: Mutex<()>,
    events: broadcast::Sender<CredentialEvent>,
    correlator: Arc<Correlator>,
    state: Arc<StateCell>,
}

impl CredentialManager {
    pub fn new(
        initial: Option<Credential>,
        source: Option<Arc<dyn CredentialSource>>,
        refresh_margin: Duration,
        rotation_timeout: Duration,
        correlator: Arc<Correlator>,
        state: Arc<StateCell>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(initial.map(Arc::new)),
            source,
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            rotation_timeout,
            refresh: Mutex::new(()),
            events,
            correlator,
            state,
        }
    }

    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.events.subscribe()
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn needs_refresh(&self) -> bool {
        match self.current() {
            Some(credential) => credential.needs_refresh_at(self.refresh_margin, Utc::now()),
            None => self.source.is_some(),
        }
    }

    /// Replace the current credential.
    pub fn install(&self, credential: Credential, origin: CredentialOrigin) -> Arc<Credential> {
        let credential = Arc::new(credential);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&credential));
        info!(
            "credential {} installed ({:?}), expires {}",
            credential.credential_id(),
            origin,
            credential.expires_at()
        );
        let _ = self.events.send(CredentialEvent::Installed {
            credential: Arc::clone(&credential),
            origin,
        });
        credential
    }

    /// The current credential, rotated first if it is within the refresh margin.
    /// Concurrent callers share one rotation.
    pub async fn ensure_fresh(&self) -> Result<Arc<Credential>, CredentialError> {
        if let Some(credential) = self.fresh() {
            return Ok(credential);
        }

        let _guard = self.refresh.lock().await;
        if let Some(credential) = self.fresh() {
            return Ok(credential);
        }

        let current = self.current();
        if let Some(current) = &current {
            if self.state.get() == ConnectionState::Ready {
                match self.refresh_from_peer(current).await {
                    Ok(credential) => return Ok(self.install(credential, CredentialOrigin::Peer)),
                    Err(e) => warn!("peer credential refresh failed, trying source: {}", e),
                }
            }
        }

        let reason = match current {
            Some(_) => RefreshReason::ExpiryImminent,
            None => RefreshReason::Initial,
        };
        match self.fetch(reason).await {
            Ok(credential) => Ok(self.install(credential, CredentialOrigin::Source)),
            Err(e) => {
                let _ = self.events.send(CredentialEvent::RefreshFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn fresh(&self) -> Option<Arc<Credential>> {
        self.current()
            .filter(|c| !c.needs_refresh_at(self.refresh_margin, Utc::now()))
    }

    async fn refresh_from_peer(&self, current: &Credential) -> Result<Credential, CredentialError> {
        let request = CredentialRefreshRequest {
            credential_id: current.credential_id().to_string(),
        };
        let payload = serde_json::to_value(&request)
            .map_err(|e| CredentialError::Rotation(e.to_string()))?;
        let grant: CredentialGrant = self
            .correlator
            .request(ops::CREDENTIALS_REFRESH, payload, self.rotation_timeout)
            .await
            .and_then(|reply| reply.into_result())
            .map_err(|e| CredentialError::Rotation(e.to_string()))?;
        Ok(Credential::from_bundle(
            &grant.credentials,
            grant.expires_at,
            grant.credential_id,
        )?)
    }

    async fn fetch(&self, reason: RefreshReason) -> Result<Credential, CredentialError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| CredentialError::Unavailable("no credential source configured".into()))?;
        source.fetch(reason).await
    }

    /// The credential to present in the next handshake. `None` when nothing is
    /// configured, which only works against servers that do not require auth.
    pub async fn prepare_handshake(&self) -> Result<Option<Arc<Credential>>, CredentialError> {
        let current = self.current();
        if self.source.is_none() {
            if let Some(credential) = &current {
                if credential.is_expired_at(Utc::now()) {
                    warn!(
                        "credential {} has expired and cannot be replaced",
                        credential.credential_id()
                    );
                }
            }
            return Ok(current);
        }

        match self.ensure_fresh().await {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => match current {
                Some(credential) if !credential.is_expired_at(Utc::now()) => {
                    warn!("credential refresh failed, reusing current: {}", e);
                    Ok(Some(credential))
                }
                _ => Err(e),
            },
        }
    }

    /// Apply an unsolicited `credentials.rotate` push. Returns false for a stale push.
    pub fn handle_push(&self, rotation: CredentialRotation) -> Result<bool, CredentialError> {
        if let Some(current) = self.current() {
            if rotation.expires_at <= current.expires_at() {
                debug!(
                    "ignoring stale credential push {} (expires {})",
                    rotation.credential_id, rotation.expires_at
                );
                return Ok(false);
            }
        }
        let credential = Credential::from_bundle(
            &rotation.credentials,
            rotation.expires_at,
            rotation.credential_id.clone(),
        )?;
        self.install(credential, CredentialOrigin::Push(rotation.reason));
        Ok(true)
    }

    /// The server rejected the current credential. Fetch a replacement from the
    /// source; without one the caller must stop retrying.
    pub async fn on_authorization_failure(&self) -> Result<Arc<Credential>, CredentialError> {
        if self.source.is_none() {
            return Err(CredentialError::Rotation(
                "credential rejected and no source can replace it".into(),
            ));
        }
        let _guard = self.refresh.lock().await;
        match self.fetch(RefreshReason::AuthorizationRejected).await {
            Ok(credential) => Ok(self.install(credential, CredentialOrigin::Source)),
            Err(e) => {
                let _ = self.events.send(CredentialEvent::RefreshFailed {
                    error: e.to_string(),
                });
                Err(CredentialError::Rotation(e.to_string()))
            }
        }
    }
}
