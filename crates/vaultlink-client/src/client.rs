use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use vaultlink_core::protocol::{
    notifications, ops, BootstrapRequest, BootstrapResponse, CredentialRotation,
};
use vaultlink_core::{Notification, Subject, VaultSubjects};
use vaultlink_crypto::{Credential, EncryptedEnvelope, EphemeralKeypair, RotationState};

use crate::correlator::{Correlator, PendingReply, Reply};
use crate::credentials::{CredentialEvent, CredentialManager, CredentialOrigin, CredentialSource};
use crate::error::{ClientError, CredentialError, RequestError, TransportError};
use crate::outbound::Outbound;
use crate::registry::{Delivery, Registry, Subscription, SubscriptionId};
use crate::session::SessionLayer;
use crate::supervisor::{Control, Supervisor};
use crate::types::{ClientConfig, ConnectionState, StateCell};

/// Builds a [`VaultClient`]. Must be called inside a Tokio runtime.
pub struct VaultClientBuilder {
    config: ClientConfig,
    credential: Option<Credential>,
    source: Option<Arc<dyn CredentialSource>>,
}

impl VaultClientBuilder {
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Where replacement credentials come from when the current one nears expiry or
    /// is rejected.
    pub fn credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> Result<VaultClient, ClientError> {
        self.config.validate()?;
        let subjects = VaultSubjects::new(self.config.scope.clone())?;

        let (outbound, frames) = Outbound::channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let state = Arc::new(StateCell::new());
        let registry = Arc::new(Registry::new(outbound.clone()));
        let correlator = Arc::new(Correlator::new(
            subjects.clone(),
            Arc::clone(&registry),
            outbound.clone(),
            Arc::clone(&state),
        ));
        let credentials = Arc::new(CredentialManager::new(
            self.credential,
            self.source,
            self.config.credential_refresh_margin,
            self.config.rotation_timeout,
            Arc::clone(&correlator),
            Arc::clone(&state),
        ));
        let sessions = Arc::new(SessionLayer::new(
            Arc::clone(&correlator),
            self.config.session_grace,
            self.config.rotation_timeout,
        ));

        spawn_push_handlers(&registry, &subjects, &credentials, &sessions)?;

        Supervisor::new(
            self.config.clone(),
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&correlator),
            Arc::clone(&credentials),
            outbound.clone(),
            frames,
            control_rx,
        )
        .spawn();

        Ok(VaultClient {
            inner: Arc::new(Inner {
                config: self.config,
                subjects,
                state,
                registry,
                correlator,
                credentials,
                sessions,
                outbound,
                control,
            }),
        })
    }
}

struct Inner {
    config: ClientConfig,
    subjects: VaultSubjects,
    state: Arc<StateCell>,
    registry: Arc<Registry>,
    correlator: Arc<Correlator>,
    credentials: Arc<CredentialManager>,
    sessions: Arc<SessionLayer>,
    outbound: Outbound,
    control: mpsc::UnboundedSender<Control>,
}

/// Client for a vault. Cheap to clone; the connection closes when the last clone
/// is dropped or [`VaultClient::close`] is called.
#[derive(Clone)]
pub struct VaultClient {
    inner: Arc<Inner>,
}

impl VaultClient {
    pub fn builder(config: ClientConfig) -> VaultClientBuilder {
        VaultClientBuilder {
            config,
            credential: None,
            source: None,
        }
    }

    /// Build, start connecting and wait for the first `Ready`.
    pub async fn connect(
        config: ClientConfig,
        credential: Option<Credential>,
    ) -> Result<Self, ClientError> {
        let wait = config.handshake_timeout;
        let mut builder = Self::builder(config);
        if let Some(credential) = credential {
            builder = builder.credential(credential);
        }
        let client = builder.build()?;
        client.start()?;
        client.wait_ready(wait).await?;
        Ok(client)
    }

    fn command(&self, command: Control) -> Result<(), ClientError> {
        self.inner
            .control
            .send(command)
            .map_err(|_| ClientError::Closed)
    }

    /// Begin connecting in the background.
    pub fn start(&self) -> Result<(), ClientError> {
        self.command(Control::Connect)
    }

    /// Drop the current connection and connect again.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.command(Control::Reconnect)
    }

    /// Stop retrying and stay disconnected until [`VaultClient::start`].
    pub fn cancel_reconnect(&self) -> Result<(), ClientError> {
        self.command(Control::CancelReconnect)
    }

    /// Close the connection, drop all subscriptions and fail pending requests.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.control.send(Control::Close(ack)).is_ok() {
            let _ = done.await;
        }
        self.inner.sessions.clear();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The most recent connection or credential failure.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.last_error()
    }

    /// Wait until the connection is `Ready`. Fails if the client parks in
    /// `Disconnected` after trying, closes, or `timeout` passes.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut changes = self.inner.state.subscribe();
        let wait = async {
            let mut tried = false;
            loop {
                let state = *changes.borrow_and_update();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Closed => return Err(ClientError::Closed),
                    ConnectionState::Disconnected if tried => {
                        let reason = self
                            .last_error()
                            .unwrap_or_else(|| "disconnected".to_string());
                        return Err(ClientError::Transport(TransportError::Connect(reason)));
                    }
                    ConnectionState::Disconnected => {}
                    _ => tried = true,
                }
                if changes.changed().await.is_err() {
                    return Err(ClientError::Closed);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(TransportError::Connect(
                self.last_error()
                    .unwrap_or_else(|| "timed out waiting for connection".to_string()),
            ))),
        }
    }

    pub fn subjects(&self) -> &VaultSubjects {
        &self.inner.subjects
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<(), RequestError> {
        match self.state() {
            ConnectionState::Closed => Err(RequestError::Closed),
            ConnectionState::Disconnected => Err(RequestError::NotConnected),
            _ => Ok(()),
        }
    }

    /// Publish raw bytes. Wildcard subjects are rejected.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<(), RequestError> {
        self.ensure_open()?;
        let subject = Subject::publishable(subject)?;
        self.inner.outbound.publish(subject, None, payload.into())
    }

    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        subject: &str,
        value: &T,
    ) -> Result<(), RequestError> {
        let body = serde_json::to_vec(value).map_err(|e| RequestError::Encode(e.to_string()))?;
        self.publish(subject, body)
    }

    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, RequestError> {
        if self.state() == ConnectionState::Closed {
            return Err(RequestError::Closed);
        }
        Ok(self.inner.registry.subscribe(Subject::parse(pattern)?))
    }

    /// Deliver matches for `pattern` into a caller-owned channel. Registering the
    /// same channel twice for a pattern is a no-op.
    pub fn subscribe_with(
        &self,
        pattern: &str,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<SubscriptionId, RequestError> {
        if self.state() == ConnectionState::Closed {
            return Err(RequestError::Closed);
        }
        Ok(self
            .inner
            .registry
            .subscribe_with(Subject::parse(pattern)?, sink))
    }

    /// Subscribe to `{scope}.forApp.{kind}` pushes.
    pub fn notifications(&self, kind: &str) -> Result<Subscription, RequestError> {
        let subject = self.inner.subjects.notification(kind)?;
        self.subscribe(subject.as_str())
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(id)
    }

    /// Request and wait up to `timeout` for the reply.
    pub async fn request(
        &self,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Reply, RequestError> {
        self.inner.correlator.request(operation, payload, timeout).await
    }

    /// Publish a request and return its pending reply, which can be cancelled.
    pub fn start_request(
        &self,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, RequestError> {
        self.inner.correlator.start(operation, payload, timeout)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending()
    }

    /// Register this device with the vault. Installs the issued credential and,
    /// when the vault returns `session_info`, establishes an encrypted session.
    pub async fn bootstrap(
        &self,
        mut request: BootstrapRequest,
        timeout: Duration,
    ) -> Result<BootstrapResponse, ClientError> {
        let keypair = EphemeralKeypair::generate();
        request.session_public_key = Some(keypair.public_key_base64());
        let payload =
            serde_json::to_value(&request).map_err(|e| RequestError::Encode(e.to_string()))?;

        let response: BootstrapResponse = self
            .request(ops::BOOTSTRAP, payload, timeout)
            .await?
            .into_result()?;

        let credential = Credential::from_bundle(
            &response.credentials,
            response.expires_at,
            response.credential_id.clone(),
        )
        .map_err(CredentialError::from)?;
        self.inner
            .credentials
            .install(credential, CredentialOrigin::Peer);

        match &response.session_info {
            Some(info) => {
                self.inner
                    .sessions
                    .establish(&keypair, info)
                    .map_err(RequestError::from)?;
            }
            None => debug!("bootstrap response carried no session"),
        }
        info!(
            "bootstrapped device {} with credential {}",
            request.device_id, response.credential_id
        );
        Ok(response)
    }

    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.inner.credentials.current()
    }

    /// Replace the credential. It is presented at the next handshake.
    pub fn set_credential(&self, credential: Credential) {
        self.inner
            .credentials
            .install(credential, CredentialOrigin::Configured);
    }

    pub async fn ensure_fresh(&self) -> Result<Arc<Credential>, CredentialError> {
        self.inner.credentials.ensure_fresh().await
    }

    pub fn credential_events(&self) -> broadcast::Receiver<CredentialEvent> {
        self.inner.credentials.subscribe()
    }

    /// Replace the encrypted session. The previous one keeps decrypting for the
    /// configured grace period.
    pub async fn rotate_session(&self) -> Result<String, RequestError> {
        self.inner.sessions.rotate().await
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.sessions.active_session_id()
    }

    pub fn session_state(&self) -> RotationState {
        self.inner.sessions.state()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, RequestError> {
        Ok(self.inner.sessions.encrypt(plaintext)?)
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, RequestError> {
        Ok(self.inner.sessions.decrypt(envelope)?)
    }

    /// Request with the payload and result encrypted under the active session.
    pub async fn secure_request<T, R>(
        &self,
        operation: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, RequestError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.inner
            .sessions
            .secure_request(operation, payload, timeout)
            .await
    }
}

/// Subscribe to the vault's credential and session rotation pushes.
fn spawn_push_handlers(
    registry: &Registry,
    subjects: &VaultSubjects,
    credentials: &Arc<CredentialManager>,
    sessions: &Arc<SessionLayer>,
) -> Result<(), ClientError> {
    let mut rotations =
        registry.subscribe(subjects.notification(notifications::CREDENTIALS_ROTATE)?);
    let credentials = Arc::clone(credentials);
    tokio::spawn(async move {
        while let Some(delivery) = rotations.recv().await {
            let rotation = delivery
                .json::<Notification>()
                .and_then(|n| serde_json::from_value::<CredentialRotation>(n.payload));
            match rotation {
                Ok(rotation) => {
                    let reason = rotation.reason;
                    match credentials.handle_push(rotation) {
                        Ok(true) => info!("credential rotated by vault ({:?})", reason),
                        Ok(false) => {}
                        Err(e) => warn!("rejecting pushed credential: {}", e),
                    }
                }
                Err(e) => warn!("malformed credential push on {}: {}", delivery.subject, e),
            }
        }
    });

    let mut session_pushes =
        registry.subscribe(subjects.notification(notifications::SESSION_ROTATE)?);
    let sessions = Arc::clone(sessions);
    tokio::spawn(async move {
        while session_pushes.recv().await.is_some() {
            if !sessions.has_session() {
                debug!("session rotation push without a session");
                continue;
            }
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                match sessions.rotate().await {
                    Ok(id) => info!("session rotated to {} on vault request", id),
                    Err(e) => warn!("vault-requested session rotation failed: {}", e),
                }
            });
        }
    });
    Ok(())
}
