//! End-to-end encrypted sessions with the vault, layered over request-reply.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use vaultlink_core::protocol::{ops, SessionInfo, SessionRotateRequest};
use vaultlink_crypto::{
    EncryptedEnvelope, EphemeralKeypair, RotationState, Session, SessionError, SessionKeyring,
};

use crate::correlator::Correlator;
use crate::error::RequestError;

pub struct SessionLayer {
    keyring: RwLock<SessionKeyring>,
    correlator: Arc<Correlator>,
    rotation_timeout: Duration,
    rotating: Mutex<()>,
}

impl SessionLayer {
    pub fn new(correlator: Arc<Correlator>, grace: Duration, rotation_timeout: Duration) -> Self {
        Self {
            keyring: RwLock::new(SessionKeyring::new(grace)),
            correlator,
            rotation_timeout,
            rotating: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionKeyring> {
        self.keyring.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionKeyring> {
        self.keyring.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete the key exchange from the vault's half and make the session active.
    pub fn establish(
        &self,
        keypair: &EphemeralKeypair,
        info: &SessionInfo,
    ) -> Result<String, SessionError> {
        let session = Session::establish(keypair, info)?;
        info!(
            "session {} established (local key {}), expires {}",
            session.id(),
            hex::encode(&keypair.public_key()[..8]),
            session.expires_at()
        );
        let id = session.id().to_string();
        let mut keyring = self.write();
        keyring.prune_at(Utc::now());
        keyring.install(session);
        Ok(id)
    }

    /// Ask the vault for a new session. The previous one keeps decrypting for the
    /// grace period.
    pub async fn rotate(&self) -> Result<String, RequestError> {
        let _guard = self.rotating.lock().await;
        let keypair = EphemeralKeypair::generate();
        let request = SessionRotateRequest {
            session_public_key: keypair.public_key_base64(),
            previous_session_id: self.active_session_id(),
        };
        let payload =
            serde_json::to_value(&request).map_err(|e| RequestError::Encode(e.to_string()))?;
        let info: SessionInfo = self
            .correlator
            .request(ops::SESSION_ROTATE, payload, self.rotation_timeout)
            .await?
            .into_result()?;
        debug!("vault accepted session rotation to {}", info.session_id);
        Ok(self.establish(&keypair, &info)?)
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.read().active().map(|s| s.id().to_string())
    }

    pub fn has_session(&self) -> bool {
        self.read().active().is_some()
    }

    pub fn state(&self) -> RotationState {
        self.read().state()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, SessionError> {
        self.read().seal(plaintext)
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, SessionError> {
        self.read().open(envelope)
    }

    /// Send `payload` encrypted under the active session and decrypt the result.
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
        let plaintext =
            serde_json::to_vec(payload).map_err(|e| RequestError::Encode(e.to_string()))?;
        let sealed = self.encrypt(&plaintext)?;
        let body =
            serde_json::to_value(&sealed).map_err(|e| RequestError::Encode(e.to_string()))?;

        let reply = self.correlator.request(operation, body, timeout).await?;
        let envelope: EncryptedEnvelope = serde_json::from_value(reply.result)
            .map_err(|e| RequestError::Decode(format!("expected encrypted result: {e}")))?;
        let opened = self.decrypt(&envelope)?;
        serde_json::from_slice(&opened).map_err(|e| RequestError::Decode(e.to_string()))
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}
