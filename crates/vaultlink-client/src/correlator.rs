//! Request-reply correlation over the subscription registry.
//!
//! Every request gets its own reply subject, `{scope}.forApp.{operation}.{id}`,
//! subscribed before the request is published. A reply resolves the request only if
//! its `event_id` matches the request id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;
use vaultlink_core::{RequestEnvelope, ResponseEnvelope, VaultSubjects};

use crate::error::RequestError;
use crate::outbound::Outbound;
use crate::registry::{Registry, Subscription};
use crate::types::{ConnectionState, StateCell};

/// A successful reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub result: Value,
}

impl Reply {
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, RequestError> {
        serde_json::from_value(self.result).map_err(|e| RequestError::Decode(e.to_string()))
    }
}

type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<RequestError>>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<String, oneshot::Sender<RequestError>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Correlator {
    subjects: VaultSubjects,
    registry: Arc<Registry>,
    outbound: Outbound,
    state: Arc<StateCell>,
    pending: PendingTable,
}

impl Correlator {
    pub fn new(
        subjects: VaultSubjects,
        registry: Arc<Registry>,
        outbound: Outbound,
        state: Arc<StateCell>,
    ) -> Self {
        Self {
            subjects,
            registry,
            outbound,
            state,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subjects(&self) -> &VaultSubjects {
        &self.subjects
    }

    /// Send a request and wait for its reply.
    pub async fn request(
        &self,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Reply, RequestError> {
        self.start(operation, payload, timeout)?.wait().await
    }

    /// Publish a request and return a handle for its reply.
    pub fn start(
        &self,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, RequestError> {
        match self.state.get() {
            ConnectionState::Closed => return Err(RequestError::Closed),
            ConnectionState::Disconnected => return Err(RequestError::NotConnected),
            _ => {}
        }

        let subject = self.subjects.for_vault(operation)?;
        let (id, abort) = self.register();
        let reply_subject = match self.subjects.reply(operation, &id) {
            Ok(subject) => subject,
            Err(e) => {
                lock(&self.pending).remove(&id);
                return Err(e.into());
            }
        };

        let envelope = RequestEnvelope::with_id(id.clone(), operation, payload)
            .reply_to(reply_subject.as_str());
        // The handle owns cleanup from here on, including on the error paths below.
        let pending = PendingReply {
            id,
            subscription: self.registry.subscribe(reply_subject),
            abort,
            timeout,
            registry: Arc::clone(&self.registry),
            table: Arc::clone(&self.pending),
        };

        let body = serde_json::to_vec(&envelope).map_err(|e| RequestError::Encode(e.to_string()))?;
        // The reply subject travels in the envelope, not in the PUB reply-to field.
        self.outbound.publish(subject, None, Bytes::from(body))?;
        debug!("request {} sent for {}", pending.id, operation);
        Ok(pending)
    }

    fn register(&self) -> (String, oneshot::Receiver<RequestError>) {
        let mut table = lock(&self.pending);
        let (tx, rx) = oneshot::channel();
        let mut id = Uuid::new_v4().to_string();
        while table.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        table.insert(id.clone(), tx);
        (id, rx)
    }

    /// Number of requests awaiting a reply.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Fail every pending request, e.g. with `Closed` on shutdown.
    pub fn fail_all(&self, error: impl Fn() -> RequestError) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (id, abort) in drained {
            debug!("failing pending request {}", id);
            let _ = abort.send(error());
        }
    }
}

/// Cancels one in-flight request from another task.
#[derive(Clone)]
pub struct CancelHandle {
    id: String,
    table: PendingTable,
}

impl CancelHandle {
    /// Returns false if the request already finished.
    pub fn cancel(&self) -> bool {
        match lock(&self.table).remove(&self.id) {
            Some(abort) => {
                let _ = abort.send(RequestError::Cancelled);
                true
            }
            None => false,
        }
    }
}

/// A published request awaiting its reply. Dropping it removes the reply
/// subscription.
pub struct PendingReply {
    id: String,
    subscription: Subscription,
    abort: oneshot::Receiver<RequestError>,
    timeout: Duration,
    registry: Arc<Registry>,
    table: PendingTable,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id.clone(),
            table: Arc::clone(&self.table),
        }
    }

    pub async fn wait(mut self) -> Result<Reply, RequestError> {
        if self.timeout.is_zero() {
            while let Some(delivery) = self.subscription.try_recv() {
                if let Some(outcome) = self.accept(&delivery.payload) {
                    return outcome;
                }
            }
            return Err(RequestError::Timeout);
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                delivery = self.subscription.recv() => match delivery {
                    Some(delivery) => {
                        if let Some(outcome) = self.accept(&delivery.payload) {
                            return outcome;
                        }
                    }
                    None => return Err(RequestError::Closed),
                },
                aborted = &mut self.abort => {
                    return Err(aborted.unwrap_or(RequestError::Closed));
                }
                _ = &mut deadline => {
                    debug!("request {} timed out", self.id);
                    return Err(RequestError::Timeout);
                }
            }
        }
    }

    /// `None` means the delivery was not a reply to this request.
    fn accept(&self, payload: &[u8]) -> Option<Result<Reply, RequestError>> {
        let response: ResponseEnvelope = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!("dropping malformed reply for request {}: {}", self.id, e);
                return None;
            }
        };
        if response.event_id != self.id {
            debug!(
                "dropping reply for {} on request {}",
                response.event_id, self.id
            );
            return None;
        }
        if !response.success {
            let reason = response.error.unwrap_or_else(|| "unspecified error".into());
            return Some(Err(RequestError::Rejected(reason)));
        }
        Some(Ok(Reply {
            event_id: response.event_id,
            timestamp: response.timestamp,
            result: response.result.unwrap_or(Value::Null),
        }))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.id);
        self.registry.unsubscribe(self.subscription.id());
    }
}
