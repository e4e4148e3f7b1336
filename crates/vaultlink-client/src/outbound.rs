//! Handle for queueing frames to the connection writer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use vaultlink_core::{ClientFrame, FrameError, Subject, DEFAULT_MAX_PAYLOAD};

use crate::error::RequestError;

/// Cloneable sender into the supervisor's write queue.
///
/// Frames queued while the connection is down stay queued and are flushed after the
/// next successful handshake.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<ClientFrame>,
    max_payload: Arc<AtomicUsize>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                max_payload: Arc::new(AtomicUsize::new(DEFAULT_MAX_PAYLOAD)),
            },
            rx,
        )
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_payload(&self, max_payload: usize) {
        self.max_payload.store(max_payload, Ordering::Relaxed);
    }

    /// Queue a frame. Fails only once the writer has shut down.
    pub fn send(&self, frame: ClientFrame) -> Result<(), RequestError> {
        self.tx.send(frame).map_err(|_| RequestError::Closed)
    }

    /// Validate and queue a `PUB`.
    pub fn publish(
        &self,
        subject: Subject,
        reply_to: Option<Subject>,
        payload: Bytes,
    ) -> Result<(), RequestError> {
        subject.ensure_publishable()?;
        if let Some(reply) = &reply_to {
            reply.ensure_publishable()?;
        }
        let limit = self.max_payload();
        if payload.len() > limit {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                limit,
            }
            .into());
        }
        self.send(ClientFrame::Pub {
            subject,
            reply_to,
            payload,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
