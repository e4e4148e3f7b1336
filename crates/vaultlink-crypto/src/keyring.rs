//! Active and previous sessions across a rotation.
//!
//! Installing a new session makes it the only one used for sealing. The session it
//! replaced keeps opening envelopes until the grace period ends, so messages sealed
//! by the vault just before the switch still decrypt.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::session::{EncryptedEnvelope, Session, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    /// No session has been installed.
    None,
    Active,
    /// A replaced session still opens envelopes until `until`.
    RotatingGrace { until: DateTime<Utc> },
    /// The active session is past its expiry.
    Expired,
}

#[derive(Debug)]
struct Retiring {
    session: Arc<Session>,
    until: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SessionKeyring {
    active: Option<Arc<Session>>,
    previous: Option<Retiring>,
    grace: Duration,
}

impl SessionKeyring {
    pub fn new(grace: std::time::Duration) -> Self {
        Self {
            active: None,
            previous: None,
            grace: Duration::from_std(grace).unwrap_or(Duration::zero()),
        }
    }

    pub fn install(&mut self, session: Session) {
        self.install_at(session, Utc::now());
    }

    /// Make `session` active. The replaced session enters its grace period.
    pub fn install_at(&mut self, session: Session, now: DateTime<Utc>) {
        let session = Arc::new(session);
        if let Some(old) = self.active.replace(session.clone()) {
            if old.id() != session.id() {
                debug!(
                    "session {} replaced by {}, grace until {}",
                    old.id(),
                    session.id(),
                    now + self.grace
                );
                self.previous = Some(Retiring {
                    session: old,
                    until: now + self.grace,
                });
            }
        }
    }

    pub fn active(&self) -> Option<Arc<Session>> {
        self.active.clone()
    }

    pub fn state(&self) -> RotationState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> RotationState {
        let Some(active) = &self.active else {
            return RotationState::None;
        };
        if active.is_expired_at(now) {
            return RotationState::Expired;
        }
        match &self.previous {
            Some(retiring) if retiring.until > now => RotationState::RotatingGrace {
                until: retiring.until,
            },
            _ => RotationState::Active,
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, SessionError> {
        self.seal_at(plaintext, Utc::now())
    }

    pub fn seal_at(
        &self,
        plaintext: &[u8],
        now: DateTime<Utc>,
    ) -> Result<EncryptedEnvelope, SessionError> {
        self.active
            .as_ref()
            .ok_or(SessionError::NoSession)?
            .seal_at(plaintext, now)
    }

    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, SessionError> {
        self.open_at(envelope, Utc::now())
    }

    /// Open with whichever session the envelope names, if it is still usable.
    pub fn open_at(
        &self,
        envelope: &EncryptedEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, SessionError> {
        let Some(active) = &self.active else {
            return Err(SessionError::NoSession);
        };
        if active.id() == envelope.session_id {
            return active.open_at(envelope, now);
        }
        match &self.previous {
            Some(retiring)
                if retiring.session.id() == envelope.session_id && retiring.until > now =>
            {
                retiring.session.open_at(envelope, now)
            }
            _ => Err(SessionError::UnknownSession(envelope.session_id.clone())),
        }
    }

    /// Drop the previous session once its grace period is over.
    pub fn prune_at(&mut self, now: DateTime<Utc>) {
        if self.previous.as_ref().is_some_and(|r| r.until <= now) {
            if let Some(retired) = self.previous.take() {
                debug!("session {} retired", retired.session.id());
            }
        }
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.previous = None;
    }
}
