use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};
use vaultlink_common::{env_bool, env_duration_ms, env_list};
use vaultlink_core::DEFAULT_MAX_CONTROL_LINE;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URLs, tried in order (`wss://` or `ws://`).
    pub servers: Vec<String>,
    /// Subject prefix owned by this client.
    pub scope: String,
    pub name: Option<String>,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub max_pings_outstanding: u32,
    pub backoff: BackoffPolicy,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub credential_refresh_margin: Duration,
    pub rotation_timeout: Duration,
    pub session_grace: Duration,
    pub verbose: bool,
    pub pedantic: bool,
    pub max_control_line: usize,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            servers: vec![server.into()],
            scope: scope.into(),
            name: None,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            max_pings_outstanding: 2,
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: None,
            credential_refresh_margin: Duration::from_secs(5 * 60),
            rotation_timeout: Duration::from_secs(10),
            session_grace: Duration::from_secs(60),
            verbose: false,
            pedantic: false,
            max_control_line: DEFAULT_MAX_CONTROL_LINE,
        }
    }

    /// Read configuration from `VAULTLINK_*` environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        let servers = env_list("VAULTLINK_SERVERS");
        let Some(first) = servers.first() else {
            return Err(ClientError::Config("VAULTLINK_SERVERS is not set".into()));
        };
        let scope = std::env::var("VAULTLINK_SCOPE")
            .map_err(|_| ClientError::Config("VAULTLINK_SCOPE is not set".into()))?;

        let mut config = Self::new(first.clone(), scope);
        config.servers = servers;
        config.name = std::env::var("VAULTLINK_NAME").ok();
        config.handshake_timeout =
            env_duration_ms("VAULTLINK_HANDSHAKE_TIMEOUT_MS", config.handshake_timeout)?;
        config.ping_interval = env_duration_ms("VAULTLINK_PING_INTERVAL_MS", config.ping_interval)?;
        config.credential_refresh_margin = env_duration_ms(
            "VAULTLINK_REFRESH_MARGIN_MS",
            config.credential_refresh_margin,
        )?;
        config.session_grace = env_duration_ms("VAULTLINK_SESSION_GRACE_MS", config.session_grace)?;
        config.backoff.initial =
            env_duration_ms("VAULTLINK_BACKOFF_INITIAL_MS", config.backoff.initial)?;
        config.backoff.max = env_duration_ms("VAULTLINK_BACKOFF_MAX_MS", config.backoff.max)?;
        config.verbose = env_bool("VAULTLINK_VERBOSE", false);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.servers.is_empty() {
            return Err(ClientError::Config("at least one server is required".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(ClientError::Config("ping_interval must be non-zero".into()));
        }
        if self.backoff.multiplier < 1.0 || !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ClientError::Config(
                "backoff multiplier must be >= 1 and jitter within 0..=1".into(),
            ));
        }
        Ok(())
    }
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingGreeting,
    Authenticating,
    Ready,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, AwaitingGreeting) => true,
            (AwaitingGreeting, Authenticating) => true,
            (Authenticating, Ready) => true,
            (Reconnecting, Connecting) => true,
            (Connecting | AwaitingGreeting | Authenticating | Ready, Reconnecting) => true,
            (Connecting | AwaitingGreeting | Authenticating | Ready | Reconnecting, Disconnected) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingGreeting => "awaiting-greeting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The client's single connection state, observable through a watch channel.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            last_error: Mutex::new(None),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply `next` if it is a legal transition. Illegal transitions are refused.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = None;
        let applied = self.tx.send_if_modified(|current| {
            previous = Some(*current);
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        match previous {
            Some(from) if applied => debug!("connection state {} -> {}", from, next),
            Some(from) if from != next => {
                warn!("refusing illegal state transition {} -> {}", from, next)
            }
            _ => {}
        }
        applied
    }

    pub fn record_error(&self, error: impl fmt::Display) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
