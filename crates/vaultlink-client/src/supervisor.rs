//! Connection supervisor.
//!
//! A single task owns the connection: it connects, writes every outbound frame,
//! keeps the link alive and reconnects with backoff. One reader task per connection
//! parses inbound frames, dispatches messages to the registry and reports control
//! events back here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;
use vaultlink_core::{
    classify_server_error, ClientFrame, ServerErrorKind, ServerFrame, ServerGreeting,
};

use crate::correlator::Correlator;
use crate::credentials::CredentialManager;
use crate::error::{RequestError, TransportError};
use crate::outbound::Outbound;
use crate::registry::Registry;
use crate::transport::{self, FrameReader, FrameWriter};
use crate::types::{BackoffPolicy, ClientConfig, ConnectionState, StateCell};

/// Consecutive authorization rejections tolerated before the client parks.
const MAX_AUTH_FAILURES: u32 = 2;

/// Commands from the client facade.
#[derive(Debug)]
pub enum Control {
    Connect,
    Reconnect,
    /// Stop the backoff timer and stay disconnected.
    CancelReconnect,
    Close(oneshot::Sender<()>),
}

#[derive(Debug)]
enum Step {
    Idle,
    Connect,
    Backoff,
    Close(Option<oneshot::Sender<()>>),
}

#[derive(Debug)]
enum ReaderEvent {
    Ping,
    Pong,
    Discovered(ServerGreeting),
    Failed(TransportError),
}

/// Round-robin over configured servers plus servers announced in `connect_urls`.
#[derive(Debug, Clone)]
pub struct ServerPool {
    servers: Vec<String>,
    next: usize,
}

impl ServerPool {
    pub fn new(servers: &[String]) -> Self {
        Self {
            servers: servers.to_vec(),
            next: 0,
        }
    }

    /// Next address to try. `None` only for an empty pool.
    pub fn next_server(&mut self) -> Option<String> {
        if self.servers.is_empty() {
            return None;
        }
        let server = self.servers[self.next % self.servers.len()].clone();
        self.next = (self.next + 1) % self.servers.len();
        Some(server)
    }

    /// Merge announced servers. Bare `host:port` entries take the scheme of the
    /// first configured server.
    pub fn discover(&mut self, urls: &[String]) {
        let scheme = self
            .servers
            .first()
            .and_then(|s| Url::parse(s).ok())
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|| "wss".to_string());

        for raw in urls {
            let candidate = if raw.contains("://") {
                raw.clone()
            } else {
                format!("{scheme}://{raw}")
            };
            match Url::parse(&candidate) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => {
                    let normalized = url.to_string();
                    let known = self.servers.iter().any(|s| {
                        Url::parse(s).map(|u| u.to_string()).as_deref() == Ok(normalized.as_str())
                    });
                    if !known {
                        debug!("discovered server {}", normalized);
                        self.servers.push(normalized);
                    }
                }
                _ => debug!("ignoring announced server {}", raw),
            }
        }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }
}

/// Backoff delay for the given 1-based attempt, with jitter applied.
pub fn backoff_delay(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let base = policy.delay_for_attempt(attempt.saturating_sub(1));
    if policy.jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-policy.jitter..=policy.jitter);
    base.mul_f64(factor.max(0.0)).min(policy.max)
}

pub(crate) struct Supervisor {
    config: ClientConfig,
    state: Arc<StateCell>,
    registry: Arc<Registry>,
    correlator: Arc<Correlator>,
    credentials: Arc<CredentialManager>,
    outbound: Outbound,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
    control: mpsc::UnboundedReceiver<Control>,
    pool: ServerPool,
    /// Frames not yet written. The front is retried first after a reconnect.
    backlog: VecDeque<ClientFrame>,
    attempt: u32,
    auth_failures: u32,
    refresh_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ClientConfig,
        state: Arc<StateCell>,
        registry: Arc<Registry>,
        correlator: Arc<Correlator>,
        credentials: Arc<CredentialManager>,
        outbound: Outbound,
        frames: mpsc::UnboundedReceiver<ClientFrame>,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let pool = ServerPool::new(&config.servers);
        Self {
            config,
            state,
            registry,
            correlator,
            credentials,
            outbound,
            frames,
            control,
            pool,
            backlog: VecDeque::new(),
            attempt: 0,
            auth_failures: 0,
            refresh_task: None,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Connect => self.attempt().await,
                Step::Backoff => self.wait_backoff().await,
                Step::Close(ack) => {
                    self.shutdown(ack);
                    return;
                }
            };
        }
    }

    /// Disconnected: wait for a command.
    async fn idle(&mut self) -> Step {
        loop {
            match self.control.recv().await {
                Some(Control::Connect) | Some(Control::Reconnect) => {
                    self.attempt = 0;
                    self.auth_failures = 0;
                    return Step::Connect;
                }
                Some(Control::CancelReconnect) => {}
                Some(Control::Close(ack)) => return Step::Close(Some(ack)),
                None => return Step::Close(None),
            }
        }
    }

    async fn attempt(&mut self) -> Step {
        self.state.transition(ConnectionState::Connecting);

        let credential = match self.credentials.prepare_handshake().await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("no usable credential: {}", e);
                return self
                    .on_failure(TransportError::Connect(format!("credential unavailable: {e}")))
                    .await;
            }
        };
        let Some(address) = self.pool.next_server() else {
            error!("no servers configured");
            self.state.transition(ConnectionState::Disconnected);
            return Step::Idle;
        };

        let result = {
            let connect = transport::connect(
                &self.config,
                &address,
                credential.as_deref(),
                &self.state,
            );
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => break result,
                    command = self.control.recv() => match command {
                        Some(Control::Close(ack)) => return Step::Close(Some(ack)),
                        None => return Step::Close(None),
                        Some(Control::CancelReconnect) => {
                            info!("connect to {} cancelled", address);
                            self.state.transition(ConnectionState::Disconnected);
                            return Step::Idle;
                        }
                        Some(Control::Connect) | Some(Control::Reconnect) => {}
                    },
                }
            }
        };

        match result {
            Ok(connection) => {
                self.attempt = 0;
                self.auth_failures = 0;
                self.serve(connection).await
            }
            Err(e) => {
                warn!("connection to {} failed: {}", address, e);
                self.on_failure(e).await
            }
        }
    }

    /// Decide what follows a failed attempt or a lost connection.
    async fn on_failure(&mut self, error: TransportError) -> Step {
        self.registry.set_offline();
        self.state.record_error(&error);

        if error.is_authorization() {
            self.auth_failures += 1;
            if self.auth_failures >= MAX_AUTH_FAILURES {
                error!(
                    "credential rejected {} times in a row, staying disconnected",
                    self.auth_failures
                );
                self.state.transition(ConnectionState::Disconnected);
                return Step::Idle;
            }
            return match self.credentials.on_authorization_failure().await {
                Ok(credential) => {
                    info!(
                        "retrying with rotated credential {}",
                        credential.credential_id()
                    );
                    self.state.transition(ConnectionState::Reconnecting);
                    Step::Connect
                }
                Err(e) => {
                    error!("cannot replace rejected credential: {}", e);
                    self.state.record_error(&e);
                    self.state.transition(ConnectionState::Disconnected);
                    Step::Idle
                }
            };
        }

        if !error.is_retryable() {
            self.state.transition(ConnectionState::Disconnected);
            return Step::Idle;
        }

        self.attempt += 1;
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.attempt > max {
                warn!("giving up after {} reconnect attempts", max);
                self.state.transition(ConnectionState::Disconnected);
                return Step::Idle;
            }
        }
        self.state.transition(ConnectionState::Reconnecting);
        Step::Backoff
    }

    async fn wait_backoff(&mut self) -> Step {
        let delay = backoff_delay(&self.config.backoff, self.attempt);
        info!("reconnecting in {:?} (attempt {})", delay, self.attempt);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Step::Connect,
                command = self.control.recv() => match command {
                    Some(Control::Close(ack)) => return Step::Close(Some(ack)),
                    None => return Step::Close(None),
                    Some(Control::CancelReconnect) => {
                        info!("reconnect cancelled");
                        self.state.transition(ConnectionState::Disconnected);
                        return Step::Idle;
                    }
                    Some(Control::Connect) | Some(Control::Reconnect) => return Step::Connect,
                },
            }
        }
    }

    /// Write queued frames in order. Frames that cannot be encoded are dropped;
    /// a socket failure leaves the failed frame at the front of the backlog.
    async fn flush_backlog(&mut self, writer: &mut FrameWriter) -> Result<(), TransportError> {
        while let Some(frame) = self.backlog.front() {
            match writer.send_frame(frame).await {
                Ok(()) => {}
                Err(TransportError::Frame(e)) => warn!("dropping {} frame: {}", frame.op(), e),
                Err(e) => return Err(e),
            }
            self.backlog.pop_front();
        }
        Ok(())
    }

    async fn serve(&mut self, connection: transport::ConnectionHandle) -> Step {
        self.outbound.set_max_payload(connection.max_payload());
        let (mut writer, reader, greeting) = connection.into_split();
        self.pool.discover(&greeting.connect_urls);

        // SUB/UNSUB queued while offline are superseded by the replay.
        while let Ok(frame) = self.frames.try_recv() {
            self.backlog.push_back(frame);
        }
        self.backlog
            .retain(|f| !matches!(f, ClientFrame::Sub { .. } | ClientFrame::Unsub { .. }));

        for frame in self.registry.replay() {
            if let Err(e) = writer.send_frame(&frame).await {
                return self.on_failure(e).await;
            }
        }
        if let Err(e) = self.flush_backlog(&mut writer).await {
            return self.on_failure(e).await;
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&self.registry), events_tx));
        self.state.transition(ConnectionState::Ready);

        let period = self.config.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outstanding: u32 = 0;

        let failure = loop {
            tokio::select! {
                command = self.control.recv() => match command {
                    Some(Control::Close(ack)) => {
                        reader_task.abort();
                        writer.close().await;
                        return Step::Close(Some(ack));
                    }
                    None => {
                        reader_task.abort();
                        writer.close().await;
                        return Step::Close(None);
                    }
                    Some(Control::Reconnect) => {
                        info!("reconnect requested");
                        reader_task.abort();
                        writer.close().await;
                        self.registry.set_offline();
                        self.state.transition(ConnectionState::Reconnecting);
                        return Step::Connect;
                    }
                    Some(Control::Connect) | Some(Control::CancelReconnect) => {}
                },
                frame = self.frames.recv() => match frame {
                    Some(frame) => {
                        self.backlog.push_back(frame);
                        if let Err(e) = self.flush_backlog(&mut writer).await {
                            break e;
                        }
                    }
                    None => break TransportError::Closed,
                },
                event = events.recv() => match event {
                    Some(ReaderEvent::Ping) => {
                        if let Err(e) = writer.send_frame(&ClientFrame::Pong).await {
                            break e;
                        }
                    }
                    Some(ReaderEvent::Pong) => outstanding = 0,
                    Some(ReaderEvent::Discovered(greeting)) => {
                        self.pool.discover(&greeting.connect_urls);
                    }
                    Some(ReaderEvent::Failed(e)) => break e,
                    None => break TransportError::Stream("reader stopped".into()),
                },
                _ = ticker.tick() => {
                    if outstanding >= self.config.max_pings_outstanding {
                        break TransportError::StaleConnection(outstanding);
                    }
                    if let Err(e) = writer.send_frame(&ClientFrame::Ping).await {
                        break e;
                    }
                    outstanding += 1;
                    self.refresh_in_background();
                }
            }
        };

        reader_task.abort();
        warn!("connection lost: {}", failure);
        self.on_failure(failure).await
    }

    fn refresh_in_background(&mut self) {
        if !self.credentials.has_source() && self.credentials.current().is_none() {
            return;
        }
        if !self.credentials.needs_refresh() {
            return;
        }
        if self.refresh_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let credentials = Arc::clone(&self.credentials);
        self.refresh_task = Some(tokio::spawn(async move {
            if let Err(e) = credentials.ensure_fresh().await {
                warn!("background credential refresh failed: {}", e);
            }
        }));
    }

    fn shutdown(&mut self, ack: Option<oneshot::Sender<()>>) {
        self.state.transition(ConnectionState::Closed);
        self.registry.clear();
        self.correlator.fail_all(|| RequestError::Closed);
        self.backlog.clear();
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        info!("client closed");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

async fn read_loop(
    mut reader: FrameReader,
    registry: Arc<Registry>,
    events: mpsc::UnboundedSender<ReaderEvent>,
) {
    loop {
        let event = match reader.receive_frame().await {
            Ok(ServerFrame::Msg(msg)) => {
                registry.dispatch(msg);
                continue;
            }
            Ok(ServerFrame::Ok) => continue,
            Ok(ServerFrame::Ping) => ReaderEvent::Ping,
            Ok(ServerFrame::Pong) => ReaderEvent::Pong,
            Ok(ServerFrame::Info(greeting)) => ReaderEvent::Discovered(greeting),
            Ok(ServerFrame::Err(message)) => match classify_server_error(&message) {
                ServerErrorKind::Permission => {
                    warn!("server refused operation: {}", message);
                    continue;
                }
                ServerErrorKind::Authorization => {
                    ReaderEvent::Failed(TransportError::Authorization(message))
                }
                ServerErrorKind::Fatal => ReaderEvent::Failed(TransportError::Protocol(message)),
            },
            Err(e) => ReaderEvent::Failed(e),
        };
        let failed = matches!(event, ReaderEvent::Failed(_));
        if events.send(event).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_round_robin_and_discovery() {
        let mut pool = ServerPool::new(&["ws://10.0.0.1:4222".to_string()]);
        pool.discover(&[
            "10.0.0.2:4222".to_string(),
            "ws://10.0.0.1:4222".to_string(),
            "nats://10.0.0.3:4222".to_string(),
        ]);
        assert_eq!(
            pool.servers(),
            &["ws://10.0.0.1:4222".to_string(), "ws://10.0.0.2:4222/".to_string()]
        );

        assert_eq!(pool.next_server().as_deref(), Some("ws://10.0.0.1:4222"));
        assert_eq!(pool.next_server().as_deref(), Some("ws://10.0.0.2:4222/"));
        assert_eq!(pool.next_server().as_deref(), Some("ws://10.0.0.1:4222"));
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = ServerPool::new(&[]);
        assert!(pool.next_server().is_none());
    }

    #[test]
    fn test_backoff_delay_stays_within_jitter() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = backoff_delay(&policy, 3);
            assert!(delay >= Duration::from_millis(200), "{delay:?}");
            assert!(delay <= Duration::from_millis(600), "{delay:?}");
        }

        let exact = BackoffPolicy {
            jitter: 0.0,
            ..policy
        };
        assert_eq!(backoff_delay(&exact, 1), Duration::from_millis(100));
    }
}
