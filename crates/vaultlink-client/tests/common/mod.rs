//! A scripted vault speaking the wire protocol over a local WebSocket.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use uuid::Uuid;
use vaultlink_client::{BackoffPolicy, ClientConfig};
use vaultlink_core::{
    ClientFrame, ClientFrameDecoder, ConnectOptions, MessageFrame, RequestEnvelope, ServerFrame,
    ServerGreeting, Subject,
};
use vaultlink_crypto::identity::decode_signature;
use vaultlink_crypto::{Credential, PublicId, SoftwareIdentity};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub type Accept = Arc<dyn Fn(&ConnectOptions, &str) -> bool + Send + Sync>;
pub type Respond = Arc<dyn Fn(&str, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum VaultEvent {
    Connect {
        options: ConnectOptions,
        nonce: String,
        accepted: bool,
    },
    Frame(ClientFrame),
    Disconnected,
}

enum Command {
    Publish { subject: Subject, payload: Bytes },
    Drop,
}

#[derive(Clone)]
pub struct Behavior {
    pub auth_required: bool,
    /// When false only the handshake PING of each connection gets a PONG.
    pub answer_pings: bool,
    pub accept: Accept,
    pub respond: Respond,
}

impl Behavior {
    /// Requires auth and accepts any correctly signed CONNECT.
    pub fn signed() -> Self {
        Self {
            auth_required: true,
            answer_pings: true,
            accept: Arc::new(signature_valid),
            respond: Arc::new(|_, _| None),
        }
    }

    pub fn open() -> Self {
        Self {
            auth_required: false,
            answer_pings: true,
            accept: Arc::new(|_, _| true),
            respond: Arc::new(|_, _| None),
        }
    }

    pub fn respond(
        mut self,
        respond: impl Fn(&str, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.respond = Arc::new(respond);
        self
    }

    pub fn accept(mut self, accept: impl Fn(&ConnectOptions, &str) -> bool + Send + Sync + 'static) -> Self {
        self.accept = Arc::new(accept);
        self
    }

    pub fn ignore_keepalive(mut self) -> Self {
        self.answer_pings = false;
        self
    }
}

/// Whether `options` carries a signature of `nonce` under its announced public id.
pub fn signature_valid(options: &ConnectOptions, nonce: &str) -> bool {
    let (Some(nkey), Some(sig)) = (&options.public_id, &options.signature) else {
        return false;
    };
    let (Ok(public_id), Some(sig)) = (PublicId::parse(nkey), decode_signature(sig)) else {
        return false;
    };
    options.token.is_some() && public_id.verify(nonce.as_bytes(), &sig)
}

pub struct MockVault {
    pub url: String,
    events: mpsc::UnboundedReceiver<VaultEvent>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
    accept_task: JoinHandle<()>,
}

impl MockVault {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (events_tx, events) = mpsc::unbounded_channel();
        let connections = Arc::new(Mutex::new(Vec::new()));

        let live = Arc::clone(&connections);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    behavior.clone(),
                    events_tx.clone(),
                    Arc::clone(&live),
                ));
            }
        });

        Self {
            url,
            events,
            connections,
            accept_task,
        }
    }

    pub async fn next_event(&mut self) -> VaultEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for vault event")
            .expect("vault stopped")
    }

    /// Skip events until one matches.
    pub async fn wait_for(&mut self, matches: impl Fn(&VaultEvent) -> bool) -> VaultEvent {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }

    pub async fn wait_for_sub(&mut self, subject: &str) -> u64 {
        match self
            .wait_for(|e| {
                matches!(e, VaultEvent::Frame(ClientFrame::Sub { subject: s, .. }) if s.as_str() == subject)
            })
            .await
        {
            VaultEvent::Frame(ClientFrame::Sub { sid, .. }) => sid,
            _ => unreachable!(),
        }
    }

    pub async fn wait_for_connect(&mut self) -> (ConnectOptions, String, bool) {
        match self
            .wait_for(|e| matches!(e, VaultEvent::Connect { .. }))
            .await
        {
            VaultEvent::Connect {
                options,
                nonce,
                accepted,
            } => (options, nonce, accepted),
            _ => unreachable!(),
        }
    }

    /// Publish to every authenticated connection.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) {
        let subject = Subject::parse(subject).unwrap();
        let payload = payload.into();
        self.connections.lock().unwrap().retain(|tx| {
            tx.send(Command::Publish {
                subject: subject.clone(),
                payload: payload.clone(),
            })
            .is_ok()
        });
    }

    /// Sever every live connection.
    pub fn drop_connections(&self) {
        for tx in self.connections.lock().unwrap().drain(..) {
            let _ = tx.send(Command::Drop);
        }
    }
}

impl Drop for MockVault {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn write(sink: &mut WsSink, frame: &ServerFrame) -> bool {
    let bytes = frame.encode().unwrap();
    sink.send(Message::Binary(bytes)).await.is_ok()
}

async fn deliver(sink: &mut WsSink, subs: &[(u64, Subject)], subject: &Subject, payload: &Bytes) {
    for (sid, pattern) in subs {
        if pattern.matches(subject.as_str()) {
            let frame = ServerFrame::Msg(MessageFrame {
                subject: subject.clone(),
                sid: *sid,
                reply_to: None,
                payload: payload.clone(),
            });
            write(sink, &frame).await;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    behavior: Behavior,
    events: mpsc::UnboundedSender<VaultEvent>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws_stream.split();
    let (commands_tx, mut commands) = mpsc::unbounded_channel();

    let nonce = Uuid::new_v4().simple().to_string();
    let greeting = ServerGreeting {
        server_id: "mock-vault".into(),
        version: "test".into(),
        max_payload: Some(64 * 1024),
        nonce: Some(nonce.clone()),
        auth_required: behavior.auth_required,
        ..Default::default()
    };
    if !write(&mut sink, &ServerFrame::Info(greeting)).await {
        return;
    }

    let mut decoder = ClientFrameDecoder::new();
    let mut subs: Vec<(u64, Subject)> = Vec::new();
    let mut pings = 0u32;

    'conn: loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => decoder.push(&data),
                    Some(Ok(Message::Text(text))) => decoder.push(text.as_str().as_bytes()),
                    Some(Ok(_)) => continue,
                    _ => break 'conn,
                }
                while let Ok(Some(frame)) = decoder.next_frame() {
                    match &frame {
                        ClientFrame::Connect(options) => {
                            let accepted =
                                !behavior.auth_required || (behavior.accept)(options, &nonce);
                            let _ = events.send(VaultEvent::Connect {
                                options: options.clone(),
                                nonce: nonce.clone(),
                                accepted,
                            });
                            if !accepted {
                                write(&mut sink, &ServerFrame::Err("Authorization Violation".into()))
                                    .await;
                                let _ = sink.close().await;
                                break 'conn;
                            }
                            connections.lock().unwrap().push(commands_tx.clone());
                            continue;
                        }
                        ClientFrame::Ping => {
                            pings += 1;
                            if behavior.answer_pings || pings == 1 {
                                write(&mut sink, &ServerFrame::Pong).await;
                            }
                        }
                        ClientFrame::Pong => {}
                        ClientFrame::Sub { subject, sid } => subs.push((*sid, subject.clone())),
                        ClientFrame::Unsub { sid, .. } => subs.retain(|(s, _)| s != sid),
                        ClientFrame::Pub {
                            subject,
                            reply_to,
                            payload,
                        } => {
                            deliver(&mut sink, &subs, subject, payload).await;
                            // Requests name their reply subject inside the envelope.
                            let reply_to = serde_json::from_slice::<RequestEnvelope>(payload)
                                .ok()
                                .and_then(|request| request.reply_to)
                                .and_then(|raw| Subject::parse(raw).ok())
                                .or_else(|| reply_to.clone());
                            if let Some(reply_to) = reply_to {
                                if let Some(response) = (behavior.respond)(subject.as_str(), payload) {
                                    deliver(&mut sink, &subs, &reply_to, &Bytes::from(response)).await;
                                }
                            }
                        }
                    }
                    let _ = events.send(VaultEvent::Frame(frame));
                }
            }
            command = commands.recv() => match command {
                Some(Command::Publish { subject, payload }) => {
                    deliver(&mut sink, &subs, &subject, &payload).await;
                }
                Some(Command::Drop) | None => {
                    let _ = sink.close().await;
                    break 'conn;
                }
            }
        }
    }
    let _ = events.send(VaultEvent::Disconnected);
}

pub fn test_config(url: &str) -> ClientConfig {
    let mut config = ClientConfig::new(url, "app");
    config.handshake_timeout = Duration::from_secs(2);
    config.backoff = BackoffPolicy {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(200),
        multiplier: 2.0,
        jitter: 0.0,
    };
    config
}

pub fn credential(token: &str, id: &str) -> Credential {
    let identity = SoftwareIdentity::generate();
    Credential::from_seed(token, &identity.seed(), Utc::now() + chrono::Duration::hours(1), id)
        .unwrap()
}
