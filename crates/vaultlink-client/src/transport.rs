//! A single authenticated connection to the vault.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use vaultlink_core::{
    classify_server_error, ClientFrame, ConnectOptions, ServerErrorKind, ServerFrame,
    ServerFrameDecoder, ServerGreeting, CLIENT_LANG, CLIENT_VERSION, DEFAULT_MAX_PAYLOAD,
    PROTOCOL_VERSION,
};
use vaultlink_crypto::{sign_nonce, Credential};

use crate::error::TransportError;
use crate::types::{ClientConfig, ConnectionState, StateCell};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Write half of a connection.
pub struct FrameWriter {
    sink: WsSink,
    max_payload: usize,
}

impl FrameWriter {
    /// Encode and write one frame. Encoding failures are [`TransportError::Frame`]
    /// and leave the connection usable.
    pub async fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        let bytes = frame.encode(self.max_payload)?;
        self.sink
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }

    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("websocket close: {}", e);
        }
    }
}

/// Read half of a connection.
pub struct FrameReader {
    stream: WsSource,
    decoder: ServerFrameDecoder,
}

impl FrameReader {
    /// Next complete frame. Decoding failures are protocol errors.
    pub async fn receive_frame(&mut self) -> Result<ServerFrame, TransportError> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => return Err(TransportError::Protocol(e.to_string())),
            }

            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.decoder.push(&data),
                Some(Ok(Message::Text(text))) => self.decoder.push(text.as_str().as_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by peer".to_string());
                    return Err(TransportError::Stream(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Stream(e.to_string())),
                None => return Err(TransportError::Stream("connection closed".into())),
            }
        }
    }
}

/// An authenticated connection, ready for traffic.
pub struct ConnectionHandle {
    writer: FrameWriter,
    reader: FrameReader,
    greeting: ServerGreeting,
}

impl ConnectionHandle {
    pub fn greeting(&self) -> &ServerGreeting {
        &self.greeting
    }

    pub fn max_payload(&self) -> usize {
        self.writer.max_payload
    }

    pub async fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        self.writer.send_frame(frame).await
    }

    pub async fn receive_frame(&mut self) -> Result<ServerFrame, TransportError> {
        self.reader.receive_frame().await
    }

    pub fn into_split(self) -> (FrameWriter, FrameReader, ServerGreeting) {
        (self.writer, self.reader, self.greeting)
    }
}

/// Open a WebSocket to `address` and run the greeting/CONNECT/PING handshake,
/// bounded by `config.handshake_timeout`.
pub async fn connect(
    config: &ClientConfig,
    address: &str,
    credential: Option<&Credential>,
    state: &StateCell,
) -> Result<ConnectionHandle, TransportError> {
    match timeout(
        config.handshake_timeout,
        handshake(config, address, credential, state),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!("handshake with {} timed out", address);
            Err(TransportError::HandshakeTimeout)
        }
    }
}

async fn handshake(
    config: &ClientConfig,
    address: &str,
    credential: Option<&Credential>,
    state: &StateCell,
) -> Result<ConnectionHandle, TransportError> {
    debug!("connecting to {}", address);
    let (ws_stream, _) = connect_async(address)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let (sink, stream) = ws_stream.split();

    let mut reader = FrameReader {
        stream,
        decoder: ServerFrameDecoder::with_limits(config.max_control_line, DEFAULT_MAX_PAYLOAD),
    };
    let mut writer = FrameWriter {
        sink,
        max_payload: DEFAULT_MAX_PAYLOAD,
    };
    state.transition(ConnectionState::AwaitingGreeting);

    let greeting = match reader.receive_frame().await? {
        ServerFrame::Info(greeting) => greeting,
        other => {
            return Err(TransportError::Protocol(format!(
                "expected INFO, got {}",
                other.op()
            )))
        }
    };
    let max_payload = greeting.negotiated_max_payload();
    reader.decoder.set_max_payload(max_payload);
    writer.max_payload = max_payload;
    state.transition(ConnectionState::Authenticating);

    let options = connect_options(config, &greeting, credential)?;
    writer.send_frame(&ClientFrame::Connect(options)).await?;
    writer.send_frame(&ClientFrame::Ping).await?;

    loop {
        match reader.receive_frame().await? {
            ServerFrame::Pong => break,
            ServerFrame::Ok => debug!("handshake +OK"),
            ServerFrame::Ping => writer.send_frame(&ClientFrame::Pong).await?,
            ServerFrame::Info(_) => debug!("ignoring INFO during handshake"),
            ServerFrame::Err(message) => {
                return Err(match classify_server_error(&message) {
                    ServerErrorKind::Authorization => TransportError::Authorization(message),
                    _ => TransportError::Protocol(message),
                });
            }
            ServerFrame::Msg(msg) => {
                return Err(TransportError::Protocol(format!(
                    "unexpected MSG on {} during handshake",
                    msg.subject
                )))
            }
        }
    }

    info!(
        "connected to {} (server {}, auth {})",
        address, greeting.server_id, greeting.auth_required
    );
    Ok(ConnectionHandle {
        writer,
        reader,
        greeting,
    })
}

/// Build the `CONNECT` options for a greeting. The seed never leaves the credential;
/// only the token, the nonce signature and the public id are sent.
pub fn connect_options(
    config: &ClientConfig,
    greeting: &ServerGreeting,
    credential: Option<&Credential>,
) -> Result<ConnectOptions, TransportError> {
    let mut options = ConnectOptions {
        verbose: config.verbose,
        pedantic: config.pedantic,
        tls_required: greeting.tls_required,
        name: config.name.clone(),
        lang: CLIENT_LANG.to_string(),
        version: CLIENT_VERSION.to_string(),
        protocol: PROTOCOL_VERSION,
        ..Default::default()
    };
    if !greeting.auth_required {
        return Ok(options);
    }

    let credential = credential.ok_or_else(|| {
        TransportError::Authorization("server requires auth but no credential is loaded".into())
    })?;
    options.token = Some(credential.token().to_string());
    options.public_id = Some(credential.identity().public_id().as_str().to_string());
    if let Some(nonce) = &greeting.nonce {
        let signature = sign_nonce(credential.identity(), nonce)
            .map_err(|e| TransportError::Authorization(format!("signing nonce: {e}")))?;
        options.signature = Some(signature);
    }
    Ok(options)
}
