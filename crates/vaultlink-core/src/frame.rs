//! Text frame codec for the messaging protocol.
//!
//! Every frame is a control line terminated by `\r\n`. `MSG` (server) and `PUB`
//! (client) frames are followed by exactly `n` payload bytes and another `\r\n`.
//!
//! ```text
//! server -> client                       client -> server
//! INFO {json}                            CONNECT {json}
//! +OK                                    PUB <subject> [reply-to] <n>
//! -ERR '<message>'                       SUB <subject> <sid>
//! PING / PONG                            UNSUB <sid> [max-msgs]
//! MSG <subject> <sid> [reply-to] <n>     PING / PONG
//! ```
//!
//! [`FrameDecoder`] is incremental: bytes can arrive split at any position, and a
//! frame is produced only once it is complete.

use std::fmt;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::subject::{Subject, SubjectError};

pub const CRLF: &[u8] = b"\r\n";

/// Longest control line accepted before the terminator.
pub const DEFAULT_MAX_CONTROL_LINE: usize = 4096;

/// Largest payload accepted unless the server advertises another limit.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Ceiling on a server-advertised `max_payload`.
pub const MAX_NEGOTIATED_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("control line exceeds {limit} bytes")]
    ControlLineTooLong { limit: usize },

    #[error("payload of {size} bytes exceeds maximum of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("malformed {op} frame: {reason}")]
    Malformed { op: &'static str, reason: String },

    #[error("payload not terminated by CRLF")]
    MissingTerminator,

    #[error("control line is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid JSON in {op}: {source}")]
    Json {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Subject(#[from] SubjectError),
}

impl FrameError {
    fn malformed(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            op,
            reason: reason.into(),
        }
    }
}

/// Server greeting carried by `INFO`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerGreeting {
    #[serde(default)]
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<usize>,
    /// Challenge the client signs during the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    /// Additional servers in the same cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connect_urls: Vec<String>,
}

impl ServerGreeting {
    /// Payload limit for this connection: the advertised value, capped at
    /// [`MAX_NEGOTIATED_PAYLOAD`].
    pub fn negotiated_max_payload(&self) -> usize {
        self.max_payload
            .unwrap_or(DEFAULT_MAX_PAYLOAD)
            .min(MAX_NEGOTIATED_PAYLOAD)
    }
}

/// Client options carried by `CONNECT`.
///
/// Auth fields use the server's wire names: `jwt` for the bearer token, `sig` for
/// the nonce signature and `nkey` for the signer's public id.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol: u8,
    #[serde(rename = "jwt", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "sig", default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(rename = "nkey", default, skip_serializing_if = "Option::is_none")]
    pub public_id: Option<String>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("name", &self.name)
            .field("lang", &self.lang)
            .field("version", &self.version)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("signature", &self.signature.is_some())
            .field("public_id", &self.public_id)
            .finish()
    }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub subject: Subject,
    pub sid: u64,
    pub reply_to: Option<Subject>,
    pub payload: Bytes,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Info(ServerGreeting),
    Ok,
    Err(String),
    Ping,
    Pong,
    Msg(MessageFrame),
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Connect(ConnectOptions),
    Pub {
        subject: Subject,
        reply_to: Option<Subject>,
        payload: Bytes,
    },
    Sub {
        subject: Subject,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max_msgs: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientFrame {
    pub fn op(&self) -> &'static str {
        match self {
            ClientFrame::Connect(_) => "CONNECT",
            ClientFrame::Pub { .. } => "PUB",
            ClientFrame::Sub { .. } => "SUB",
            ClientFrame::Unsub { .. } => "UNSUB",
            ClientFrame::Ping => "PING",
            ClientFrame::Pong => "PONG",
        }
    }

    /// Encode the frame. `PUB` payloads larger than `max_payload` and publishes to
    /// wildcard subjects are rejected.
    pub fn encode(&self, max_payload: usize) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        match self {
            ClientFrame::Connect(options) => {
                let json = serde_json::to_vec(options)
                    .map_err(|source| FrameError::Json { op: "CONNECT", source })?;
                buf.reserve(json.len() + 10);
                buf.put_slice(b"CONNECT ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            ClientFrame::Pub {
                subject,
                reply_to,
                payload,
            } => {
                subject.ensure_publishable()?;
                if let Some(reply) = reply_to {
                    reply.ensure_publishable()?;
                }
                if payload.len() > max_payload {
                    return Err(FrameError::PayloadTooLarge {
                        size: payload.len(),
                        limit: max_payload,
                    });
                }
                let line = match reply_to {
                    Some(reply) => format!("PUB {subject} {reply} {}", payload.len()),
                    None => format!("PUB {subject} {}", payload.len()),
                };
                check_line("PUB", &line)?;
                buf.reserve(line.len() + payload.len() + 4);
                buf.put_slice(line.as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(payload);
                buf.put_slice(CRLF);
            }
            ClientFrame::Sub { subject, sid } => {
                let line = format!("SUB {subject} {sid}");
                check_line("SUB", &line)?;
                buf.put_slice(line.as_bytes());
                buf.put_slice(CRLF);
            }
            ClientFrame::Unsub { sid, max_msgs } => {
                let line = match max_msgs {
                    Some(max) => format!("UNSUB {sid} {max}"),
                    None => format!("UNSUB {sid}"),
                };
                buf.put_slice(line.as_bytes());
                buf.put_slice(CRLF);
            }
            ClientFrame::Ping => buf.put_slice(b"PING\r\n"),
            ClientFrame::Pong => buf.put_slice(b"PONG\r\n"),
        }
        Ok(buf.freeze())
    }
}

impl ServerFrame {
    pub fn op(&self) -> &'static str {
        match self {
            ServerFrame::Info(_) => "INFO",
            ServerFrame::Ok => "+OK",
            ServerFrame::Err(_) => "-ERR",
            ServerFrame::Ping => "PING",
            ServerFrame::Pong => "PONG",
            ServerFrame::Msg(_) => "MSG",
        }
    }

    /// Encode the frame as a server would. Used by test peers.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        match self {
            ServerFrame::Info(greeting) => {
                let json = serde_json::to_vec(greeting)
                    .map_err(|source| FrameError::Json { op: "INFO", source })?;
                buf.put_slice(b"INFO ");
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            ServerFrame::Ok => buf.put_slice(b"+OK\r\n"),
            ServerFrame::Err(message) => {
                buf.put_slice(format!("-ERR '{message}'").as_bytes());
                buf.put_slice(CRLF);
            }
            ServerFrame::Ping => buf.put_slice(b"PING\r\n"),
            ServerFrame::Pong => buf.put_slice(b"PONG\r\n"),
            ServerFrame::Msg(msg) => {
                let line = match &msg.reply_to {
                    Some(reply) => format!(
                        "MSG {} {} {} {}",
                        msg.subject,
                        msg.sid,
                        reply,
                        msg.payload.len()
                    ),
                    None => format!("MSG {} {} {}", msg.subject, msg.sid, msg.payload.len()),
                };
                buf.put_slice(line.as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(&msg.payload);
                buf.put_slice(CRLF);
            }
        }
        Ok(buf.freeze())
    }
}

fn check_line(op: &'static str, line: &str) -> Result<(), FrameError> {
    if line.len() > DEFAULT_MAX_CONTROL_LINE {
        return Err(FrameError::malformed(op, "control line too long"));
    }
    Ok(())
}

/// How a server `-ERR` affects the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Credentials were rejected or expired. The connection is closed by the server.
    Authorization,
    /// A single operation was refused. The connection stays open.
    Permission,
    /// Any other error. The connection is closed by the server.
    Fatal,
}

pub fn classify_server_error(message: &str) -> ServerErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("authentication timeout") {
        ServerErrorKind::Fatal
    } else if lower.contains("authorization violation")
        || lower.contains("authentication expired")
        || lower.contains("authentication revoked")
    {
        ServerErrorKind::Authorization
    } else if lower.contains("permissions violation") || lower.contains("invalid subject") {
        ServerErrorKind::Permission
    } else {
        ServerErrorKind::Fatal
    }
}

/// Header of a frame whose payload follows the control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHead {
    pub subject: Subject,
    pub sid: u64,
    pub reply_to: Option<Subject>,
    pub len: usize,
}

/// Result of parsing a control line.
#[derive(Debug)]
pub enum Control<F> {
    Frame(F),
    Payload(PayloadHead),
}

/// A frame family that [`FrameDecoder`] can produce.
pub trait Decode: Sized {
    fn decode_control(line: &str) -> Result<Control<Self>, FrameError>;
    fn with_payload(head: PayloadHead, payload: Bytes) -> Self;
}

impl Decode for ServerFrame {
    fn decode_control(line: &str) -> Result<Control<Self>, FrameError> {
        let (op, rest) = split_op(line);
        let frame = match op.to_ascii_uppercase().as_str() {
            "INFO" => {
                let greeting = serde_json::from_str(rest)
                    .map_err(|source| FrameError::Json { op: "INFO", source })?;
                ServerFrame::Info(greeting)
            }
            "+OK" => ServerFrame::Ok,
            "-ERR" => ServerFrame::Err(unquote(rest).to_string()),
            "PING" => ServerFrame::Ping,
            "PONG" => ServerFrame::Pong,
            "MSG" => {
                let args: Vec<&str> = rest.split_whitespace().collect();
                let (subject, sid, reply_to, len) = match args.as_slice() {
                    [subject, sid, len] => (*subject, *sid, None, *len),
                    [subject, sid, reply, len] => (*subject, *sid, Some(*reply), *len),
                    _ => return Err(FrameError::malformed("MSG", "expected 3 or 4 arguments")),
                };
                return Ok(Control::Payload(PayloadHead {
                    subject: Subject::parse(subject)?,
                    sid: parse_num("MSG", sid)?,
                    reply_to: reply_to.map(Subject::parse).transpose()?,
                    len: parse_num("MSG", len)?,
                }));
            }
            _ => return Err(FrameError::UnknownOperation(op.to_string())),
        };
        Ok(Control::Frame(frame))
    }

    fn with_payload(head: PayloadHead, payload: Bytes) -> Self {
        ServerFrame::Msg(MessageFrame {
            subject: head.subject,
            sid: head.sid,
            reply_to: head.reply_to,
            payload,
        })
    }
}

impl Decode for ClientFrame {
    fn decode_control(line: &str) -> Result<Control<Self>, FrameError> {
        let (op, rest) = split_op(line);
        let frame = match op.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                let options = serde_json::from_str(rest)
                    .map_err(|source| FrameError::Json { op: "CONNECT", source })?;
                ClientFrame::Connect(options)
            }
            "PUB" => {
                let args: Vec<&str> = rest.split_whitespace().collect();
                let (subject, reply_to, len) = match args.as_slice() {
                    [subject, len] => (*subject, None, *len),
                    [subject, reply, len] => (*subject, Some(*reply), *len),
                    _ => return Err(FrameError::malformed("PUB", "expected 2 or 3 arguments")),
                };
                return Ok(Control::Payload(PayloadHead {
                    subject: Subject::publishable(subject)?,
                    sid: 0,
                    reply_to: reply_to.map(Subject::publishable).transpose()?,
                    len: parse_num("PUB", len)?,
                }));
            }
            "SUB" => {
                let args: Vec<&str> = rest.split_whitespace().collect();
                // A queue group may sit between subject and sid; it is ignored.
                let (subject, sid) = match args.as_slice() {
                    [subject, sid] | [subject, _, sid] => (*subject, *sid),
                    _ => return Err(FrameError::malformed("SUB", "expected 2 or 3 arguments")),
                };
                ClientFrame::Sub {
                    subject: Subject::parse(subject)?,
                    sid: parse_num("SUB", sid)?,
                }
            }
            "UNSUB" => {
                let args: Vec<&str> = rest.split_whitespace().collect();
                let (sid, max_msgs) = match args.as_slice() {
                    [sid] => (*sid, None),
                    [sid, max] => (*sid, Some(*max)),
                    _ => return Err(FrameError::malformed("UNSUB", "expected 1 or 2 arguments")),
                };
                ClientFrame::Unsub {
                    sid: parse_num("UNSUB", sid)?,
                    max_msgs: max_msgs.map(|m| parse_num("UNSUB", m)).transpose()?,
                }
            }
            "PING" => ClientFrame::Ping,
            "PONG" => ClientFrame::Pong,
            _ => return Err(FrameError::UnknownOperation(op.to_string())),
        };
        Ok(Control::Frame(frame))
    }

    fn with_payload(head: PayloadHead, payload: Bytes) -> Self {
        ClientFrame::Pub {
            subject: head.subject,
            reply_to: head.reply_to,
            payload,
        }
    }
}

fn split_op(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.find(|c: char| c == ' ' || c == '\t') {
        Some(idx) => (&line[..idx], line[idx..].trim_start()),
        None => (line, ""),
    }
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw)
}

fn parse_num<T: std::str::FromStr>(op: &'static str, raw: &str) -> Result<T, FrameError> {
    raw.parse()
        .map_err(|_| FrameError::malformed(op, format!("invalid number {raw:?}")))
}

/// Incremental decoder for one direction of the protocol.
///
/// After an error the buffered state is unspecified and the decoder must be
/// discarded along with the connection.
pub struct FrameDecoder<F> {
    buf: BytesMut,
    head: Option<PayloadHead>,
    max_control_line: usize,
    max_payload: usize,
    _frame: PhantomData<fn() -> F>,
}

impl<F: Decode> Default for FrameDecoder<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Decode> FrameDecoder<F> {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_limits(max_control_line: usize, max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            head: None,
            max_control_line,
            max_payload,
            _frame: PhantomData,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<F>, FrameError> {
        loop {
            let Some(head) = self.head.take() else {
                let scan = self.buf.len().min(self.max_control_line + CRLF.len());
                let Some(pos) = self.buf[..scan].windows(2).position(|w| w == CRLF) else {
                    if self.buf.len() > self.max_control_line {
                        return Err(FrameError::ControlLineTooLong {
                            limit: self.max_control_line,
                        });
                    }
                    return Ok(None);
                };
                if pos > self.max_control_line {
                    return Err(FrameError::ControlLineTooLong {
                        limit: self.max_control_line,
                    });
                }

                let line = self.buf.split_to(pos);
                self.buf.advance(CRLF.len());
                let line = std::str::from_utf8(&line).map_err(|_| FrameError::InvalidUtf8)?;
                if line.trim().is_empty() {
                    continue;
                }

                match F::decode_control(line)? {
                    Control::Frame(frame) => return Ok(Some(frame)),
                    Control::Payload(head) => {
                        if head.len > self.max_payload {
                            return Err(FrameError::PayloadTooLarge {
                                size: head.len,
                                limit: self.max_payload,
                            });
                        }
                        self.head = Some(head);
                        continue;
                    }
                }
            };

            let Some(needed) = head.len.checked_add(CRLF.len()) else {
                return Err(FrameError::PayloadTooLarge {
                    size: head.len,
                    limit: self.max_payload,
                });
            };
            if self.buf.len() < needed {
                self.head = Some(head);
                return Ok(None);
            }
            let payload = self.buf.split_to(head.len).freeze();
            if &self.buf[..CRLF.len()] != CRLF {
                return Err(FrameError::MissingTerminator);
            }
            self.buf.advance(CRLF.len());
            return Ok(Some(F::with_payload(head, payload)));
        }
    }
}

pub type ServerFrameDecoder = FrameDecoder<ServerFrame>;
pub type ClientFrameDecoder = FrameDecoder<ClientFrame>;

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all<F: Decode>(decoder: &mut FrameDecoder<F>) -> Vec<F> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_server_frames() {
        let mut decoder = ServerFrameDecoder::new();
        decoder.push(
            b"INFO {\"server_id\":\"s1\",\"nonce\":\"abc\",\"auth_required\":true}\r\n+OK\r\nPING\r\n-ERR 'Authorization Violation'\r\n",
        );
        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 4);
        match &frames[0] {
            ServerFrame::Info(info) => {
                assert_eq!(info.server_id, "s1");
                assert_eq!(info.nonce.as_deref(), Some("abc"));
                assert!(info.auth_required);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(frames[1], ServerFrame::Ok);
        assert_eq!(frames[2], ServerFrame::Ping);
        assert_eq!(
            frames[3],
            ServerFrame::Err("Authorization Violation".to_string())
        );
    }

    #[test]
    fn test_decode_msg_split_across_reads() {
        let wire = b"MSG scope.forApp.a 7 scope.forVault.b 5\r\nhello\r\nPONG\r\n";
        for split in 0..wire.len() {
            let mut decoder = ServerFrameDecoder::new();
            decoder.push(&wire[..split]);
            let mut frames = decode_all(&mut decoder);
            decoder.push(&wire[split..]);
            frames.extend(decode_all(&mut decoder));

            assert_eq!(frames.len(), 2, "split at {split}");
            match &frames[0] {
                ServerFrame::Msg(msg) => {
                    assert_eq!(msg.subject.as_str(), "scope.forApp.a");
                    assert_eq!(msg.sid, 7);
                    assert_eq!(
                        msg.reply_to.as_ref().map(Subject::as_str),
                        Some("scope.forVault.b")
                    );
                    assert_eq!(&msg.payload[..], b"hello");
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(frames[1], ServerFrame::Pong);
        }
    }

    #[test]
    fn test_payload_may_contain_crlf() {
        let mut decoder = ServerFrameDecoder::new();
        decoder.push(b"MSG a.b 1 4\r\n\r\n\r\n\r\n");
        match decoder.next_frame().unwrap() {
            Some(ServerFrame::Msg(msg)) => assert_eq!(&msg.payload[..], b"\r\n\r\n"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut decoder = ServerFrameDecoder::with_limits(DEFAULT_MAX_CONTROL_LINE, 4);
        decoder.push(b"MSG a.b 1 5\r\n");
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::PayloadTooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_payload_length_overflow_rejected() {
        let mut decoder = ServerFrameDecoder::with_limits(DEFAULT_MAX_CONTROL_LINE, 1024);
        decoder.set_max_payload(usize::MAX);
        decoder.push(format!("MSG a.b 1 {}\r\nhello", usize::MAX).as_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::PayloadTooLarge { size: usize::MAX, .. })
        ));
    }

    #[test]
    fn test_advertised_max_payload_is_capped() {
        let mut greeting = ServerGreeting::default();
        assert_eq!(greeting.negotiated_max_payload(), DEFAULT_MAX_PAYLOAD);
        greeting.max_payload = Some(8 * 1024);
        assert_eq!(greeting.negotiated_max_payload(), 8 * 1024);
        greeting.max_payload = Some(usize::MAX);
        assert_eq!(greeting.negotiated_max_payload(), MAX_NEGOTIATED_PAYLOAD);
    }

    #[test]
    fn test_long_control_line_rejected() {
        let mut decoder = ServerFrameDecoder::with_limits(16, DEFAULT_MAX_PAYLOAD);
        decoder.push(&[b'x'; 32]);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::ControlLineTooLong { limit: 16 })
        ));
    }

    #[test]
    fn test_missing_terminator() {
        let mut decoder = ServerFrameDecoder::new();
        decoder.push(b"MSG a.b 1 2\r\nhiXX");
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::MissingTerminator)
        ));
    }

    #[test]
    fn test_unknown_operation() {
        let mut decoder = ServerFrameDecoder::new();
        decoder.push(b"HMSG a 1 2 3\r\n");
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::UnknownOperation(op)) if op == "HMSG"
        ));
    }

    #[test]
    fn test_encode_client_frames() {
        let publish = ClientFrame::Pub {
            subject: Subject::parse("scope.forVault.ping").unwrap(),
            reply_to: Some(Subject::parse("scope.forApp.ping.r1").unwrap()),
            payload: Bytes::from_static(b"{}"),
        };
        assert_eq!(
            &publish.encode(DEFAULT_MAX_PAYLOAD).unwrap()[..],
            b"PUB scope.forVault.ping scope.forApp.ping.r1 2\r\n{}\r\n"
        );

        let sub = ClientFrame::Sub {
            subject: Subject::parse("scope.forApp.>").unwrap(),
            sid: 3,
        };
        assert_eq!(
            &sub.encode(DEFAULT_MAX_PAYLOAD).unwrap()[..],
            b"SUB scope.forApp.> 3\r\n"
        );

        let unsub = ClientFrame::Unsub {
            sid: 3,
            max_msgs: None,
        };
        assert_eq!(&unsub.encode(DEFAULT_MAX_PAYLOAD).unwrap()[..], b"UNSUB 3\r\n");
    }

    #[test]
    fn test_encode_rejects_wildcard_publish() {
        let publish = ClientFrame::Pub {
            subject: Subject::parse("scope.forVault.*").unwrap(),
            reply_to: None,
            payload: Bytes::new(),
        };
        assert!(matches!(
            publish.encode(DEFAULT_MAX_PAYLOAD),
            Err(FrameError::Subject(SubjectError::WildcardNotPublishable(_)))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_publish() {
        let publish = ClientFrame::Pub {
            subject: Subject::parse("a.b").unwrap(),
            reply_to: None,
            payload: Bytes::from(vec![0u8; 9]),
        };
        assert!(matches!(
            publish.encode(8),
            Err(FrameError::PayloadTooLarge { size: 9, limit: 8 })
        ));
    }

    #[test]
    fn test_connect_uses_wire_names_and_omits_absent_auth() {
        let mut options = ConnectOptions {
            lang: "rust".into(),
            version: "0.1.0".into(),
            protocol: 1,
            ..Default::default()
        };
        let bytes = ClientFrame::Connect(options.clone())
            .encode(DEFAULT_MAX_PAYLOAD)
            .unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(!text.contains("jwt"));
        assert!(!text.contains("sig"));

        options.token = Some("token".into());
        options.signature = Some("signed".into());
        options.public_id = Some("UABC".into());
        let bytes = ClientFrame::Connect(options).encode(DEFAULT_MAX_PAYLOAD).unwrap();
        let mut decoder = ClientFrameDecoder::new();
        decoder.push(&bytes);
        let json_start = bytes.iter().position(|b| *b == b'{').unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&bytes[json_start..bytes.len() - 2]).unwrap();
        assert_eq!(value["jwt"], "token");
        assert_eq!(value["sig"], "signed");
        assert_eq!(value["nkey"], "UABC");
        assert!(matches!(
            decoder.next_frame().unwrap(),
            Some(ClientFrame::Connect(_))
        ));
    }

    #[test]
    fn test_connect_debug_redacts_token() {
        let options = ConnectOptions {
            token: Some("secret-token".into()),
            ..Default::default()
        };
        assert!(!format!("{options:?}").contains("secret-token"));
    }

    #[test]
    fn test_classify_server_error() {
        assert_eq!(
            classify_server_error("Authorization Violation"),
            ServerErrorKind::Authorization
        );
        assert_eq!(
            classify_server_error("User Authentication Expired"),
            ServerErrorKind::Authorization
        );
        assert_eq!(
            classify_server_error("Permissions Violation for Publish to \"a.b\""),
            ServerErrorKind::Permission
        );
        assert_eq!(
            classify_server_error("Authentication Timeout"),
            ServerErrorKind::Fatal
        );
        assert_eq!(
            classify_server_error("Maximum Payload Violation"),
            ServerErrorKind::Fatal
        );
    }
}
