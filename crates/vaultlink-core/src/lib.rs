//! Core Vaultlink protocol types, framing, and constants.
//!
//! This crate provides:
//! - The text frame codec spoken with the messaging server
//! - Subject validation and the vault subject naming contract
//! - JSON request, response and notification envelopes
//! - Typed payloads for bootstrap, credential and session operations

#![forbid(unsafe_code)]

pub mod envelope;
pub mod frame;
pub mod protocol;
pub mod subject;

pub use envelope::{Notification, RequestEnvelope, ResponseEnvelope};
pub use frame::{
    classify_server_error, ClientFrame, ClientFrameDecoder, ConnectOptions, FrameDecoder,
    FrameError, MessageFrame, ServerErrorKind, ServerFrame, ServerFrameDecoder, ServerGreeting,
    DEFAULT_MAX_CONTROL_LINE, DEFAULT_MAX_PAYLOAD, MAX_NEGOTIATED_PAYLOAD,
};
pub use subject::{Subject, SubjectError, VaultSubjects};

/// Protocol level advertised in `CONNECT`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Language tag advertised in `CONNECT`.
pub const CLIENT_LANG: &str = "rust";

/// Version string advertised in `CONNECT`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
