//! # Streamgate Protocol Library
//!
//! Wire types shared by the streamgate gateway and its clients.
//!
//! ## Overview
//!
//! The gateway exposes three streaming surfaces, each with its own framing:
//!
//! - **Interactive terminal** (websocket): binary frames carry raw pty bytes;
//!   text frames carry [`ControlMessage`]s inbound and a final [`StatusFrame`]
//!   outbound.
//! - **One-shot exec** (chunked HTTP): newline-delimited [`ExecEnvelope`]s,
//!   ending with exactly one `sys` envelope.
//! - **Log follow** (server-sent events): one [`SseEvent`] per line, at most
//!   one `error` event.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ControlMessage, ExecEnvelope, LineSplitter};
//!
//! // Terminal control frames are recognised, plain input is not
//! let msg = ControlMessage::parse_text(r#"{"type":"resize","rows":24,"cols":80}"#).unwrap();
//! assert_eq!(msg, Some(ControlMessage::Resize { rows: 24, cols: 80 }));
//! assert_eq!(ControlMessage::parse_text("echo hi\n").unwrap(), None);
//!
//! // Process output is forwarded one line at a time
//! let mut splitter = LineSplitter::default();
//! let lines = splitter.push(b"first\nsecond\npart");
//! assert_eq!(lines, vec!["first", "second"]);
//!
//! let line = ExecEnvelope::out(&lines[0]).to_ndjson_line().unwrap();
//! assert_eq!(line, "{\"type\":\"out\",\"text\":\"first\"}\n");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Control frames, exec envelopes, status and session summaries
//! - [`framing`]: Line splitting and event-stream encoding
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{LineSplitter, SseDecoder, SseEvent, DEFAULT_MAX_LINE, MAX_CONTROL_FRAME};
pub use messages::{
    ControlMessage, EnvelopeKind, ExecEnvelope, ExecRequest, ProcessExit, SessionMode,
    SessionState, SessionSummary, StatusFrame,
};
