//! Message definitions exchanged between the gateway and its clients.
//!
//! All messages are JSON. Interactive terminals carry raw bytes in binary
//! frames and use the types here only for text control/status frames; the
//! exec stream is newline-delimited [`ExecEnvelope`]s.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::MAX_CONTROL_FRAME;

/// Control message sent by a terminal client as a text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Terminal resize notification.
    Resize {
        /// New terminal height.
        rows: u16,
        /// New terminal width.
        cols: u16,
    },
}

impl ControlMessage {
    /// Classifies a text frame received on a terminal socket.
    ///
    /// Returns `Ok(None)` when the text is not a control message at all
    /// (plain input, foreign JSON, oversized frames), `Ok(Some(_))` for a
    /// valid control message, and an error for a control message with bad
    /// fields. Invalid control messages must not be forwarded as input.
    pub fn parse_text(text: &str) -> Result<Option<Self>> {
        if text.len() > MAX_CONTROL_FRAME {
            return Ok(None);
        }

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };

        let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
            return Ok(None);
        };
        if kind != "resize" {
            return Ok(None);
        }

        let message: ControlMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidControlMessage(e.to_string()))?;
        message.validate()?;
        Ok(Some(message))
    }

    /// Rejects resize requests with a zero dimension.
    pub fn validate(&self) -> Result<()> {
        match *self {
            ControlMessage::Resize { rows, cols } if rows == 0 || cols == 0 => {
                Err(ProtocolError::InvalidControlMessage(format!(
                    "resize dimensions must be non-zero, got {rows}x{cols}"
                )))
            }
            ControlMessage::Resize { .. } => Ok(()),
        }
    }

    /// Serializes the message for sending as a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Body of a one-shot exec request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Command line to run inside the target.
    pub command: String,
}

/// Which stream an exec envelope came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A line of standard output.
    Out,
    /// A line of standard error, or a stream failure.
    Err,
    /// Gateway-generated status.
    Sys,
}

/// One line of exec output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEnvelope {
    /// Source stream.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Line text without its terminator.
    pub text: String,
}

impl ExecEnvelope {
    /// Creates a new envelope.
    pub fn new(kind: EnvelopeKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Creates a standard output envelope.
    pub fn out(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Out, text)
    }

    /// Creates a standard error envelope.
    pub fn err(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Err, text)
    }

    /// Creates a status envelope.
    pub fn sys(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Sys, text)
    }

    /// Encodes the envelope as one NDJSON line, terminator included.
    pub fn to_ndjson_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decodes one NDJSON line.
    pub fn from_ndjson_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// How a streamed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessExit {
    /// The process exited on its own with a status code.
    Exited {
        /// Exit code.
        code: i32,
    },
    /// The process was terminated by a signal it did not receive from us.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// The process was terminated by the gateway.
    Killed,
    /// The exit status could not be determined.
    Unknown,
}

impl ProcessExit {
    /// Returns true only for a clean zero exit.
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Exited { code: 0 })
    }

    /// Returns the exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessExit::Exited { code } => Some(*code),
            _ => None,
        }
    }

    /// Returns the terminating signal, if any.
    pub fn signal(&self) -> Option<i32> {
        match self {
            ProcessExit::Signaled { signal } => Some(*signal),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Exited { code } => write!(f, "exit status {code}"),
            ProcessExit::Signaled { signal } => write!(f, "signal: {signal}"),
            ProcessExit::Killed => write!(f, "killed"),
            ProcessExit::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// Final status frame sent on an interactive socket before it closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    /// Always `"exit"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Exit code for a normal exit.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<i32>,
    /// Signal number for a signalled exit.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signal: Option<i32>,
    /// Human readable description of why the session ended.
    pub reason: String,
}

impl StatusFrame {
    /// Builds a status frame from a process exit.
    pub fn from_exit(exit: &ProcessExit, reason: impl Into<String>) -> Self {
        Self {
            kind: "exit".to_string(),
            code: exit.code(),
            signal: exit.signal(),
            reason: reason.into(),
        }
    }

    /// Serializes the frame for sending as a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Operating mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Pty-backed interactive terminal over a websocket.
    Interactive,
    /// One-shot command streamed as NDJSON.
    OneShotStream,
    /// Log follow streamed as server-sent events.
    LogFollow,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionMode::Interactive => "interactive",
            SessionMode::OneShotStream => "one_shot_stream",
            SessionMode::LogFollow => "log_follow",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process launch requested.
    Starting,
    /// Process running, pumps active.
    Running,
    /// Tearing down: process terminating, pumps draining.
    Closing,
    /// Terminal state; resources released.
    Closed,
}

/// Snapshot of a live session, as listed by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Operating mode.
    pub mode: SessionMode,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Target identifier the session was opened against.
    pub target: String,
    /// Process ID, once launched.
    pub pid: Option<u32>,
    /// Terminal height for interactive sessions.
    pub rows: Option<u16>,
    /// Terminal width for interactive sessions.
    pub cols: Option<u16>,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
}
