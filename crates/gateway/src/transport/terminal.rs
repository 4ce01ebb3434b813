//! Interactive terminal over a websocket.
//!
//! `GET /api/containers/ws/{id}` upgrades to a websocket bound to a shell on a
//! fresh pseudo-terminal. Binary frames in both directions carry raw terminal
//! bytes. Inbound text frames holding a resize control message resize the
//! terminal and are never forwarded; any other text is terminal input. When
//! the process ends first, the socket gets one final [`StatusFrame`] before
//! it is closed.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ControlMessage, SessionMode, StatusFrame};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{open_session, record_launch_failure, record_outcome};
use crate::server::{ApiError, AppState};
use crate::session::{
    pump, ChunkSource, CloseReason, Dimensions, FrameSink, Framing, LaunchSpec, ProcessIo,
    PumpFrame, PumpSet, Session, SinkClosed,
};

/// Prefix of the text frame sent when the terminal could not be started.
pub const LAUNCH_ERROR_PREFIX: &str = "[streamgate] Error starting PTY: ";

/// Optional initial terminal size.
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    /// Terminal height in rows.
    pub rows: Option<u16>,
    /// Terminal width in columns.
    pub cols: Option<u16>,
}

impl TerminalQuery {
    fn dimensions(&self, default: Dimensions) -> Dimensions {
        Dimensions::new(
            self.rows.filter(|r| *r > 0).unwrap_or(default.rows),
            self.cols.filter(|c| *c > 0).unwrap_or(default.cols),
        )
    }
}

type SocketWriter = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Outbound sink: terminal bytes to binary frames.
struct SocketSink {
    writer: SocketWriter,
}

impl FrameSink for SocketSink {
    async fn send_frame(&mut self, frame: PumpFrame) -> Result<(), SinkClosed> {
        let message = match frame {
            PumpFrame::Chunk(data) => Message::Binary(data.to_vec()),
            PumpFrame::Line(line) => Message::Text(line),
            PumpFrame::ReadError(e) => Message::Text(format!("[streamgate] read error: {e}")),
        };
        self.writer
            .lock()
            .await
            .send(message)
            .await
            .map_err(|_| SinkClosed)
    }
}

/// Inbound source: websocket messages to terminal input.
///
/// Resize requests are applied here, between two input writes, so a resize
/// never splits one.
struct SocketSource {
    reader: SplitStream<WebSocket>,
    session: Arc<Session>,
}

impl SocketSource {
    fn apply_control(&self, text: &str) -> bool {
        match ControlMessage::parse_text(text) {
            Ok(Some(ControlMessage::Resize { rows, cols })) => {
                if let Err(e) = self.session.resize(Dimensions::new(rows, cols)) {
                    tracing::warn!(session_id = %self.session.id(), error = %e, "Resize failed");
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(session_id = %self.session.id(), error = %e, "Ignoring malformed control message");
                true
            }
        }
    }
}

impl ChunkSource for SocketSource {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            let Some(message) = self.reader.next().await else {
                return Ok(None);
            };
            match message.map_err(std::io::Error::other)? {
                Message::Binary(data) => return Ok(Some(Bytes::from(data))),
                Message::Text(text) => {
                    if !self.apply_control(&text) {
                        return Ok(Some(Bytes::from(text)));
                    }
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }
}

/// Handles `GET /api/containers/ws/{id}`.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let spec = state.targets.terminal(&id)?;
    let dims = query.dimensions(state.config.session.default_dimensions());
    let (session, guard) = open_session(&state, SessionMode::Interactive, &id)?;

    Ok(ws.on_upgrade(move |socket| async move {
        let _guard = guard;
        run_terminal(state, session, spec, dims, socket).await;
    }))
}

async fn run_terminal(
    state: AppState,
    session: Arc<Session>,
    spec: LaunchSpec,
    dims: Dimensions,
    socket: WebSocket,
) {
    let command_line = spec.command_line();
    let (writer, reader) = socket.split();
    let writer: SocketWriter = Arc::new(Mutex::new(writer));

    let (output, input) = match session.launch(&spec, Some(dims)) {
        Ok(ProcessIo::Pty { output, input }) => (output, input),
        Ok(ProcessIo::Pipes { .. }) => {
            tracing::error!(session_id = %session.id(), "Terminal session got pipes");
            return;
        }
        Err(e) => {
            record_launch_failure(&state, &command_line, &e.to_string());
            let mut writer = writer.lock().await;
            let _ = writer
                .send(Message::Text(format!("{LAUNCH_ERROR_PREFIX}{e}")))
                .await;
            let _ = writer.close().await;
            return;
        }
    };

    let mut pumps = PumpSet::new();
    pumps.spawn_outbound(pump(
        output,
        SocketSink {
            writer: Arc::clone(&writer),
        },
        Framing::Raw,
        session.outbound_control(),
    ));
    pumps.spawn_inbound(pump(
        SocketSource {
            reader,
            session: Arc::clone(&session),
        },
        input,
        Framing::Raw,
        session.closing_token(),
    ));

    let outcome = session.drive(pumps, std::future::pending()).await;

    if outcome.reason != CloseReason::ClientGone {
        let status = StatusFrame::from_exit(&outcome.exit, outcome.reason.to_string());
        let mut writer = writer.lock().await;
        if let Ok(json) = status.to_json() {
            let _ = writer.send(Message::Text(json)).await;
        }
        let _ = writer.close().await;
    }

    record_outcome(&state, &session, &command_line, &outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_dimensions_fall_back_to_default() {
        let default = Dimensions::new(24, 80);

        let query = TerminalQuery::default();
        assert_eq!(query.dimensions(default), default);

        let query = TerminalQuery {
            rows: Some(50),
            cols: Some(0),
        };
        assert_eq!(query.dimensions(default), Dimensions::new(50, 80));
    }
}
