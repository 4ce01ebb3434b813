//! One-shot streamed exec.
//!
//! `POST /api/containers/exec-stream/{id}` with `{"command": "..."}` runs the
//! command once and streams one NDJSON envelope per output line. Standard
//! output and standard error are pumped concurrently, so lines from the two
//! streams interleave in arrival order. The stream always ends with exactly
//! one `sys` envelope, unless the client left first.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use protocol::{EnvelopeKind, ExecEnvelope, ExecRequest, ProcessExit, SessionMode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{open_session, record_launch_failure, record_outcome, ChannelSink};
use crate::server::{ApiError, AppState};
use crate::session::{
    pump, CloseReason, Framing, ProcessIo, PumpFrame, PumpSet, ReaderSource,
};

/// Content type of the streamed response.
pub const NDJSON: &str = "application/x-ndjson";

/// Text of the final `sys` envelope.
pub fn completion_text(exit: &ProcessExit) -> String {
    if exit.success() {
        "Command finished".to_string()
    } else {
        format!("Command exited with error: {exit}")
    }
}

fn envelope_for(kind: EnvelopeKind, frame: PumpFrame) -> Option<ExecEnvelope> {
    match frame {
        PumpFrame::Line(line) => Some(ExecEnvelope::new(kind, line)),
        PumpFrame::Chunk(data) => Some(ExecEnvelope::new(
            kind,
            String::from_utf8_lossy(&data).into_owned(),
        )),
        PumpFrame::ReadError(e) => Some(ExecEnvelope::err(format!("read error: {e}"))),
    }
}

/// Handles `POST /api/containers/exec-stream/{id}`.
pub async fn exec_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Response, ApiError> {
    let spec = state.targets.exec(&id, &request.command)?;
    let command_line = spec.command_line();
    let (session, guard) = open_session(&state, SessionMode::OneShotStream, &id)?;

    // Launch failures are reported before any part of the body is sent.
    let (stdout, stderr) = match session.launch(&spec, None) {
        Ok(ProcessIo::Pipes { stdout, stderr }) => (stdout, stderr),
        Ok(ProcessIo::Pty { .. }) => {
            return Err(ApiError::Internal("exec session got a terminal".to_string()))
        }
        Err(e) => {
            record_launch_failure(&state, &command_line, &e.to_string());
            return Err(e.into());
        }
    };

    let limits = *session.limits();
    let framing = Framing::Lines {
        max_line: limits.max_line,
    };
    let (tx, rx) = mpsc::channel::<ExecEnvelope>(1);

    let mut pumps = PumpSet::new();
    pumps.spawn_outbound(pump(
        ReaderSource::new(stdout, limits.read_buffer_size),
        ChannelSink::new(tx.clone(), |frame| envelope_for(EnvelopeKind::Out, frame)),
        framing,
        session.outbound_control(),
    ));
    pumps.spawn_outbound(pump(
        ReaderSource::new(stderr, limits.read_buffer_size),
        ChannelSink::new(tx.clone(), |frame| envelope_for(EnvelopeKind::Err, frame)),
        framing,
        session.outbound_control(),
    ));

    tokio::spawn(async move {
        let _guard = guard;
        let gone = {
            let tx = tx.clone();
            async move { tx.closed().await }
        };
        let outcome = session.drive(pumps, gone).await;

        if outcome.reason != CloseReason::ClientGone {
            let _ = tx.send(ExecEnvelope::sys(completion_text(&outcome.exit))).await;
        }
        record_outcome(&state, &session, &command_line, &outcome);
    });

    let body = ReceiverStream::new(rx).map(|envelope| envelope.to_ndjson_line().map(Bytes::from));

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_text() {
        assert_eq!(
            completion_text(&ProcessExit::Exited { code: 0 }),
            "Command finished"
        );
        assert_eq!(
            completion_text(&ProcessExit::Exited { code: 2 }),
            "Command exited with error: exit status 2"
        );
        assert_eq!(
            completion_text(&ProcessExit::Killed),
            "Command exited with error: killed"
        );
    }

    #[test]
    fn test_read_errors_become_err_envelopes() {
        let envelope = envelope_for(EnvelopeKind::Out, PumpFrame::ReadError("EIO".to_string()));
        assert_eq!(envelope, Some(ExecEnvelope::err("read error: EIO")));

        let envelope = envelope_for(EnvelopeKind::Out, PumpFrame::Line("hi".to_string()));
        assert_eq!(envelope, Some(ExecEnvelope::out("hi")));
    }
}
