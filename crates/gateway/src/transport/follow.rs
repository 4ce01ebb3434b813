//! Log follow over server-sent events.
//!
//! `GET /api/containers/logs/stream/{id}` launches the configured follow
//! command and pushes each output line as one event. A read failure becomes
//! a single `error` event and ends the stream. When the client goes away the
//! follow process is terminated.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use protocol::{SessionMode, SseEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{open_session, record_launch_failure, record_outcome, ChannelSink};
use crate::server::{ApiError, AppState};
use crate::session::{pump, Framing, ProcessIo, PumpFrame, PumpSet, ReaderSource};

/// Maps pump frames to events, letting through at most one error event
/// across every pump sharing `errored`.
fn event_for(frame: PumpFrame, errored: &AtomicBool) -> Option<SseEvent> {
    match frame {
        PumpFrame::Line(line) => Some(SseEvent::data(line)),
        PumpFrame::Chunk(data) => Some(SseEvent::data(String::from_utf8_lossy(&data))),
        PumpFrame::ReadError(e) => {
            (!errored.swap(true, Ordering::SeqCst)).then(|| SseEvent::error(e))
        }
    }
}

/// Converts to the axum event type. Carriage returns cannot appear inside
/// an event field, so they are dropped.
fn to_axum_event(event: SseEvent) -> Event {
    let data = event.data.replace('\r', "");
    let out = Event::default().data(data);
    match event.event {
        Some(name) => out.event(name.replace(['\r', '\n'], "")),
        None => out,
    }
}

/// Handles `GET /api/containers/logs/stream/{id}`.
pub async fn follow_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let spec = state.targets.follow(&id)?;
    let command_line = spec.command_line();
    let (session, guard) = open_session(&state, SessionMode::LogFollow, &id)?;

    let (stdout, stderr) = match session.launch(&spec, None) {
        Ok(ProcessIo::Pipes { stdout, stderr }) => (stdout, stderr),
        Ok(ProcessIo::Pty { .. }) => {
            return Err(ApiError::Internal("follow session got a terminal".to_string()))
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
    let (tx, rx) = mpsc::channel::<SseEvent>(1);
    let errored = Arc::new(AtomicBool::new(false));

    let mut pumps = PumpSet::new();
    let stdout_errored = Arc::clone(&errored);
    pumps.spawn_outbound(pump(
        ReaderSource::new(stdout, limits.read_buffer_size),
        ChannelSink::new(tx.clone(), move |frame| event_for(frame, &stdout_errored)),
        framing,
        session.outbound_control(),
    ));
    pumps.spawn_outbound(pump(
        ReaderSource::new(stderr, limits.read_buffer_size),
        ChannelSink::new(tx.clone(), move |frame| event_for(frame, &errored)),
        framing,
        session.outbound_control(),
    ));

    let keep_alive = KeepAlive::new().interval(Duration::from_secs(
        state.config.server.keep_alive_secs.max(1),
    ));

    tokio::spawn(async move {
        let _guard = guard;
        let gone = async move { tx.closed().await };
        let outcome = session.drive(pumps, gone).await;
        record_outcome(&state, &session, &command_line, &outcome);
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok(to_axum_event(event)));
    Ok(Sse::new(stream).keep_alive(keep_alive))
}
