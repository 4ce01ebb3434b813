//! Transport adapters.
//!
//! Each adapter binds one [`Session`] to one client connection:
//!
//! - [`terminal`]: full-duplex websocket carrying raw pty bytes
//! - [`exec`]: chunked NDJSON response for a one-shot command
//! - [`follow`]: server-sent events for a log follow
//!
//! A session never outlives the handler that created it: the registry
//! entry is dropped with the handler's [`SessionGuard`].

pub mod exec;
pub mod follow;
pub mod terminal;

use std::sync::Arc;

use protocol::SessionMode;
use tokio::sync::mpsc;

use crate::server::{ApiError, AppState};
use crate::session::{
    CloseReason, FrameSink, PumpFrame, Session, SessionGuard, SessionOutcome, SinkClosed,
};

/// A sink that maps pump frames into another message type and forwards
/// them over a bounded channel.
///
/// Returning `None` from the mapper drops the frame.
pub struct ChannelSink<T, F> {
    tx: mpsc::Sender<T>,
    map: F,
}

impl<T, F> ChannelSink<T, F>
where
    T: Send,
    F: FnMut(PumpFrame) -> Option<T> + Send,
{
    /// Creates a sink forwarding into `tx`.
    pub fn new(tx: mpsc::Sender<T>, map: F) -> Self {
        Self { tx, map }
    }
}

impl<T, F> FrameSink for ChannelSink<T, F>
where
    T: Send,
    F: FnMut(PumpFrame) -> Option<T> + Send,
{
    async fn send_frame(&mut self, frame: PumpFrame) -> Result<(), SinkClosed> {
        match (self.map)(frame) {
            Some(message) => self.tx.send(message).await.map_err(|_| SinkClosed),
            None => Ok(()),
        }
    }
}

/// Creates and registers a session for `target`.
pub(crate) fn open_session(
    state: &AppState,
    mode: SessionMode,
    target: &str,
) -> Result<(Arc<Session>, SessionGuard), ApiError> {
    let session = Arc::new(Session::new(mode, target, state.config.session.limits()));
    let guard = state.sessions.register(Arc::clone(&session))?;
    Ok((session, guard))
}

/// Records a finished session in the action log.
pub(crate) fn record_outcome(
    state: &AppState,
    session: &Session,
    command_line: &str,
    outcome: &SessionOutcome,
) {
    let failed = matches!(
        outcome.reason,
        CloseReason::ProcessExited | CloseReason::ReadFailed(_)
    ) && !outcome.exit.success();

    state.action_log.record(
        command_line,
        format!(
            "{} session {} closed: {} ({})",
            session.mode(),
            session.id(),
            outcome.reason,
            outcome.exit
        ),
        failed,
    );
}

/// Records a session whose process never started.
pub(crate) fn record_launch_failure(state: &AppState, command_line: &str, error: &str) {
    state
        .action_log
        .record(command_line, format!("Error: {error}\nOutput: "), true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_maps_and_filters() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = ChannelSink::new(tx, |frame| match frame {
            PumpFrame::Line(line) => Some(line.to_uppercase()),
            _ => None,
        });

        sink.send_frame(PumpFrame::Line("abc".to_string())).await.unwrap();
        sink.send_frame(PumpFrame::ReadError("x".to_string()))
            .await
            .unwrap();
        drop(sink);

        assert_eq!(rx.recv().await, Some("ABC".to_string()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx, |frame| match frame {
            PumpFrame::Line(line) => Some(line),
            _ => None,
        });

        let result = sink.send_frame(PumpFrame::Line("x".to_string())).await;
        assert_eq!(result, Err(SinkClosed));
    }
}
