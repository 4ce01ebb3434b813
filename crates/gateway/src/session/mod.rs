//! Streaming sessions.
//!
//! A [`Session`] owns exactly one external process and the pumps that move
//! its bytes to and from a client. Its lifecycle is
//! `Starting -> Running -> Closing -> Closed`; whichever happens first of
//! process exit, client disconnect, explicit cancel or the optional maximum
//! duration moves it to `Closing`, and later triggers are no-ops.
//!
//! Pumps come in two roles. Outbound pumps read from the process. When the
//! process ends on its own they drain everything it wrote, at whatever pace
//! the client reads; they are aborted only when the client is gone or the
//! session is cancelled. Inbound pumps read from the client and stop as soon
//! as the session is closing.

pub mod launcher;
pub mod pump;
pub mod registry;

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use protocol::{ProcessExit, SessionMode, SessionState, SessionSummary};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use launcher::{
    Dimensions, LaunchError, LaunchErrorKind, LaunchSpec, ProcessHandle, ProcessIo, PtyInput,
    PtyOutput,
};
pub use pump::{
    pump, ChunkSource, FrameSink, Framing, PumpControl, PumpFrame, PumpOutcome, ReaderSource,
    SinkClosed,
};
pub use registry::{SessionGuard, SessionRegistry};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has already been launched.
    #[error("session already launched: {0}")]
    AlreadyLaunched(SessionId),

    /// The process could not be started.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Failed to resize the terminal.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Too many concurrent sessions.
    #[error("session limit reached ({0} active)")]
    LimitReached(usize),
}

/// Why a session left `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The process exited or closed its output.
    ProcessExited,
    /// The client disconnected.
    ClientGone,
    /// Explicitly cancelled.
    Cancelled,
    /// The configured maximum session duration elapsed.
    MaxDuration,
    /// The gateway is shutting down.
    Shutdown,
    /// Reading process output failed.
    ReadFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ProcessExited => f.write_str("process exited"),
            CloseReason::ClientGone => f.write_str("client disconnected"),
            CloseReason::Cancelled => f.write_str("session cancelled"),
            CloseReason::MaxDuration => f.write_str("maximum session duration reached"),
            CloseReason::Shutdown => f.write_str("gateway shutting down"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {e}"),
        }
    }
}

/// Timing and sizing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Time between the polite and the forced kill signal.
    pub terminate_grace: Duration,
    /// How long a draining outbound pump waits for more output before it
    /// gives up on a pipe still held open by a background child.
    pub drain_timeout: Duration,
    /// Optional hard cap on session lifetime.
    pub max_duration: Option<Duration>,
    /// Read buffer size for raw output.
    pub read_buffer_size: usize,
    /// Longest line forwarded as a single frame.
    pub max_line: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            terminate_grace: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(2),
            max_duration: None,
            read_buffer_size: launcher::DEFAULT_READ_BUFFER_SIZE,
            max_line: protocol::DEFAULT_MAX_LINE,
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// What moved the session to `Closing`.
    pub reason: CloseReason,
    /// How the process ended.
    pub exit: ProcessExit,
    /// How each pump ended, in completion order.
    pub pumps: Vec<PumpOutcome>,
}

/// Pumps belonging to one session.
#[derive(Default)]
pub struct PumpSet {
    outbound: Vec<JoinHandle<PumpOutcome>>,
    inbound: Option<JoinHandle<PumpOutcome>>,
}

impl PumpSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a pump that reads from the process.
    pub fn spawn_outbound<F>(&mut self, pump: F)
    where
        F: Future<Output = PumpOutcome> + Send + 'static,
    {
        self.outbound.push(tokio::spawn(pump));
    }

    /// Spawns the pump that reads from the client.
    pub fn spawn_inbound<F>(&mut self, pump: F)
    where
        F: Future<Output = PumpOutcome> + Send + 'static,
    {
        self.inbound = Some(tokio::spawn(pump));
    }
}

/// A streaming session bound to one external process.
pub struct Session {
    id: SessionId,
    mode: SessionMode,
    target: String,
    started_at: DateTime<Utc>,
    limits: SessionLimits,
    state_tx: watch::Sender<SessionState>,
    /// Cancelled when `Closing` begins; inbound pumps stop on it.
    closing: CancellationToken,
    /// Cancelled when outbound pumps must stop at once.
    abort: CancellationToken,
    /// Cancelled once the process has exited and outbound pumps are draining.
    draining: CancellationToken,
    requested: Mutex<Option<CloseReason>>,
    reason: Mutex<Option<CloseReason>>,
    process: OnceLock<ProcessHandle>,
    dimensions: Mutex<Option<Dimensions>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Creates a session in `Starting`.
    pub fn new(mode: SessionMode, target: impl Into<String>, limits: SessionLimits) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Starting);
        let closing = CancellationToken::new();

        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            target: target.into(),
            started_at: Utc::now(),
            limits,
            state_tx,
            closing,
            abort: CancellationToken::new(),
            draining: CancellationToken::new(),
            requested: Mutex::new(None),
            reason: Mutex::new(None),
            process: OnceLock::new(),
            dimensions: Mutex::new(None),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the operating mode.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Returns the target identifier.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns when the session was created.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the session limits.
    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribes to lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Waits until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Token cancelled when the session starts closing.
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Stop conditions for a pump reading from the process.
    pub fn outbound_control(&self) -> PumpControl {
        PumpControl::new(self.abort.clone())
            .drain_when(self.draining.clone(), self.limits.drain_timeout)
    }

    /// Returns the process handle once launched.
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.get()
    }

    /// Returns the last applied terminal size.
    pub fn dimensions(&self) -> Option<Dimensions> {
        self.dimensions.lock().ok().and_then(|dims| *dims)
    }

    /// Returns what moved the session to `Closing`, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.lock().ok().and_then(|reason| reason.clone())
    }

    /// Returns a listing snapshot.
    pub fn summary(&self) -> SessionSummary {
        let dims = self.dimensions();
        SessionSummary {
            id: self.id.clone(),
            mode: self.mode,
            state: self.state(),
            target: self.target.clone(),
            pid: self.process().and_then(ProcessHandle::pid),
            rows: dims.map(|d| d.rows),
            cols: dims.map(|d| d.cols),
            started_at: self.started_at,
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Starts the process and moves to `Running`.
    ///
    /// `pty` selects an interactive launch. On failure the session goes
    /// through `Closing` to `Closed` without ever being `Running`, and the
    /// error is returned for the transport to report.
    pub fn launch(
        &self,
        spec: &LaunchSpec,
        pty: Option<Dimensions>,
    ) -> Result<ProcessIo, SessionError> {
        if self.state() != SessionState::Starting {
            return Err(SessionError::AlreadyLaunched(self.id.clone()));
        }

        let mut handle = match launcher::launch(spec, pty, self.limits.read_buffer_size) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.id,
                    mode = %self.mode,
                    error = %e,
                    "Failed to launch session process"
                );
                self.fail_launch();
                return Err(e.into());
            }
        };

        let Some(io) = handle.take_io() else {
            self.fail_launch();
            return Err(SessionError::AlreadyLaunched(self.id.clone()));
        };
        let pid = handle.pid();

        if self.process.set(handle).is_err() {
            return Err(SessionError::AlreadyLaunched(self.id.clone()));
        }
        if let Ok(mut dims) = self.dimensions.lock() {
            *dims = pty;
        }
        self.transition(SessionState::Starting, SessionState::Running);

        tracing::info!(
            session_id = %self.id,
            mode = %self.mode,
            target = %self.target,
            pid = ?pid,
            command = %spec.command_line(),
            "Session running"
        );

        Ok(io)
    }

    fn fail_launch(&self) {
        if let Ok(mut reason) = self.reason.lock() {
            *reason = Some(CloseReason::ProcessExited);
        }
        self.transition(SessionState::Starting, SessionState::Closing);
        self.closing.cancel();
        self.transition(SessionState::Closing, SessionState::Closed);
    }

    /// Requests the session to close. Idempotent.
    pub fn cancel(&self) {
        self.cancel_with(CloseReason::Cancelled);
    }

    /// Requests the session to close with a specific reason. Only the first
    /// request's reason is kept.
    pub fn cancel_with(&self, reason: CloseReason) {
        if let Ok(mut requested) = self.requested.lock() {
            if requested.is_none() {
                tracing::debug!(session_id = %self.id, reason = %reason, "Session cancel requested");
                *requested = Some(reason);
            }
        }
        self.closing.cancel();
        self.abort.cancel();
    }

    /// Resizes the terminal.
    ///
    /// Applied only while `Running`; returns `Ok(false)` when ignored because
    /// of the state or because the session is not pty-backed.
    pub fn resize(&self, dims: Dimensions) -> Result<bool, SessionError> {
        if self.state() != SessionState::Running {
            return Ok(false);
        }
        let Some(process) = self.process() else {
            return Ok(false);
        };

        let mut current = self
            .dimensions
            .lock()
            .map_err(|_| SessionError::ResizeFailed("dimensions lock poisoned".to_string()))?;
        let applied = process
            .resize(dims)
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        if applied {
            *current = Some(dims);
            tracing::debug!(
                session_id = %self.id,
                rows = dims.rows,
                cols = dims.cols,
                "Resized PTY"
            );
        }
        Ok(applied)
    }

    fn begin_closing(&self, reason: CloseReason) -> bool {
        if !self.transition(SessionState::Running, SessionState::Closing) {
            return false;
        }
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason.clone());
        }
        self.closing.cancel();
        tracing::info!(session_id = %self.id, reason = %reason, "Session closing");
        true
    }

    fn requested_reason(&self) -> CloseReason {
        self.requested
            .lock()
            .ok()
            .and_then(|requested| requested.clone())
            .unwrap_or(CloseReason::Cancelled)
    }

    /// Supervises a running session until it is `Closed`.
    ///
    /// `client_gone` resolves when the transport notices its client left
    /// without a pump having seen it yet. The session closes exactly once;
    /// every path terminates and reaps the process and releases the
    /// terminal before `Closed` is published.
    pub async fn drive<G>(&self, pumps: PumpSet, client_gone: G) -> SessionOutcome
    where
        G: Future<Output = ()> + Send,
    {
        let PumpSet { outbound, inbound } = pumps;
        let mut outbound: FuturesUnordered<_> = outbound.into_iter().collect();
        let mut inbound = inbound;
        let mut outcomes = Vec::new();

        let Some(process) = self.process() else {
            self.fail_launch();
            return SessionOutcome {
                reason: CloseReason::ProcessExited,
                exit: ProcessExit::Unknown,
                pumps: outcomes,
            };
        };

        tokio::pin!(client_gone);
        let deadline = self.limits.max_duration.map(|d| tokio::time::Instant::now() + d);
        let expired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let reason = loop {
            tokio::select! {
                Some(joined) = outbound.next() => {
                    let outcome = pump_result(joined);
                    let reason = match &outcome {
                        PumpOutcome::SinkClosed => Some(CloseReason::ClientGone),
                        PumpOutcome::ReadFailed(e) => Some(CloseReason::ReadFailed(e.clone())),
                        PumpOutcome::Cancelled => Some(self.requested_reason()),
                        PumpOutcome::Eof => None,
                    };
                    outcomes.push(outcome);
                    if let Some(reason) = reason {
                        break reason;
                    }
                    if outbound.is_empty() {
                        break CloseReason::ProcessExited;
                    }
                }
                joined = join_inbound(&mut inbound), if inbound.is_some() => {
                    inbound = None;
                    let outcome = pump_result(joined);
                    let reason = match &outcome {
                        PumpOutcome::SinkClosed => CloseReason::ProcessExited,
                        PumpOutcome::Cancelled => self.requested_reason(),
                        PumpOutcome::Eof | PumpOutcome::ReadFailed(_) => CloseReason::ClientGone,
                    };
                    outcomes.push(outcome);
                    break reason;
                }
                _ = process.wait() => break CloseReason::ProcessExited,
                _ = &mut client_gone => break CloseReason::ClientGone,
                _ = self.closing.cancelled() => break self.requested_reason(),
                _ = &mut expired => break CloseReason::MaxDuration,
            }
        };

        self.begin_closing(reason.clone());
        let reason = self.close_reason().unwrap_or(reason);

        // Only a process finishing on its own gets to flush its output.
        let natural = matches!(
            reason,
            CloseReason::ProcessExited | CloseReason::ReadFailed(_)
        );
        if !natural {
            self.abort.cancel();
        }

        let exit = if natural {
            // Give it the chance to report its real status before signalling it.
            match tokio::time::timeout(self.limits.terminate_grace, process.wait()).await {
                Ok(exit) => exit,
                Err(_) => process.terminate(self.limits.terminate_grace).await,
            }
        } else {
            process.terminate(self.limits.terminate_grace).await
        };

        // Everything the process wrote is buffered now; deliver it all unless
        // the client leaves or the deadline passes meanwhile.
        self.draining.cancel();
        let mut gone = reason == CloseReason::ClientGone;
        let mut timed_out = reason == CloseReason::MaxDuration;
        loop {
            tokio::select! {
                joined = outbound.next() => match joined {
                    Some(joined) => outcomes.push(pump_result(joined)),
                    None => break,
                },
                _ = &mut client_gone, if !gone => {
                    gone = true;
                    tracing::debug!(session_id = %self.id, "Client left while draining");
                    self.abort.cancel();
                }
                _ = &mut expired, if !timed_out => {
                    timed_out = true;
                    self.abort.cancel();
                }
            }
        }
        if let Some(handle) = inbound.take() {
            outcomes.push(pump_result(handle.await));
        }

        process.release();
        self.transition(SessionState::Closing, SessionState::Closed);

        tracing::info!(
            session_id = %self.id,
            mode = %self.mode,
            reason = %reason,
            exit = %exit,
            "Session closed"
        );

        SessionOutcome {
            reason,
            exit,
            pumps: outcomes,
        }
    }
}

async fn join_inbound(
    inbound: &mut Option<JoinHandle<PumpOutcome>>,
) -> Result<PumpOutcome, tokio::task::JoinError> {
    match inbound {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn pump_result(joined: Result<PumpOutcome, tokio::task::JoinError>) -> PumpOutcome {
    joined.unwrap_or_else(|e| PumpOutcome::ReadFailed(format!("pump task failed: {e}")))
}
