//! Unidirectional stream pumps.
//!
//! A pump copies from a [`ChunkSource`] to a [`FrameSink`] until the source
//! ends, the sink goes away, or the session cancels it. Only one frame is in
//! flight at a time: the next read starts after the previous frame has been
//! accepted by the sink, so a slow client slows the pump down instead of
//! growing a queue.
//!
//! Outbound pumps are stopped by a [`PumpControl`]: either hard, by its
//! abort token, or softly once the session is draining, when the source has
//! been silent for the idle limit. A frame already being delivered is never
//! cut short by the soft stop.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use protocol::LineSplitter;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::launcher::{PtyInput, PtyOutput};

/// A source of byte chunks. `Ok(None)` means end of stream.
pub trait ChunkSource: Send {
    /// Reads the next chunk. Must be cancel safe.
    fn next_chunk(&mut self) -> impl Future<Output = std::io::Result<Option<Bytes>>> + Send;
}

/// The sink went away; the client is gone.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("sink closed")]
pub struct SinkClosed;

/// A destination for pump frames.
pub trait FrameSink: Send {
    /// Delivers one frame, completing once the sink has accepted it.
    fn send_frame(&mut self, frame: PumpFrame)
        -> impl Future<Output = Result<(), SinkClosed>> + Send;
}

/// One unit of pumped output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpFrame {
    /// Raw bytes, as read.
    Chunk(Bytes),
    /// One complete line, terminator stripped.
    Line(String),
    /// The source failed; always the last frame a pump sends.
    ReadError(String),
}

/// How source bytes are cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Forward chunks as they are read.
    Raw,
    /// Forward one frame per line.
    Lines {
        /// Longest line emitted as a single frame.
        max_line: usize,
    },
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source reached end of stream and everything was delivered.
    Eof,
    /// The sink refused a frame.
    SinkClosed,
    /// The source failed with an error other than end of stream.
    ReadFailed(String),
    /// The pump was cancelled by its session.
    Cancelled,
}

/// Stop conditions for a pump.
#[derive(Debug, Clone, Default)]
pub struct PumpControl {
    abort: CancellationToken,
    drain: Option<(CancellationToken, Duration)>,
}

impl PumpControl {
    /// Stops the pump only when `abort` is cancelled.
    pub fn new(abort: CancellationToken) -> Self {
        Self { abort, drain: None }
    }

    /// Once `draining` is cancelled, also stops the pump when its source
    /// produces nothing for `idle`.
    pub fn drain_when(mut self, draining: CancellationToken, idle: Duration) -> Self {
        self.drain = Some((draining, idle));
        self
    }

    async fn idle(&self) {
        match &self.drain {
            Some((draining, idle)) => {
                draining.cancelled().await;
                tokio::time::sleep(*idle).await;
            }
            None => std::future::pending().await,
        }
    }
}

impl From<CancellationToken> for PumpControl {
    fn from(abort: CancellationToken) -> Self {
        Self::new(abort)
    }
}

impl PumpOutcome {
    /// Returns true when the pump stopped because the client went away.
    pub fn is_client_gone(&self) -> bool {
        matches!(self, PumpOutcome::SinkClosed)
    }
}

/// Adapts any async reader into a chunk source.
pub struct ReaderSource<R> {
    reader: R,
    buffer_size: usize,
}

impl<R> ReaderSource<R> {
    /// Wraps `reader`, reading at most `buffer_size` bytes per chunk.
    pub fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            buffer_size: buffer_size.max(1),
        }
    }
}

impl<R> ChunkSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            match self.reader.read(&mut buffer).await {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buffer.truncate(n);
                    return Ok(Some(Bytes::from(buffer)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl ChunkSource for PtyOutput {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        self.recv().await.transpose()
    }
}

impl FrameSink for PtyInput {
    async fn send_frame(&mut self, frame: PumpFrame) -> Result<(), SinkClosed> {
        let data = match frame {
            PumpFrame::Chunk(data) => data,
            PumpFrame::Line(line) => Bytes::from(line),
            PumpFrame::ReadError(_) => return Ok(()),
        };
        self.write_all(data).await.map_err(|e| {
            tracing::debug!(error = %e, "Terminal input closed");
            SinkClosed
        })
    }
}

impl FrameSink for mpsc::Sender<PumpFrame> {
    async fn send_frame(&mut self, frame: PumpFrame) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, frame).await.map_err(|_| SinkClosed)
    }
}

/// Runs a pump to completion.
pub async fn pump<S, K>(
    mut source: S,
    mut sink: K,
    framing: Framing,
    control: impl Into<PumpControl>,
) -> PumpOutcome
where
    S: ChunkSource,
    K: FrameSink,
{
    let control = control.into();
    let cancel = &control.abort;
    let mut splitter = match framing {
        Framing::Raw => None,
        Framing::Lines { max_line } => Some(LineSplitter::new(max_line)),
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            next = source.next_chunk() => next,
            _ = control.idle() => {
                tracing::debug!("Pump source idle while draining, stopping");
                return PumpOutcome::Cancelled;
            }
        };

        match next {
            Ok(Some(chunk)) => {
                let frames = match splitter.as_mut() {
                    Some(splitter) => splitter
                        .push(&chunk)
                        .into_iter()
                        .map(PumpFrame::Line)
                        .collect(),
                    None => vec![PumpFrame::Chunk(chunk)],
                };
                for frame in frames {
                    if let Some(outcome) = deliver(&mut sink, frame, cancel).await {
                        return outcome;
                    }
                }
            }
            Ok(None) => {
                if let Some(rest) = splitter.as_mut().and_then(LineSplitter::finish) {
                    if let Some(outcome) = deliver(&mut sink, PumpFrame::Line(rest), cancel).await
                    {
                        return outcome;
                    }
                }
                return PumpOutcome::Eof;
            }
            Err(e) => {
                let message = e.to_string();
                tracing::debug!(error = %message, "Pump source failed");
                if let Some(rest) = splitter.as_mut().and_then(LineSplitter::finish) {
                    if let Some(outcome) = deliver(&mut sink, PumpFrame::Line(rest), cancel).await
                    {
                        return outcome;
                    }
                }
                // Best effort: the sink may already be gone.
                let _ = deliver(&mut sink, PumpFrame::ReadError(message.clone()), cancel).await;
                return PumpOutcome::ReadFailed(message);
            }
        }
    }
}

async fn deliver<K: FrameSink>(
    sink: &mut K,
    frame: PumpFrame,
    cancel: &CancellationToken,
) -> Option<PumpOutcome> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Some(PumpOutcome::Cancelled),
        sent = sink.send_frame(frame) => match sent {
            Ok(()) => None,
            Err(SinkClosed) => Some(PumpOutcome::SinkClosed),
        },
    }
}
