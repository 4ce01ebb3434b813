//! Line and event-stream framing.
//!
//! Process output arrives as arbitrary byte chunks. The exec and log-follow
//! streams forward it one line at a time, so [`LineSplitter`] turns a chunk
//! stream into complete lines without waiting for the process to exit.
//! [`SseEvent`] and [`SseDecoder`] cover the `text/event-stream` wire format
//! used by log follows.

/// Maximum size of a text frame that is still considered as a control message.
pub const MAX_CONTROL_FRAME: usize = 4 * 1024;

/// Default longest line emitted as a single frame (64 KiB).
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Incremental splitter from byte chunks to text lines.
///
/// Lines are terminated by `\n`; a trailing `\r` is stripped. Invalid UTF-8
/// is replaced rather than rejected. Lines longer than `max_line` bytes are
/// emitted in `max_line` sized pieces so a runaway producer cannot grow the
/// buffer without bound.
#[derive(Debug, Clone)]
pub struct LineSplitter {
    buf: Vec<u8>,
    max_line: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl LineSplitter {
    /// Creates a splitter with the given maximum line length.
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line: max_line.max(1),
        }
    }

    /// Returns the number of buffered bytes belonging to an unfinished line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feeds a chunk and returns every line it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            split_line(&self.buf[start..end], self.max_line, &mut lines);
            start = end + 1;
        }
        self.buf.drain(..start);

        while self.buf.len() > self.max_line {
            let cut = char_boundary(&self.buf, self.max_line);
            let piece: Vec<u8> = self.buf.drain(..cut).collect();
            lines.push(String::from_utf8_lossy(&piece).into_owned());
        }

        lines
    }

    /// Flushes the unterminated remainder at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(strip_cr(&rest)).into_owned())
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn split_line(line: &[u8], max_line: usize, out: &mut Vec<String>) {
    let line = strip_cr(line);
    if line.is_empty() {
        out.push(String::new());
        return;
    }
    let mut rest = line;
    while !rest.is_empty() {
        let cut = if rest.len() > max_line {
            char_boundary(rest, max_line)
        } else {
            rest.len()
        };
        out.push(String::from_utf8_lossy(&rest[..cut]).into_owned());
        rest = &rest[cut..];
    }
}

/// Largest cut at or below `max` that does not split a UTF-8 sequence.
///
/// Falls back to `max` when no boundary is found within the last three
/// bytes, which only happens for invalid input or a tiny `max`.
fn char_boundary(bytes: &[u8], max: usize) -> usize {
    let is_continuation = |b: u8| b & 0b1100_0000 == 0b1000_0000;
    (max.saturating_sub(3)..=max)
        .rev()
        .take_while(|&i| i > 0)
        .find(|&i| !is_continuation(bytes[i]))
        .unwrap_or(max)
}

/// A single server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// Event name; `None` is the default `message` event.
    pub event: Option<String>,
    /// Event payload. Multi-line data is carried as multiple `data:` fields.
    pub data: String,
}

impl SseEvent {
    /// Creates an unnamed data event.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// Creates an `error` event.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: Some("error".to_string()),
            data: message.into(),
        }
    }

    /// Returns true for `error` events.
    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }

    /// Renders the event in `text/event-stream` format.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 16);
        if let Some(name) = &self.event {
            out.push_str("event: ");
            out.push_str(name);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line.strip_suffix('\r').unwrap_or(line));
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Incremental `text/event-stream` parser, for clients and tests.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineSplitter,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Creates a new decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of the stream and returns every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            if let Some(event) = self.feed_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            return Some(SseEvent {
                event: self.event.take(),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}
