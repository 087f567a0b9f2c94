use axum::response::sse::Event;
use serde_json::Value;

/// One logical server-sent-events frame: an optional `event:` name and the
/// concatenated `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// An outbound frame carrying a named event with a compact JSON payload.
    pub fn named(name: &str, payload: &Value) -> Self {
        Self {
            event: Some(name.to_string()),
            data: payload.to_string(),
        }
    }

    /// An outbound data-only frame (no `event:` line).
    pub fn data_only(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// Render as an axum SSE event. Axum writes each event in one chunk and
    /// flushes it, so small frames are never batched behind a buffer.
    pub fn into_sse(self) -> Event {
        let event = Event::default().data(self.data);
        match self.event {
            Some(name) => event.event(name),
            None => event,
        }
    }

    /// The `[DONE]` sentinel some upstreams use to close a stream.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Parse the payload as JSON. Malformed payloads are non-fatal: the
    /// frame is skipped by callers and a debug note recorded here.
    pub fn json(&self) -> Option<Value> {
        match serde_json::from_str(&self.data) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!("skipping malformed SSE payload: {err}");
                None
            }
        }
    }
}

/// Incremental SSE decoder. Bytes go in chunk by chunk; complete frames come
/// out. An incomplete trailing line is carried across `push` calls, so chunk
/// boundaries may fall anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseParser {
    tail: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        let mut start = 0;
        self.tail.extend_from_slice(chunk);
        // Process complete lines; everything after the last LF stays buffered.
        while let Some(pos) = self.tail[start..].iter().position(|b| *b == b'\n') {
            let line_end = start + pos;
            let line = String::from_utf8_lossy(&self.tail[start..line_end]).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(frame) = self.take_line(line) {
                frames.push(frame);
            }
            start = line_end + 1;
        }
        self.tail.drain(..start);
        frames
    }

    /// Flush any frame left pending at end of stream (a final frame that was
    /// never followed by a blank line).
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.tail.is_empty() {
            let tail = std::mem::take(&mut self.tail);
            let line = String::from_utf8_lossy(&tail).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            if let Some(frame) = self.take_line(&line) {
                return Some(frame);
            }
        }
        self.flush()
    }

    fn take_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.flush();
        }
        if let Some(payload) = line.strip_prefix("data:") {
            self.data_lines.push(payload.trim_start().to_string());
        } else if let Some(name) = line.strip_prefix("event:") {
            self.event = Some(name.trim_start().to_string());
        }
        // Comments (`:keepalive`) and unknown fields are ignored.
        None
    }

    fn flush(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() {
            self.event = None;
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        };
        self.data_lines.clear();
        Some(frame)
    }
}
