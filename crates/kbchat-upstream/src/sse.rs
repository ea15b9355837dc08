//! Generic SSE (Server-Sent Events) line parser.
//!
//! Converts an HTTP response body (or any byte-chunk stream) into a
//! `Stream<Item = SseEvent>`. Bytes are buffered until a full line is
//! available, so chunk boundaries may fall anywhere, including inside a
//! multi-byte UTF-8 sequence.

use std::pin::Pin;

use futures::Stream;
use tokio_stream::StreamExt;

use crate::error::UpstreamError;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, UpstreamError>> + Send {
    decode_sse(response.bytes_stream())
}

/// Parse an arbitrary byte-chunk stream as SSE.
///
/// The first error from the underlying stream is yielded once and ends the
/// sequence.
pub fn decode_sse<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, UpstreamError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
            finished: false,
        },
        |mut state| async move {
            loop {
                // Try to extract a line from the buffer
                if let Some(newline_pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..newline_pos]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    state.apply_line(line);
                    continue;
                }

                if state.finished {
                    return None;
                }

                // Need more data from the stream
                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.extend_from_slice(chunk.as_ref());
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state.buffer.clear();
                        state.current_data.clear();
                        return Some((Err(UpstreamError::Stream(e.to_string())), state));
                    }
                    None => {
                        // Stream ended. Treat an unterminated last line as complete,
                        // then dispatch any remaining data.
                        state.finished = true;
                        if !state.buffer.is_empty() {
                            let raw = std::mem::take(&mut state.buffer);
                            let line = String::from_utf8_lossy(&raw);
                            state.apply_line(line.trim_end_matches('\r'));
                        }
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

struct SseState<S> {
    byte_stream: Pin<Box<S>>,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    finished: bool,
}

impl<S> SseState<S> {
    fn apply_line(&mut self, line: &str) {
        if line.is_empty() || line.starts_with(':') {
            // Comment, skip
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.current_event = Some(value.to_string()),
            "data" => self.current_data.push(value.to_string()),
            "id" => self.current_id = Some(value.to_string()),
            // Ignore retry and unknown fields
            _ => {}
        }
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}
