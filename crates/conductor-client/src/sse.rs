//! Server-sent events framing for the run log stream.
//!
//! `SseParser` turns `text/event-stream` text into frames; `sse_events` adapts
//! a chunked byte stream (as returned by `reqwest::Response::bytes_stream`)
//! into a stream of frames, carrying partial lines and split UTF-8 sequences
//! across chunk boundaries.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::{Stream, StreamExt};

use crate::ConductorClientError;

pub const DEFAULT_EVENT_NAME: &str = "message";

/// One dispatched event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    #[must_use]
    pub fn message(data: impl Into<String>) -> Self {
        Self::named(DEFAULT_EVENT_NAME, data)
    }

    #[must_use]
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }
}

#[derive(Debug, Default)]
struct PartialEvent {
    event: Option<String>,
    data: String,
    has_data: bool,
    id: Option<String>,
    retry: Option<u64>,
}

impl PartialEvent {
    fn is_pending(&self) -> bool {
        self.has_data || self.event.is_some()
    }

    fn take(&mut self) -> SseEvent {
        let mut partial = std::mem::take(self);
        if partial.data.ends_with('\n') {
            partial.data.pop();
        }
        SseEvent {
            event: partial
                .event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            data: partial.data,
            id: partial.id,
            retry: partial.retry,
        }
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current: PartialEvent,
    bom_checked: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed decoded text; returns every frame completed by a blank line.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let chunk = if self.bom_checked || chunk.is_empty() {
            chunk
        } else {
            self.bom_checked = true;
            chunk.strip_prefix('\u{feff}').unwrap_or(chunk)
        };
        self.buffer.push_str(chunk);

        let buffer = std::mem::take(&mut self.buffer);
        let bytes = buffer.as_bytes();
        let mut events = Vec::new();
        let mut start = 0usize;
        let mut index = 0usize;

        while index < bytes.len() {
            let next = match bytes[index] {
                b'\n' => index + 1,
                b'\r' => {
                    // A trailing CR may be the first half of CRLF.
                    if index + 1 == bytes.len() {
                        break;
                    }
                    if bytes[index + 1] == b'\n' {
                        index + 2
                    } else {
                        index + 1
                    }
                }
                _ => {
                    index += 1;
                    continue;
                }
            };
            self.process_line(&buffer[start..index], &mut events);
            start = next;
            index = next;
        }

        self.buffer = buffer[start..].to_string();
        events
    }

    /// Dispatch whatever is left once the underlying stream has ended.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            let mut dispatched = Vec::new();
            self.process_line(line.trim_end_matches('\r'), &mut dispatched);
            if let Some(event) = dispatched.pop() {
                return Some(event);
            }
        }
        if self.current.is_pending() {
            return Some(self.current.take());
        }
        None
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty() || self.current.is_pending()
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            // Named events without data still dispatch so bare lifecycle events are seen.
            if self.current.is_pending() {
                events.push(self.current.take());
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                self.current.data.push_str(value);
                self.current.data.push('\n');
                self.current.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.current.id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(retry) = value.parse::<u64>() {
                    self.current.retry = Some(retry);
                }
            }
            _ => {}
        }
    }
}

struct SseDecoder<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    utf8_tail: Vec<u8>,
    finished: bool,
}

impl<S> SseDecoder<S> {
    fn push_bytes(&mut self, bytes: &[u8]) {
        self.utf8_tail.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.utf8_tail) {
            Ok(text) => text.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(err) => {
                tracing::warn!(error = %err, "invalid utf-8 in event stream, decoding lossily");
                self.utf8_tail.len()
            }
        };
        let tail = self.utf8_tail.split_off(valid);
        let head = std::mem::replace(&mut self.utf8_tail, tail);
        let text = String::from_utf8_lossy(&head);
        self.pending.extend(self.parser.feed(&text));
    }

    fn finish(&mut self) {
        self.finished = true;
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            let text = String::from_utf8_lossy(&tail);
            self.pending.extend(self.parser.feed(&text));
        }
        if let Some(event) = self.parser.flush() {
            self.pending.push_back(event);
        }
    }
}

/// Adapt a chunked byte stream into event-stream frames.
///
/// A transport error ends the stream after yielding a single `Read` error.
pub fn sse_events<S, B, E>(
    bytes: S,
) -> impl Stream<Item = Result<SseEvent, ConductorClientError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let decoder = SseDecoder {
        inner: bytes,
        parser: SseParser::new(),
        pending: VecDeque::new(),
        utf8_tail: Vec::new(),
        finished: false,
    };

    futures::stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(event) = decoder.pending.pop_front() {
                return Some((Ok(event), decoder));
            }
            if decoder.finished {
                return None;
            }
            match decoder.inner.next().await {
                Some(Ok(chunk)) => decoder.push_bytes(chunk.as_ref()),
                Some(Err(error)) => {
                    decoder.finished = true;
                    decoder.pending.clear();
                    return Some((
                        Err(ConductorClientError::Read {
                            message: error.to_string(),
                        }),
                        decoder,
                    ));
                }
                None => decoder.finish(),
            }
        }
    })
}
