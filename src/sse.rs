//! Server-Sent Events (SSE) parser.
//!
//! Implements the SSE protocol (text/event-stream) over a raw byte stream
//! for streaming LLM responses.

use futures::Stream;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (from "event:" field, defaults to "message").
    pub event: Cow<'static, str>,
    /// Event data (from "data:" field(s), joined with newlines).
    pub data: String,
    /// Last event ID (from "id:" field).
    pub id: Option<String>,
    /// Retry interval hint in milliseconds (from "retry:" field).
    pub retry: Option<u64>,
}

impl Default for SseEvent {
    fn default() -> Self {
        Self {
            event: Cow::Borrowed("message"),
            data: String::new(),
            id: None,
            retry: None,
        }
    }
}

/// Incremental parser state for an SSE byte stream.
///
/// Bytes are buffered until a complete line is available; splitting at
/// newline bytes keeps multi-byte UTF-8 sequences intact across chunk
/// boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
    has_data: bool,
    bom_checked: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern common event type names to avoid per-event allocation.
    fn intern_event_type(value: &str) -> Cow<'static, str> {
        match value {
            "message" => Cow::Borrowed("message"),
            "message_start" => Cow::Borrowed("message_start"),
            "message_delta" => Cow::Borrowed("message_delta"),
            "message_stop" => Cow::Borrowed("message_stop"),
            "content_block_start" => Cow::Borrowed("content_block_start"),
            "content_block_delta" => Cow::Borrowed("content_block_delta"),
            "content_block_stop" => Cow::Borrowed("content_block_stop"),
            "ping" => Cow::Borrowed("ping"),
            "error" => Cow::Borrowed("error"),
            other => Cow::Owned(other.to_string()),
        }
    }

    /// Feed a chunk of bytes, returning any events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        if !self.bom_checked {
            if self.buffer.len() < 3 {
                return Vec::new();
            }
            if self.buffer.starts_with(&[0xEF, 0xBB, 0xBF]) {
                self.buffer.drain(..3);
            }
            self.bom_checked = true;
        }

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let mut line = String::from_utf8_lossy(&line).into_owned();
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush any buffered event at end of stream.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest: Vec<u8> = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches(['\r', '\n'])) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comment line.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.current.event = Self::intern_event_type(value),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                // The spec forbids NUL in the id field.
                if !value.contains('\0') {
                    self.current.id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.current.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data && self.current.event == "message" && self.current.id.is_none() {
            return None;
        }
        self.has_data = false;
        Some(std::mem::take(&mut self.current))
    }
}

/// Stream adapter turning a byte stream into parsed SSE events.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::io::Result<Vec<u8>>> + Unpin,
{
    type Item = std::io::Result<SseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let events = self.parser.feed(&chunk);
                    self.pending.extend(events);
                }
                Poll::Ready(Some(Err(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if let Some(event) = self.parser.finish() {
                        self.pending.push_back(event);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn parses_simple_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message_start");
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn handles_chunks_split_mid_line() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: par").is_empty());
        let events = parser.feed(b"tial\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn handles_chunks_split_mid_utf8() {
        let mut parser = SseParser::new();
        let text = "data: caf\u{e9}\n\n".as_bytes();
        // Split inside the two-byte e-acute sequence.
        let split = text.len() - 3;
        assert!(parser.feed(&text[..split]).is_empty());
        let events = parser.feed(&text[split..]);
        assert_eq!(events[0].data, "caf\u{e9}");
    }

    #[test]
    fn strips_bom_and_crlf() {
        let mut parser = SseParser::new();
        let mut input = vec![0xEF, 0xBB, 0xBF];
        input.extend_from_slice(b"data: x\r\n\r\n");
        let events = parser.feed(&input);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn ignores_comments_and_unknown_fields() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keepalive\nunknown: y\ndata: z\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "z");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: tail").is_empty());
        let event = parser.finish().expect("trailing event");
        assert_eq!(event.data, "tail");
    }

    #[tokio::test]
    async fn stream_adapter_yields_events() {
        let chunks: Vec<std::io::Result<Vec<u8>>> = vec![
            Ok(b"data: one\n\nda".to_vec()),
            Ok(b"ta: two\n\n".to_vec()),
        ];
        let mut stream = SseStream::new(futures::stream::iter(chunks));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, "one");
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, "two");
        assert!(stream.next().await.is_none());
    }
}
