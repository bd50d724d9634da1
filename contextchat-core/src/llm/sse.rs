//! Server-sent event decoding for streamed completions.
//!
//! Providers stream replies as `data:` events. [`SseDecoder`] turns raw body
//! bytes into event payloads; [`text_stream`] drives a body stream through
//! the decoder and a provider-specific payload parser.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};

use crate::error::{Error, Result};

use super::types::ChunkStream;

/// What a provider payload means for the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Reply text delta
    Text(String),
    /// End-of-reply marker
    Done,
    /// Keep-alive, metadata, or other events with no text
    Ignore,
}

/// Incremental decoder for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed body bytes; returns payloads of every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            self.process_line(line, &mut events);
        }

        events
    }

    /// Flush a final event not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            let mut events = Vec::new();
            self.process_line(&line, &mut events);
            if let Some(event) = events.pop() {
                return Some(event);
            }
        }
        if self.data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data).join("\n"))
        }
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(std::mem::take(&mut self.data).join("\n"));
            }
            return;
        }
        // Comment lines start with ':'
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // `event:`, `id:` and `retry:` fields carry nothing the parsers need.
    }
}

/// Turn a response body into a stream of text chunks.
///
/// Transport and parse errors end the stream with a single
/// `StreamInterrupted` item after any text decoded before them.
pub fn text_stream<S, B, E, F>(body: S, parse: F) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnMut(&str) -> Result<SseEvent> + Send + 'static,
{
    struct State<S, F> {
        body: std::pin::Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<Result<String>>,
        finished: bool,
        parse: F,
    }

    impl<S, F> State<S, F>
    where
        F: FnMut(&str) -> Result<SseEvent>,
    {
        fn handle_payload(&mut self, payload: &str) {
            if self.finished {
                return;
            }
            match (self.parse)(payload) {
                Ok(SseEvent::Text(text)) if !text.is_empty() => self.pending.push_back(Ok(text)),
                Ok(SseEvent::Done) => self.finished = true,
                Ok(_) => {}
                Err(e) => {
                    self.pending
                        .push_back(Err(Error::StreamInterrupted(e.to_string())));
                    self.finished = true;
                }
            }
        }
    }

    let state = State {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
        parse,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for payload in state.decoder.push(bytes.as_ref()) {
                        state.handle_payload(&payload);
                    }
                }
                Some(Err(e)) => {
                    state
                        .pending
                        .push_back(Err(Error::StreamInterrupted(e.to_string())));
                    state.finished = true;
                }
                None => {
                    if let Some(payload) = state.decoder.finish() {
                        state.handle_payload(&payload);
                    }
                    state.finished = true;
                }
            }
        }
    }))
}
