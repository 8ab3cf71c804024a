//! Decoder for line-oriented completion streams.
//!
//! The server sends newline-delimited events. Each line is either blank or
//! `data: <payload>`, where the payload is a JSON chunk or the literal
//! `[DONE]` terminator. The decoder is fed one line at a time and keeps no
//! line buffer of its own.

use serde_json::Value;
use tracing::debug;

use super::extract::{extract_content, first_choice, STREAM_RULES};

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

/// What one line of the stream amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A non-empty content fragment, in arrival order.
    Delta(String),
    /// Nothing to emit: blank, not a data line, malformed, or no content.
    Skip,
    /// The stream terminated normally (`[DONE]`).
    Done,
}

/// Per-stream decoding state.
///
/// A fresh decoder is used for each stream; once `[DONE]` is seen every
/// further line is skipped.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    finished: bool,
    deltas: usize,
    malformed: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one raw line.
    pub fn decode_line(&mut self, line: &str) -> LineEvent {
        if self.finished {
            return LineEvent::Skip;
        }

        let line = line.trim();
        if line.is_empty() {
            return LineEvent::Skip;
        }

        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return LineEvent::Skip;
        };
        let payload = payload.trim();

        if payload == DONE_MARKER {
            self.finished = true;
            return LineEvent::Done;
        }

        let chunk: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                self.malformed += 1;
                debug!(error = %e, payload, "skipping malformed stream payload");
                return LineEvent::Skip;
            }
        };

        match first_choice(&chunk).and_then(|c| extract_content(c, STREAM_RULES)) {
            Some(text) => {
                self.deltas += 1;
                LineEvent::Delta(text.to_string())
            }
            None => LineEvent::Skip,
        }
    }

    /// Whether the `[DONE]` marker has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of deltas emitted so far.
    pub fn delta_count(&self) -> usize {
        self.deltas
    }

    /// Number of data lines dropped because their payload was not JSON.
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }
}

/// Decode a complete sequence of lines, returning the deltas in order.
pub fn decode_lines<'a, I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut decoder = StreamDecoder::new();
    let mut deltas = Vec::new();
    for line in lines {
        match decoder.decode_line(line) {
            LineEvent::Delta(d) => deltas.push(d),
            LineEvent::Skip => {}
            LineEvent::Done => break,
        }
    }
    deltas
}
