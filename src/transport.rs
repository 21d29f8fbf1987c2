// src/transport.rs
//
// Line framing for `text/event-stream` shaped completion bodies.

use log::debug;
use serde::Deserialize;

const DATA_PREFIX: &[u8] = b"data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// The trimmed payload of a `data: ` line.
    Data(String),
    /// The `[DONE]` sentinel. Nothing follows it.
    Done,
}

/// Incremental decoder fed with body chunks split at arbitrary boundaries.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Appends `chunk` and returns the events of every line it completed.
    ///
    /// The bytes after the last newline stay buffered until a later chunk
    /// terminates them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let event = decode_line(&self.buffer[start..end]);
            start = end + 1;

            match event {
                Some(SseEvent::Done) => {
                    self.finished = true;
                    self.buffer.clear();
                    events.push(SseEvent::Done);
                    return events;
                }
                Some(event) => events.push(event),
                None => {}
            }
        }
        self.buffer.drain(..start);
        events
    }
}

fn decode_line(line: &[u8]) -> Option<SseEvent> {
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = String::from_utf8_lossy(payload);
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Extracts `choices[0].delta.content` from one event payload.
///
/// Malformed payloads and empty deltas yield `None`.
pub fn delta_content(payload: &str) -> Option<String> {
    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!("Skipping malformed stream event: {}", e);
            return None;
        }
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty())
}
