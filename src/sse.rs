//! SSE (Server-Sent Events) stream parsing for the workflow API.
//!
//! The upstream emits blank-line-delimited frames whose `data:` lines each
//! carry one JSON event record. Bytes arrive in chunks that may split lines,
//! frame separators, and even multi-byte UTF-8 sequences arbitrarily, so
//! decoding is stateful:
//! - [`FrameDecoder`] - accumulates chunks and emits complete frames
//! - [`parse_frame`] - extracts `data:` lines from one frame and classifies
//!   each JSON record into a [`StreamEvent`]
//!
//! Non-JSON data lines (heartbeats, control frames) are expected and are
//! skipped with a debug log rather than failing the exchange.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Frames are separated by a blank line. `\r\n` line endings are tolerated.
static FRAME_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n\r?\n").expect("Invalid frame separator pattern"));

const DATA_PREFIX: &str = "data:";

/// Accumulates raw byte chunks and emits complete event-stream frames.
///
/// A frame is everything before a blank-line separator; the remainder stays
/// buffered until more data arrives or the stream closes. Partial UTF-8
/// sequences split across chunks are held back and decoded once complete,
/// so no byte is dropped, duplicated, or mis-decoded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes that do not yet form a complete UTF-8 sequence
    pending: Vec<u8>,
    /// Decoded text not yet terminated by a frame separator
    buffer: String,
}

impl FrameDecoder {
    /// Create a new empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes and return any frames it completes,
    /// in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        self.decode_pending();
        self.drain_frames()
    }

    /// Flush the decoder at end of stream.
    ///
    /// Returns the trailing frame that never received its separator, if any.
    /// An invalid or incomplete UTF-8 tail is replaced rather than dropped.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            self.buffer
                .push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Whether any undelivered data remains buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty() || !self.pending.is_empty()
    }

    /// Move the longest valid UTF-8 prefix of `pending` into `buffer`.
    /// Invalid sequences become U+FFFD; an incomplete trailing sequence is
    /// kept for the next chunk.
    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            self.buffer.push('\u{FFFD}');
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(separator) = FRAME_SEPARATOR.find(&self.buffer) {
            let frame = self.buffer[..separator.start()].to_string();
            self.buffer = self.buffer[separator.end()..].to_string();
            frames.push(frame);
        }
        frames
    }
}

/// One classified event from the stream.
///
/// A conversation id is only surfaced on the message/completion kinds; the
/// caller adopts it as the continuation token for subsequent requests.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Partial answer fragment
    Message {
        delta: String,
        conversation_id: Option<String>,
    },
    /// Terminal: the message is complete; may carry the final or cumulative
    /// answer text
    MessageEnd {
        answer: Option<String>,
        conversation_id: Option<String>,
    },
    /// Terminal: the workflow finished; the answer is nested under
    /// `data.outputs.answer` or `data.answer`
    WorkflowFinished {
        answer: Option<String>,
        conversation_id: Option<String>,
    },
    /// Upstream reported an error
    Error { message: String },
    /// Unrecognized event kind; ignored without failing the exchange
    Unknown { kind: String },
}

impl StreamEvent {
    /// Whether this event completes the exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::MessageEnd { .. } | StreamEvent::WorkflowFinished { .. }
        )
    }

    /// Returns the event kind name as a string for debugging purposes.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StreamEvent::Message { .. } => "message",
            StreamEvent::MessageEnd { .. } => "message_end",
            StreamEvent::WorkflowFinished { .. } => "workflow_finished",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Unknown { .. } => "unknown",
        }
    }
}

/// Raw event record from a `data:` line.
///
/// Field names vary between upstream implementations, so everything is
/// optional here and resolved during classification.
#[derive(Debug, Clone, Deserialize)]
struct EventRecord {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<EventData>,
}

/// Nested payload for workflow events.
#[derive(Debug, Clone, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    outputs: Option<EventOutputs>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EventOutputs {
    #[serde(default)]
    answer: Option<String>,
}

impl EventRecord {
    fn into_event(self) -> StreamEvent {
        match self.event.as_deref() {
            Some("message") => StreamEvent::Message {
                delta: self.answer.unwrap_or_default(),
                conversation_id: self.conversation_id,
            },
            Some("message_end") | Some("message_completed") => StreamEvent::MessageEnd {
                answer: self.answer,
                conversation_id: self.conversation_id,
            },
            Some("workflow_finished") => {
                let nested = self.data.unwrap_or_default();
                let answer = nested
                    .outputs
                    .and_then(|outputs| outputs.answer)
                    .or(nested.answer)
                    .or(self.answer);
                StreamEvent::WorkflowFinished {
                    answer,
                    conversation_id: self.conversation_id,
                }
            }
            Some("error") => StreamEvent::Error {
                message: self
                    .message
                    .unwrap_or_else(|| "unknown upstream error".to_string()),
            },
            other => StreamEvent::Unknown {
                kind: other.unwrap_or_default().to_string(),
            },
        }
    }
}

/// Parse one frame into its events.
///
/// Keeps only `data:`-prefixed lines; each is decoded as strict JSON and
/// classified. Lines that are empty or not valid JSON are skipped - SSE
/// heartbeats and control lines are expected there. Multiple `data:` lines
/// in one frame yield independent events in textual order.
pub fn parse_frame(frame: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for line in frame.lines() {
        let Some(rest) = line.trim_start().strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let data = rest.trim();
        if data.is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(data) {
            Ok(record) => events.push(record.into_event()),
            Err(err) => {
                tracing::debug!(error = %err, line = data, "skipping non-JSON data line");
            }
        }
    }
    events
}
