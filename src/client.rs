//! HTTP client for the upstream workflow API.
//!
//! `POST /chat` answers in one of three shapes:
//! - `text/event-stream`: the response body is the event stream itself
//! - a JSON envelope with a `task_id`: the stream must be fetched with a
//!   follow-up `GET /chat/{task_id}/events`
//! - a JSON envelope with a direct `answer`: no stream; a single synthetic
//!   terminal event is produced
//!
//! All three converge on the same `Stream<Item = Result<StreamEvent, _>>`
//! so the exchange controller never cares which shape it got.

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::stream::{self, Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::error::ChatError;
use crate::models::ChatRequest;
use crate::sse::{parse_frame, FrameDecoder, StreamEvent};

/// A pinned, boxed stream of parsed events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ChatError>> + Send>>;

/// JSON envelope returned when the upstream does not stream directly.
#[derive(Debug, Clone, Deserialize)]
struct ChatEnvelope {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    answer: Option<String>,
}

/// One opened exchange: the event stream plus any conversation id the
/// envelope already carried.
pub struct ChatStream {
    /// Continuation token surfaced by the envelope, if any
    pub conversation_id: Option<String>,
    /// Parsed events in arrival order
    pub events: EventStream,
}

/// Client for the workflow API.
pub struct ChatClient {
    config: ClientConfig,
    http: Client,
}

impl ChatClient {
    /// Create a client from the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ChatError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    /// Open one request/response exchange.
    pub async fn open(&self, request: &ChatRequest) -> Result<ChatStream, ChatError> {
        let url = format!("{}/chat", self.config.base_url);
        let response = self
            .authorize(self.http.post(&url))
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(server_error(response).await);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            tracing::debug!(url = %url, "direct event stream");
            return Ok(ChatStream {
                conversation_id: None,
                events: decode_stream(response),
            });
        }

        let envelope: ChatEnvelope = response.json().await?;
        if let Some(task_id) = &envelope.task_id {
            tracing::debug!(task_id = %task_id, "task-id indirection");
            let events = self.open_task_events(task_id).await?;
            return Ok(ChatStream {
                conversation_id: envelope.conversation_id,
                events,
            });
        }
        if let Some(answer) = envelope.answer {
            // Direct answer with no stream: one synthetic terminal event.
            let event = StreamEvent::MessageEnd {
                answer: Some(answer),
                conversation_id: envelope.conversation_id.clone(),
            };
            return Ok(ChatStream {
                conversation_id: envelope.conversation_id,
                events: Box::pin(stream::iter(vec![Ok(event)])),
            });
        }
        Err(ChatError::Envelope(
            "response carried neither a stream, a task_id, nor an answer".to_string(),
        ))
    }

    /// Exchange a task id for its event stream.
    async fn open_task_events(&self, task_id: &str) -> Result<EventStream, ChatError> {
        let url = format!("{}/chat/{}/events", self.config.base_url, task_id);
        let response = self
            .authorize(self.http.get(&url))
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(server_error(response).await);
        }
        Ok(decode_stream(response))
    }
}

async fn server_error(response: Response) -> ChatError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    ChatError::Server { status, message }
}

/// Turn a streaming HTTP response into a stream of parsed events.
///
/// Frames are emitted in arrival order and `data:` lines within a frame in
/// textual order, so downstream accumulation sees a total order consistent
/// with network delivery. Stream end flushes any buffered final frame.
fn decode_stream(response: Response) -> EventStream {
    let bytes_stream = response.bytes_stream();
    let events = stream::unfold(
        (
            bytes_stream,
            FrameDecoder::new(),
            VecDeque::<StreamEvent>::new(),
            false,
        ),
        |(mut bytes_stream, mut decoder, mut queue, mut done)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((Ok(event), (bytes_stream, decoder, queue, done)));
                }
                if done {
                    return None;
                }
                match bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in decoder.feed(&chunk) {
                            queue.extend(parse_frame(&frame));
                        }
                    }
                    Some(Err(err)) => {
                        done = true;
                        return Some((
                            Err(ChatError::Http(err)),
                            (bytes_stream, decoder, queue, done),
                        ));
                    }
                    None => {
                        done = true;
                        if let Some(frame) = decoder.finish() {
                            queue.extend(parse_frame(&frame));
                        }
                    }
                }
            }
        },
    );
    Box::pin(events)
}
