//! Exchange controller: drives one request/response exchange at a time and
//! owns the externally visible conversation state.
//!
//! `send()` aborts any in-flight exchange, appends the user message, and
//! spawns a pump task that feeds the event stream back over a channel. Each
//! update is tagged with the exchange that produced it; updates from an
//! aborted exchange are dropped on arrival, so a stale chunk can never
//! mutate state after cancellation. At most one exchange is live by
//! construction.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::ChatClient;
use crate::error::ChatError;
use crate::models::{ChatRequest, Message};
use crate::sections::{extract, ExtractedSections};
use crate::sse::StreamEvent;

/// Lifecycle phase of the current exchange.
///
/// `Aborted` and `Errored` are not phases: both return the controller to
/// `Idle` immediately (silently for aborts, via `last_error` for failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    /// Request issued, transport not yet yielding frames
    Sending,
    /// Frames are flowing
    Streaming,
    /// Terminal event observed, section extraction in progress
    Finalizing,
}

/// Externally visible conversation record.
///
/// Owned exclusively by the [`ExchangeController`]; nothing else writes it.
#[derive(Debug, Default)]
pub struct ConversationState {
    /// Continuation token assigned by the upstream on first response;
    /// echoed on subsequent requests, never invented locally
    pub conversation_id: Option<String>,
    /// Finalized messages in send/receive order
    pub messages: Vec<Message>,
    /// Cumulative text of the assistant reply currently streaming
    pub live_text: String,
    /// Current exchange phase
    pub phase: Phase,
    /// User-visible error from the last exchange, if it failed
    pub last_error: Option<String>,
    /// Structured sections from the last finalized exchange
    pub sections: Option<ExtractedSections>,
}

impl ConversationState {
    /// Whether an exchange is currently in flight.
    pub fn is_streaming(&self) -> bool {
        self.phase != Phase::Idle
    }
}

/// One update from the pump task, tagged with its exchange.
#[derive(Debug)]
struct ExchangeUpdate {
    exchange: u64,
    kind: UpdateKind,
}

#[derive(Debug)]
enum UpdateKind {
    /// Transport acknowledged and is yielding frames
    Connected,
    /// Upstream surfaced a continuation token
    ConversationId(String),
    /// Partial answer fragment
    Delta(String),
    /// Terminal event observed; carries the final/cumulative answer if the
    /// event had one
    Finished { final_answer: Option<String> },
    /// Transport or upstream failure, or stream closed without a terminal
    /// event
    Failed(String),
}

/// Orchestrates exchanges against a [`ChatClient`].
pub struct ExchangeController {
    client: Arc<ChatClient>,
    state: ConversationState,
    updates_tx: mpsc::UnboundedSender<ExchangeUpdate>,
    updates_rx: mpsc::UnboundedReceiver<ExchangeUpdate>,
    current: Option<JoinHandle<()>>,
    exchange_seq: u64,
}

impl ExchangeController {
    /// Create a controller with an empty conversation.
    pub fn new(client: ChatClient) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            client: Arc::new(client),
            state: ConversationState::default(),
            updates_tx,
            updates_rx,
            current: None,
            exchange_seq: 0,
        }
    }

    /// Read access to the conversation state.
    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Send a user message, cancelling any exchange still in flight.
    ///
    /// The previous transport is aborted before anything else happens; its
    /// partial buffer is discarded without emitting a message and without
    /// setting an error. Empty input is ignored.
    pub fn send(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.abort_current();

        self.exchange_seq += 1;
        let exchange = self.exchange_seq;
        self.state.messages.push(Message::user(text));
        self.state.last_error = None;
        self.state.phase = Phase::Sending;

        let request = match &self.state.conversation_id {
            Some(id) => ChatRequest::with_conversation(text, id.clone()),
            None => ChatRequest::new(text),
        };
        tracing::info!(exchange, "sending chat request");

        let client = Arc::clone(&self.client);
        let tx = self.updates_tx.clone();
        self.current = Some(tokio::spawn(async move {
            run_exchange(client, request, tx, exchange).await;
        }));
    }

    /// Cancel the in-flight exchange, if any. Silent: no error is set and
    /// no message is appended for the aborted attempt.
    pub fn cancel(&mut self) {
        self.abort_current();
    }

    /// Apply every update already queued, without blocking.
    pub fn process_pending(&mut self) {
        while let Ok(update) = self.updates_rx.try_recv() {
            self.apply(update);
        }
    }

    /// Drive the current exchange to completion.
    ///
    /// Returns once the controller is idle again (finalized, failed, or
    /// there was nothing in flight).
    pub async fn run_to_idle(&mut self) {
        while self.state.phase != Phase::Idle {
            match self.updates_rx.recv().await {
                Some(update) => self.apply(update),
                None => break,
            }
        }
    }

    fn abort_current(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.abort();
            tracing::info!(exchange = self.exchange_seq, "aborted in-flight exchange");
        }
        // The aborted pump may already have queued updates carrying the
        // current tag; retiring the tag here makes them stale before they
        // can be applied.
        self.exchange_seq += 1;
        self.state.live_text.clear();
        self.state.phase = Phase::Idle;
    }

    fn apply(&mut self, update: ExchangeUpdate) {
        if update.exchange != self.exchange_seq {
            tracing::debug!(
                stale = update.exchange,
                current = self.exchange_seq,
                "dropping update from cancelled exchange"
            );
            return;
        }
        match update.kind {
            UpdateKind::Connected => {
                self.state.phase = Phase::Streaming;
            }
            UpdateKind::ConversationId(id) => {
                self.state.conversation_id = Some(id);
            }
            UpdateKind::Delta(delta) => {
                self.state.live_text.push_str(&delta);
            }
            UpdateKind::Finished { final_answer } => {
                self.state.phase = Phase::Finalizing;
                if let Some(answer) = final_answer {
                    self.state.live_text.push_str(&answer);
                }
                let raw = std::mem::take(&mut self.state.live_text);
                let extracted = extract(&raw);
                tracing::info!(
                    exchange = update.exchange,
                    text_len = extracted.text.len(),
                    has_sections = extracted.sections.is_some(),
                    "exchange finalized"
                );
                self.state.sections = extracted.sections;
                // Always append, even with empty text: an assistant turn
                // carrying only sections is valid, and message order must
                // keep matching send/receive order.
                self.state.messages.push(Message::assistant(extracted.text));
                self.state.phase = Phase::Idle;
                self.current = None;
            }
            UpdateKind::Failed(message) => {
                tracing::warn!(exchange = update.exchange, error = %message, "exchange failed");
                self.state.live_text.clear();
                self.state.last_error = Some(message);
                self.state.phase = Phase::Idle;
                self.current = None;
            }
        }
    }
}

/// Pump one exchange: open the transport, forward events as updates, and
/// report the terminal outcome. Runs on its own task so `send` can abort it.
async fn run_exchange(
    client: Arc<ChatClient>,
    request: ChatRequest,
    tx: mpsc::UnboundedSender<ExchangeUpdate>,
    exchange: u64,
) {
    let send = |kind: UpdateKind| {
        let _ = tx.send(ExchangeUpdate { exchange, kind });
    };

    let chat = match client.open(&request).await {
        Ok(chat) => chat,
        Err(err) => {
            send(UpdateKind::Failed(err.to_string()));
            return;
        }
    };
    if let Some(id) = chat.conversation_id {
        send(UpdateKind::ConversationId(id));
    }
    send(UpdateKind::Connected);

    let mut events = chat.events;
    while let Some(item) = events.next().await {
        match item {
            Ok(StreamEvent::Message {
                delta,
                conversation_id,
            }) => {
                if let Some(id) = conversation_id {
                    send(UpdateKind::ConversationId(id));
                }
                if !delta.is_empty() {
                    send(UpdateKind::Delta(delta));
                }
            }
            Ok(StreamEvent::MessageEnd {
                answer,
                conversation_id,
            })
            | Ok(StreamEvent::WorkflowFinished {
                answer,
                conversation_id,
            }) => {
                if let Some(id) = conversation_id {
                    send(UpdateKind::ConversationId(id));
                }
                send(UpdateKind::Finished {
                    final_answer: answer,
                });
                return;
            }
            Ok(StreamEvent::Error { message }) => {
                send(UpdateKind::Failed(ChatError::Upstream(message).to_string()));
                return;
            }
            Ok(StreamEvent::Unknown { kind }) => {
                tracing::debug!(kind = %kind, "ignoring unknown event");
            }
            Err(err) => {
                send(UpdateKind::Failed(err.to_string()));
                return;
            }
        }
    }
    // The connection ended without a terminal event: an error, not a
    // silent success.
    send(UpdateKind::Failed(ChatError::StreamClosed.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::models::Role;
    use crate::sections::KpiItem;

    fn controller() -> ExchangeController {
        let client = ChatClient::new(ClientConfig::new("http://127.0.0.1:1")).unwrap();
        ExchangeController::new(client)
    }

    fn update(exchange: u64, kind: UpdateKind) -> ExchangeUpdate {
        ExchangeUpdate { exchange, kind }
    }

    #[tokio::test]
    async fn test_deltas_accumulate_into_live_text() {
        let mut ctl = controller();
        ctl.exchange_seq = 1;
        ctl.state.phase = Phase::Streaming;

        ctl.apply(update(1, UpdateKind::Delta("Hi ".to_string())));
        ctl.apply(update(1, UpdateKind::Delta("there".to_string())));
        assert_eq!(ctl.state.live_text, "Hi there");
        assert!(ctl.state.is_streaming());
    }

    #[tokio::test]
    async fn test_finish_appends_assistant_message_and_clears_buffer() {
        let mut ctl = controller();
        ctl.exchange_seq = 1;
        ctl.state.phase = Phase::Streaming;
        ctl.state.live_text = "Hi ".to_string();

        ctl.apply(update(
            1,
            UpdateKind::Finished {
                final_answer: Some("there".to_string()),
            },
        ));
        assert_eq!(ctl.state.phase, Phase::Idle);
        assert!(ctl.state.live_text.is_empty());
        assert_eq!(ctl.state.messages.len(), 1);
        assert_eq!(ctl.state.messages[0].role, Role::Assistant);
        assert_eq!(ctl.state.messages[0].text, "Hi there");
    }

    #[tokio::test]
    async fn test_finish_with_sections_only_still_appends_message() {
        let mut ctl = controller();
        ctl.exchange_seq = 1;
        ctl.state.phase = Phase::Streaming;
        ctl.state.live_text =
            r#"### Start OF KPI###[{"Title":"Docs","Value":"9"}]### End OF KPI###"#.to_string();

        ctl.apply(update(1, UpdateKind::Finished { final_answer: None }));
        assert_eq!(ctl.state.messages.len(), 1);
        assert!(ctl.state.messages[0].text.is_empty());
        let kpi = ctl.state.sections.as_ref().unwrap().kpi.as_ref().unwrap();
        assert_eq!(
            kpi[0],
            KpiItem {
                title: Some("Docs".to_string()),
                value: Some("9".to_string()),
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_failure_sets_error_and_drops_partial_text() {
        let mut ctl = controller();
        ctl.exchange_seq = 1;
        ctl.state.phase = Phase::Streaming;
        ctl.state.live_text = "partial".to_string();

        ctl.apply(update(1, UpdateKind::Failed("boom".to_string())));
        assert_eq!(ctl.state.phase, Phase::Idle);
        assert!(ctl.state.live_text.is_empty());
        assert_eq!(ctl.state.last_error.as_deref(), Some("boom"));
        assert!(ctl.state.messages.is_empty());
    }

    #[tokio::test]
    async fn test_stale_update_is_a_no_op() {
        let mut ctl = controller();
        ctl.exchange_seq = 2;
        ctl.state.phase = Phase::Streaming;

        ctl.apply(update(1, UpdateKind::Delta("late chunk".to_string())));
        assert!(ctl.state.live_text.is_empty());

        ctl.apply(update(
            1,
            UpdateKind::Failed("stream closed unexpectedly".to_string()),
        ));
        assert!(ctl.state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_is_silent() {
        let mut ctl = controller();
        ctl.send("hello");
        assert!(ctl.state.is_streaming());
        assert_eq!(ctl.state.messages.len(), 1);

        ctl.cancel();
        assert_eq!(ctl.state.phase, Phase::Idle);
        assert!(ctl.state.live_text.is_empty());
        assert!(ctl.state.last_error.is_none());
        // No assistant message for the aborted attempt.
        assert_eq!(ctl.state.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_invalidates_already_queued_updates() {
        let mut ctl = controller();
        ctl.send("hello");
        let exchange = ctl.exchange_seq;
        // Terminal update queued by the pump just before cancellation lands.
        ctl.updates_tx
            .send(update(
                exchange,
                UpdateKind::Finished {
                    final_answer: Some("ghost".to_string()),
                },
            ))
            .unwrap();

        ctl.cancel();
        ctl.process_pending();
        assert_eq!(ctl.state.phase, Phase::Idle);
        // Only the user message; the aborted exchange must not finalize.
        assert_eq!(ctl.state.messages.len(), 1);
        assert_eq!(ctl.state.messages[0].role, Role::User);
        assert!(ctl.state.sections.is_none());
        assert!(ctl.state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_send_ignores_blank_input() {
        let mut ctl = controller();
        ctl.send("   \n ");
        assert_eq!(ctl.state.phase, Phase::Idle);
        assert!(ctl.state.messages.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_id_adopted_and_echoed() {
        let mut ctl = controller();
        ctl.exchange_seq = 1;
        ctl.apply(update(1, UpdateKind::ConversationId("c9".to_string())));
        assert_eq!(ctl.state.conversation_id.as_deref(), Some("c9"));
    }
}
