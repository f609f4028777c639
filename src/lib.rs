//! Docsight chat - streaming client for the document-insight workflow API
//!
//! Opens a chat exchange against the upstream, decodes the server-sent event
//! stream, accumulates answer deltas, extracts marker-delimited sections
//! (insights, KPIs, charts) from the finalized reply, and maintains the
//! conversation state across exchanges.

pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod models;
pub mod sections;
pub mod sse;

pub use client::{ChatClient, ChatStream, EventStream};
pub use config::ClientConfig;
pub use error::ChatError;
pub use exchange::{ConversationState, ExchangeController, Phase};
pub use models::{ChatRequest, Message, Role};
pub use sections::{extract, Extracted, ExtractedSections};
pub use sse::StreamEvent;
