//! Knowledge-base chat service client.
//!
//! The [`ChatBackend`] trait is the seam between the exchange engine and the
//! upstream service: it opens streaming completions and manages the
//! conversations (sessions) they belong to. [`client::RagflowClient`] is the
//! HTTP implementation.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use kbchat_core::config::SessionOrder;
use kbchat_core::types::Session;

pub mod client;
pub mod error;
pub mod sse;
pub mod wire;

pub use error::UpstreamError;
pub use sse::SseEvent;

/// Decoded event frames of one streaming completion.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseEvent, UpstreamError>> + Send>>;

/// Body of a completions request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub question: String,
    pub session_id: String,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn streaming(question: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: session_id.into(),
            stream: true,
        }
    }
}

/// Query for a page of sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSessionsParams {
    pub page: u32,
    pub page_size: u32,
    pub orderby: SessionOrder,
    pub desc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Default for ListSessionsParams {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            orderby: SessionOrder::UpdateTime,
            desc: true,
            name: None,
            id: None,
        }
    }
}

/// The upstream conversational service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open a streaming completion. Resolves once response headers arrive;
    /// dropping the returned stream aborts the request.
    async fn completions(&self, request: &CompletionRequest) -> Result<FrameStream, UpstreamError>;

    /// Create a new, empty conversation.
    async fn create_session(&self, name: &str) -> Result<Session, UpstreamError>;

    async fn list_sessions(&self, params: &ListSessionsParams) -> Result<Vec<Session>, UpstreamError>;

    async fn rename_session(&self, session_id: &str, name: &str) -> Result<(), UpstreamError>;

    async fn delete_sessions(&self, ids: &[String]) -> Result<(), UpstreamError>;
}
