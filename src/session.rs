//! Boundary between the orchestrator and the remote conversational session.

use crate::events::{Outbound, SessionReply};
use crate::gemini::GeminiError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Errors crossing the session boundary, split by the operation that failed.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(#[source] GeminiError),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("send failed: {0}")]
    Send(#[source] GeminiError),

    #[error("receive failed: {0}")]
    Receive(#[source] GeminiError),

    #[error("close failed: {0}")]
    Close(#[source] GeminiError),
}

pub type ReplyStream<'a> = BoxStream<'a, Result<SessionReply, SessionError>>;

/// An open session. Shared by the dispatcher, receiver and text input.
#[async_trait]
pub trait Session: Send + Sync {
    async fn send(&self, msg: Outbound) -> Result<(), SessionError>;

    /// Replies for the next remote turn. The stream ends when the turn is
    /// complete; call again for the following turn.
    fn receive(&self) -> ReplyStream<'_>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Opens sessions. Only one is open per run.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Session>, SessionError>;
}
