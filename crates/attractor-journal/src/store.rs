use crate::types::{AppendTurnRequest, ContextId, ContextInfo, Turn, TurnId};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type JournalResult<T> = Result<T, JournalError>;

/// Append-only turn log. Implementations must allocate monotonically
/// increasing opaque turn ids and dedupe on idempotency key.
#[async_trait::async_trait]
pub trait TurnStore: Send + Sync {
    async fn create_context(&self, base_turn_id: Option<TurnId>) -> JournalResult<ContextInfo>;

    async fn append_turn(&self, request: AppendTurnRequest) -> JournalResult<Turn>;

    async fn get_head(&self, context_id: &ContextId) -> JournalResult<ContextInfo>;

    async fn list_turns(
        &self,
        context_id: &ContextId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> JournalResult<Vec<Turn>>;
}
