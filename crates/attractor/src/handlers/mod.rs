use crate::{AttractorError, CancelToken, ContextValues, Graph, Node, StageOutcome};
use async_trait::async_trait;
use std::sync::Arc;

pub mod human_gate;
pub mod llm;
pub mod registry;
pub mod tool;

/// Executes one stage. Handlers receive a context snapshot; mutations travel
/// back through `StageOutcome::context_updates`.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextValues,
        graph: &Graph,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, AttractorError>;
}

pub type SharedStageHandler = Arc<dyn StageHandler>;

/// No-op handler for start and terminal markers.
#[derive(Debug, Default)]
pub struct MarkerHandler;

#[async_trait]
impl StageHandler for MarkerHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &ContextValues,
        _graph: &Graph,
        _cancel: &CancelToken,
    ) -> Result<StageOutcome, AttractorError> {
        Ok(StageOutcome::success())
    }
}
