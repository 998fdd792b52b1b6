#![allow(dead_code)]

use async_trait::async_trait;
use attractor::handlers::StageHandler;
use attractor::{
    AttractorError, CancelToken, ContextValues, Graph, Node, StageOutcome,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Test executor: each node pops its next scripted outcome; unscripted nodes
/// (start, join markers) succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<BTreeMap<String, VecDeque<StageOutcome>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script<I>(self, node_id: &str, outcomes: I) -> Self
    where
        I: IntoIterator<Item = StageOutcome>,
    {
        self.scripts
            .lock()
            .expect("script mutex should lock")
            .insert(node_id.to_string(), outcomes.into_iter().collect());
        self
    }
}

#[async_trait]
impl StageHandler for ScriptedExecutor {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextValues,
        _graph: &Graph,
        _cancel: &CancelToken,
    ) -> Result<StageOutcome, AttractorError> {
        let mut scripts = self.scripts.lock().expect("script mutex should lock");
        match scripts.get_mut(&node.id).and_then(VecDeque::pop_front) {
            Some(outcome) => Ok(outcome),
            None => Ok(StageOutcome::success()),
        }
    }
}

pub fn journal_kinds(turns: &[attractor_journal::Turn]) -> Vec<String> {
    turns.iter().map(|turn| turn.type_id.clone()).collect()
}

pub fn completion_position(turns: &[attractor_journal::Turn], node_id: &str) -> Option<usize> {
    turns.iter().position(|turn| {
        turn.type_id == "attractor.node_completed"
            && turn.payload.get("node_id").and_then(serde_json::Value::as_str) == Some(node_id)
    })
}
