use crate::handlers::StageHandler;
use crate::{
    AttractorError, CancelToken, ContextValues, FailureClass, Graph, Node, StageOutcome,
    StageStatus,
};
use async_trait::async_trait;
use attractor_exec::ExecutionEnvironment;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

const STATUS_FILE_NAME: &str = "status.json";

/// Runs `tool_command` in a child process under the run's working directory
/// with a filtered environment.
pub struct ToolStageHandler {
    env: Arc<dyn ExecutionEnvironment>,
}

impl ToolStageHandler {
    pub fn new(env: Arc<dyn ExecutionEnvironment>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl StageHandler for ToolStageHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextValues,
        _graph: &Graph,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, AttractorError> {
        let command = node.attrs.get_str("tool_command").unwrap_or_default().trim();
        if command.is_empty() {
            return Ok(StageOutcome::failure(
                FailureClass::Structural,
                format!("tool node '{}' has no tool_command", node.id),
            ));
        }

        let timeout_ms = node
            .attrs
            .get("timeout")
            .and_then(|value| value.as_duration_ms())
            .unwrap_or(0);
        let env_overrides = HashMap::from([(
            "ATTRACTOR_NODE_ID".to_string(),
            node.id.clone(),
        )]);

        let result = tokio::select! {
            result = self.env.exec_command(command, timeout_ms, None, Some(env_overrides)) => {
                result.map_err(AttractorError::from)?
            }
            reason = cancel.cancelled() => {
                return Ok(StageOutcome::canceled(reason));
            }
        };

        let mut outcome = if result.timed_out {
            StageOutcome::failure(
                FailureClass::TransientInfra,
                format!("tool command timed out after {timeout_ms}ms"),
            )
        } else if result.exit_code == 0 {
            StageOutcome::success()
        } else {
            StageOutcome::failure(
                FailureClass::Deterministic,
                format!("tool command exited with code {}", result.exit_code),
            )
        };
        outcome.duration_ms = result.duration_ms;
        outcome
            .context_updates
            .insert("tool.stdout".to_string(), Value::String(result.stdout));
        outcome
            .context_updates
            .insert("tool.stderr".to_string(), Value::String(result.stderr));
        outcome
            .context_updates
            .insert("tool.exit_code".to_string(), json!(result.exit_code));
        outcome
            .context_updates
            .insert("tool.timed_out".to_string(), json!(result.timed_out));

        apply_status_override(&self.env, node, &mut outcome).await;
        Ok(outcome)
    }
}

/// A stage may drop `status.json` to set its own outcome; the explicit
/// `auto_status` attribute is the weaker override.
async fn apply_status_override(
    env: &Arc<dyn ExecutionEnvironment>,
    node: &Node,
    outcome: &mut StageOutcome,
) {
    if let Ok(true) = env.file_exists(STATUS_FILE_NAME).await {
        if let Ok(raw) = env.read_file(STATUS_FILE_NAME, None, None).await {
            if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                if let Some(status) = parsed.get("status").and_then(Value::as_str) {
                    outcome.status = StageStatus::parse(status);
                }
                if let Some(label) = parsed.get("preferred_label").and_then(Value::as_str) {
                    outcome.preferred_label = Some(label.to_string());
                }
                if let Some(notes) = parsed.get("notes").and_then(Value::as_str) {
                    outcome.notes = Some(notes.to_string());
                }
                let _ = env.delete_file(STATUS_FILE_NAME).await;
                return;
            }
        }
    }

    if let Some(auto_status) = node.attrs.get_str("auto_status") {
        outcome.status = StageStatus::parse(auto_status);
    }
}
