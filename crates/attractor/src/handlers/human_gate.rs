use crate::handlers::StageHandler;
use crate::{
    AttractorError, CancelToken, ContextValues, Graph, InterviewDesk, Node, Question,
    StageOutcome,
};
use async_trait::async_trait;
use serde_json::Value;

/// Gate stage that parks a question on the interview desk and routes by the
/// answer: the answer text becomes the outcome's preferred label.
pub struct HumanGateHandler {
    desk: InterviewDesk,
}

impl HumanGateHandler {
    pub fn new(desk: InterviewDesk) -> Self {
        Self { desk }
    }
}

#[async_trait]
impl StageHandler for HumanGateHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &ContextValues,
        graph: &Graph,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, AttractorError> {
        let text = node
            .prompt()
            .or_else(|| node.attrs.get_str("label"))
            .unwrap_or("Continue?")
            .to_string();
        let choices: Vec<String> = graph
            .outgoing_edges(&node.id)
            .filter_map(|edge| edge.attrs.get_str("label"))
            .map(ToOwned::to_owned)
            .collect();
        let timeout_ms = node
            .attrs
            .get("timeout")
            .and_then(|value| value.as_duration_ms());

        let question = Question {
            id: format!("{}-gate", node.id),
            stage: node.id.clone(),
            text,
            choices,
            timeout_ms,
        };
        let answer = self.desk.ask(question, cancel).await?;

        if answer.timed_out {
            if let Some(reason) = cancel.reason() {
                return Ok(StageOutcome::canceled(reason));
            }
            if let Some(default_choice) = node.attrs.get_str("default_choice") {
                let mut outcome = StageOutcome::success();
                outcome.preferred_label = Some(default_choice.to_string());
                outcome.notes = Some("question timed out; default choice taken".to_string());
                return Ok(outcome);
            }
            let mut outcome = StageOutcome::with_status_token("timeout");
            outcome.notes = Some("question timed out with no default choice".to_string());
            return Ok(outcome);
        }

        let mut outcome = StageOutcome::success();
        outcome.preferred_label = Some(answer.text.clone());
        outcome.context_updates.insert(
            format!("{}.answer", node.id),
            Value::String(answer.text),
        );
        Ok(outcome)
    }
}
