use crate::handlers::StageHandler;
use crate::{
    AttractorError, CancelToken, ChatMessage, ContextValues, FailureClass, FinishReason, Graph,
    Node, ProviderAdapter, ProviderRequest, StageOutcome, StageStatus, ToolCall,
    parse_structured_output,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_MAX_TOOL_ROUNDS: i64 = 8;

/// Executes a tool call issued by the model and returns the textual result
/// appended to the conversation.
#[async_trait]
pub trait ToolCallRunner: Send + Sync {
    async fn run(&self, call: &ToolCall) -> Result<String, AttractorError>;
}

/// LLM stage: builds the request from node attributes and context, drives
/// the tool-call loop, and interprets the finish reason into an outcome.
pub struct LlmStageHandler {
    adapter: Arc<dyn ProviderAdapter>,
    tool_runner: Option<Arc<dyn ToolCallRunner>>,
}

impl LlmStageHandler {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            tool_runner: None,
        }
    }

    pub fn with_tool_runner(mut self, runner: Arc<dyn ToolCallRunner>) -> Self {
        self.tool_runner = Some(runner);
        self
    }
}

#[async_trait]
impl StageHandler for LlmStageHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextValues,
        _graph: &Graph,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, AttractorError> {
        let Some(prompt) = node.prompt() else {
            return Ok(StageOutcome::failure(
                FailureClass::Structural,
                format!("llm node '{}' has no prompt", node.id),
            ));
        };

        let response_schema = match node.attrs.get_str("output_schema") {
            Some(raw) => Some(serde_json::from_str::<Value>(raw).map_err(|error| {
                AttractorError::Configuration(format!(
                    "node '{}' output_schema is not valid JSON: {error}",
                    node.id
                ))
            })?),
            None => None,
        };

        let mut messages = Vec::new();
        if let Some(goal) = context.get("graph.goal").and_then(Value::as_str) {
            messages.push(ChatMessage::system(format!("Overall goal: {goal}")));
        }
        messages.push(ChatMessage::user(interpolate_context(prompt, context)));

        let max_tool_rounds = node
            .attrs
            .get("max_tool_rounds")
            .and_then(|value| value.as_i64())
            .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)
            .max(0);

        let model = node.attrs.get_str("model").map(ToOwned::to_owned);
        let provider = node
            .attrs
            .get_str("provider")
            .unwrap_or_else(|| self.adapter.name())
            .to_string();

        let mut rounds = 0i64;
        let response = loop {
            if let Some(reason) = cancel.reason() {
                return Ok(StageOutcome::canceled(reason));
            }

            let request = ProviderRequest {
                provider: provider.clone(),
                model: model.clone(),
                messages: messages.clone(),
                response_schema: response_schema.clone(),
            };
            let response = tokio::select! {
                completed = self.adapter.complete(&request) => {
                    match completed {
                        Ok(response) => response,
                        Err(error) => {
                            let class = if error.retryable {
                                FailureClass::TransientInfra
                            } else {
                                FailureClass::Deterministic
                            };
                            let mut outcome =
                                StageOutcome::failure(class, error.message.clone());
                            outcome.provider_raw.insert(
                                "error".to_string(),
                                serde_json::to_value(&error).unwrap_or(Value::Null),
                            );
                            return Ok(outcome);
                        }
                    }
                }
                reason = cancel.cancelled() => {
                    return Ok(StageOutcome::canceled(reason));
                }
            };

            if response.tool_calls.is_empty() || rounds >= max_tool_rounds {
                break response;
            }
            let Some(runner) = self.tool_runner.as_ref() else {
                break response;
            };

            messages.push(ChatMessage::assistant(response.text.clone()));
            for call in &response.tool_calls {
                let result = runner.run(call).await?;
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
            rounds += 1;
        };

        let mut updates = BTreeMap::new();
        updates.insert(
            format!("{}.output", node.id),
            Value::String(response.text.clone()),
        );
        if let Some(schema) = response_schema.as_ref() {
            let object = parse_structured_output(&response.text, schema)?;
            updates.insert(format!("{}.object", node.id), object);
        }

        let status = match node.attrs.get_str("auto_status") {
            Some(auto_status) => StageStatus::parse(auto_status),
            None => status_from_finish_reason(response.finish_reason),
        };
        let failure_class = match (&status, response.finish_reason) {
            (StageStatus::Fail, FinishReason::Length) => Some(FailureClass::BudgetExhausted),
            (StageStatus::Fail, _) => Some(FailureClass::Deterministic),
            (StageStatus::Canceled, _) => Some(FailureClass::Canceled),
            _ => None,
        };

        let mut provider_raw = BTreeMap::new();
        provider_raw.insert(
            "finish_reason".to_string(),
            Value::String(response.finish_reason.as_str().to_string()),
        );
        provider_raw.insert(
            "usage".to_string(),
            serde_json::to_value(response.usage).unwrap_or(Value::Null),
        );
        provider_raw.insert("tool_rounds".to_string(), json!(rounds));
        for (key, value) in response.raw {
            provider_raw.entry(key).or_insert(value);
        }

        Ok(StageOutcome {
            status,
            preferred_label: extract_preferred_label(&response.text),
            failure_class,
            duration_ms: 0,
            notes: None,
            context_updates: updates,
            provider_raw,
        })
    }
}

fn status_from_finish_reason(finish_reason: FinishReason) -> StageStatus {
    match finish_reason {
        FinishReason::Stop | FinishReason::ToolCalls => StageStatus::Success,
        FinishReason::Canceled => StageStatus::Canceled,
        FinishReason::Length | FinishReason::ContentFilter | FinishReason::Error => {
            StageStatus::Fail
        }
    }
}

/// `$ctx.key` placeholders in prompts resolve against the context snapshot.
fn interpolate_context(prompt: &str, context: &ContextValues) -> String {
    let mut out = prompt.to_string();
    for (key, value) in context {
        let placeholder = format!("$ctx.{key}");
        if out.contains(&placeholder) {
            let text = match value {
                Value::String(inner) => inner.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &text);
        }
    }
    out
}

/// A final `DECISION: <label>` line steers label-based routing.
fn extract_preferred_label(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("DECISION:"))
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ProviderError, ProviderErrorKind, ProviderResponse, ScriptedProviderAdapter, Usage,
        parse_graph_text,
    };
    use std::sync::Mutex;

    fn llm_node(attrs: &str) -> (Graph, Node) {
        let graph = parse_graph_text(&format!("digraph G {{ n [{attrs}] }}"))
            .expect("graph should parse");
        let node = graph.nodes.get("n").expect("node should exist").clone();
        (graph, node)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn llm_handler_success_records_output_and_status() {
        let adapter = Arc::new(ScriptedProviderAdapter::with_texts("test", ["done"]));
        let handler = LlmStageHandler::new(adapter);
        let (graph, node) = llm_node(r#"prompt="Do the thing""#);

        let outcome = handler
            .execute(&node, &ContextValues::new(), &graph, &CancelToken::never())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("n.output"),
            Some(&json!("done"))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn llm_handler_retryable_provider_error_maps_to_transient_infra() {
        let adapter = Arc::new(ScriptedProviderAdapter::new(
            "test",
            [Err(ProviderError::new(
                ProviderErrorKind::RateLimit,
                "slow down",
            ))],
        ));
        let handler = LlmStageHandler::new(adapter);
        let (graph, node) = llm_node(r#"prompt="p""#);

        let outcome = handler
            .execute(&node, &ContextValues::new(), &graph, &CancelToken::never())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Fail);
        assert_eq!(outcome.failure_class, Some(FailureClass::TransientInfra));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn llm_handler_tool_call_loop_extends_conversation() {
        struct CountingRunner(Mutex<Vec<String>>);

        #[async_trait]
        impl ToolCallRunner for CountingRunner {
            async fn run(&self, call: &ToolCall) -> Result<String, AttractorError> {
                self.0
                    .lock()
                    .expect("runner mutex should lock")
                    .push(call.name.clone());
                Ok("tool says hi".to_string())
            }
        }

        let with_tools = ProviderResponse {
            text: "calling a tool".to_string(),
            tool_calls: vec![ToolCall {
                id: "call-1".to_string(),
                name: "read_file".to_string(),
                arguments: json!({"path": "a.txt"}),
            }],
            usage: Usage::default(),
            finish_reason: FinishReason::ToolCalls,
            raw: BTreeMap::new(),
        };
        let adapter = Arc::new(ScriptedProviderAdapter::new(
            "test",
            [Ok(with_tools), Ok(ProviderResponse::text_only("final"))],
        ));
        let runner = Arc::new(CountingRunner(Mutex::new(Vec::new())));
        let handler = LlmStageHandler::new(adapter).with_tool_runner(runner.clone());
        let (graph, node) = llm_node(r#"prompt="p""#);

        let outcome = handler
            .execute(&node, &ContextValues::new(), &graph, &CancelToken::never())
            .await
            .expect("execution should succeed");
        assert_eq!(
            outcome.context_updates.get("n.output"),
            Some(&json!("final"))
        );
        assert_eq!(
            runner.0.lock().expect("runner mutex should lock").as_slice(),
            &["read_file".to_string()]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn llm_handler_structured_output_validates_against_schema() {
        let adapter = Arc::new(ScriptedProviderAdapter::with_texts(
            "test",
            [r#"{"verdict": "pass"}"#],
        ));
        let handler = LlmStageHandler::new(adapter);
        let (graph, node) = llm_node(
            r#"prompt="p", output_schema="{\"type\": \"object\", \"properties\": {\"verdict\": {\"type\": \"string\"}}, \"required\": [\"verdict\"]}""#,
        );

        let outcome = handler
            .execute(&node, &ContextValues::new(), &graph, &CancelToken::never())
            .await
            .expect("execution should succeed");
        assert_eq!(
            outcome.context_updates.get("n.object"),
            Some(&json!({"verdict": "pass"}))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn llm_handler_structured_output_mismatch_expected_no_object_generated() {
        let adapter = Arc::new(ScriptedProviderAdapter::with_texts("test", ["not json"]));
        let handler = LlmStageHandler::new(adapter);
        let (graph, node) = llm_node(
            r#"prompt="p", output_schema="{\"type\": \"object\"}""#,
        );

        let error = handler
            .execute(&node, &ContextValues::new(), &graph, &CancelToken::never())
            .await
            .expect_err("schema mismatch should fail");
        match error {
            AttractorError::NoObjectGenerated { raw_text, .. } => {
                assert_eq!(raw_text, "not json");
            }
            other => panic!("expected NoObjectGenerated, got {other}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn llm_handler_decision_line_sets_preferred_label() {
        let adapter = Arc::new(ScriptedProviderAdapter::with_texts(
            "test",
            ["analysis...\nDECISION: Approve"],
        ));
        let handler = LlmStageHandler::new(adapter);
        let (graph, node) = llm_node(r#"prompt="p""#);

        let outcome = handler
            .execute(&node, &ContextValues::new(), &graph, &CancelToken::never())
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.preferred_label.as_deref(), Some("Approve"));
    }

    #[test]
    fn interpolate_context_replaces_placeholders() {
        let context = BTreeMap::from([("plan.output".to_string(), json!("the plan"))]);
        assert_eq!(
            interpolate_context("Implement: $ctx.plan.output", &context),
            "Implement: the plan"
        );
    }
}
