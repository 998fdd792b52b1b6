use crate::{AttractorError, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Canceled,
    Error,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub provider: String,
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// JSON schema attached for structured-output stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub raw: BTreeMap<String, Value>,
}

impl ProviderResponse {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            raw: BTreeMap::new(),
        }
    }
}

/// Abstract provider surface the stage runtime talks to. Network adapters
/// and vendor CLI invocations live behind this trait, outside the core.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Validates a structured-output reply against the stage's JSON schema.
/// Numbers are preserved through `serde_json` parsing; any failure carries
/// the raw text back for diagnosis.
pub fn parse_structured_output(text: &str, schema: &Value) -> Result<Value, AttractorError> {
    let parsed: Value =
        serde_json::from_str(text).map_err(|error| AttractorError::NoObjectGenerated {
            message: format!("response is not valid JSON: {error}"),
            raw_text: text.to_string(),
        })?;

    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|error| {
        AttractorError::Configuration(format!("invalid response schema: {error}"))
    })?;
    if let Err(errors) = compiled.validate(&parsed) {
        let details: Vec<String> = errors.map(|error| error.to_string()).collect();
        return Err(AttractorError::NoObjectGenerated {
            message: format!("response does not match schema: {}", details.join("; ")),
            raw_text: text.to_string(),
        });
    }
    Ok(parsed)
}

/// Test adapter returning scripted responses in order; exhausting the script
/// is a provider error.
pub struct ScriptedProviderAdapter {
    name: String,
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
}

impl ScriptedProviderAdapter {
    pub fn new<I>(name: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = Result<ProviderResponse, ProviderError>>,
    {
        Self {
            name: name.into(),
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn with_texts<I, S>(name: impl Into<String>, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            texts
                .into_iter()
                .map(|text| Ok(ProviderResponse::text_only(text))),
        )
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProviderAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        _request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.responses
            .lock()
            .expect("scripted adapter mutex should lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::new(
                    crate::ProviderErrorKind::Unknown,
                    "scripted adapter has no more responses",
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_structured_output_valid_expected_value_with_numbers_preserved() {
        let schema = json!({
            "type": "object",
            "properties": {
                "score": {"type": "number"},
                "name": {"type": "string"}
            },
            "required": ["score", "name"]
        });
        let parsed = parse_structured_output(r#"{"score": 0.25, "name": "plan"}"#, &schema)
            .expect("valid object should parse");
        assert_eq!(parsed["score"], json!(0.25));
    }

    #[test]
    fn parse_structured_output_invalid_json_expected_no_object_generated_with_raw() {
        let schema = json!({"type": "object"});
        let error = parse_structured_output("not json at all", &schema)
            .expect_err("invalid JSON should fail");
        match error {
            AttractorError::NoObjectGenerated { raw_text, .. } => {
                assert_eq!(raw_text, "not json at all");
            }
            other => panic!("expected NoObjectGenerated, got {other}"),
        }
    }

    #[test]
    fn parse_structured_output_schema_mismatch_expected_no_object_generated() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        });
        let error = parse_structured_output(r#"{"other": 1}"#, &schema)
            .expect_err("schema mismatch should fail");
        assert!(matches!(error, AttractorError::NoObjectGenerated { .. }));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_adapter_returns_responses_in_order_then_errors() {
        let adapter = ScriptedProviderAdapter::with_texts("test", ["first", "second"]);
        let request = ProviderRequest {
            provider: "test".to_string(),
            model: None,
            messages: vec![ChatMessage::user("hi")],
            response_schema: None,
        };

        assert_eq!(
            adapter
                .complete(&request)
                .await
                .expect("first response should exist")
                .text,
            "first"
        );
        assert_eq!(
            adapter
                .complete(&request)
                .await
                .expect("second response should exist")
                .text,
            "second"
        );
        assert!(adapter.complete(&request).await.is_err());
    }
}
