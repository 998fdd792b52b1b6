use attractor_journal::{
    AppendTurnRequest, ContextId, ContextInfo, JournalError, JournalResult, Turn, TurnStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_CXDB_HTTP_BASE_URL: &str = "http://127.0.0.1:9010";

const APPEND_RETRY_ATTEMPTS: u32 = 3;
const APPEND_RETRY_DELAY_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum CxdbClientError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cxdb backend failure: {0}")]
    Backend(String),
}

impl From<CxdbClientError> for JournalError {
    fn from(error: CxdbClientError) -> Self {
        match error {
            CxdbClientError::NotFound(id) => JournalError::NotFound {
                resource: "cxdb",
                id,
            },
            CxdbClientError::Conflict(message) => JournalError::Conflict(message),
            CxdbClientError::InvalidInput(message) => JournalError::InvalidInput(message),
            CxdbClientError::Backend(message) => JournalError::Backend(message),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Option<Value>,
}

#[derive(Clone, Debug, Serialize)]
struct CreateContextBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_turn_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct AppendTurnBody {
    parent_turn_id: Option<String>,
    type_id: String,
    type_version: u32,
    payload: Value,
    idempotency_key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppendTurnResponse {
    pub context_id: ContextId,
    pub turn_id: String,
    pub parent_turn_id: String,
    pub depth: u32,
    #[serde(default)]
    pub deduplicated: bool,
}

#[derive(Clone, Debug, Deserialize)]
struct ListTurnsResponse {
    turns: Vec<Turn>,
}

/// HTTP client for the CXDB turn-log service.
///
/// Canonical paths are tried first; servers still exposing the older
/// `/create` / `/append` method paths answer 404/405 on them, in which case
/// the request is replayed against the legacy path once.
#[derive(Clone, Debug)]
pub struct CxdbClient {
    client: reqwest::Client,
    base_url: String,
}

impl CxdbClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var("CXDB_HTTP_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CXDB_HTTP_BASE_URL.to_string());
        Self::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn health(&self) -> Result<(), CxdbClientError> {
        let response = self
            .client
            .get(self.endpoint("/health"))
            .send()
            .await
            .map_err(|error| CxdbClientError::Backend(error.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CxdbClientError::Backend(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    pub async fn create_context(
        &self,
        base_turn_id: Option<String>,
    ) -> Result<ContextInfo, CxdbClientError> {
        let body = CreateContextBody { base_turn_id };
        let response = self
            .post_with_legacy_fallback("/v1/contexts", "/v1/contexts/create", &body)
            .await?;
        decode_json(response).await
    }

    pub async fn append_turn_remote(
        &self,
        context_id: &ContextId,
        request: &AppendTurnRequest,
    ) -> Result<AppendTurnResponse, CxdbClientError> {
        let body = AppendTurnBody {
            parent_turn_id: request.parent_turn_id.clone(),
            type_id: request.type_id.clone(),
            type_version: request.type_version,
            payload: request.payload.clone(),
            idempotency_key: request.idempotency_key.clone(),
        };
        let canonical = format!("/v1/contexts/{context_id}/turns");
        let legacy = format!("/v1/contexts/{context_id}/append");
        let response = self
            .post_with_legacy_fallback(&canonical, &legacy, &body)
            .await;

        // A conflict carrying the already-stored turn is the server-side
        // dedupe answering a crash-retried append.
        match response {
            Ok(ok) => decode_json(ok).await,
            Err(CxdbClientError::Conflict(message)) => {
                if let Ok(existing) = serde_json::from_str::<AppendTurnResponse>(&message) {
                    return Ok(existing);
                }
                Err(CxdbClientError::Conflict(message))
            }
            Err(other) => Err(other),
        }
    }

    /// Best-effort append: bounded retries on backend failures. Callers treat
    /// a final error as a warning, never a run failure.
    pub async fn append_turn_with_retry(
        &self,
        context_id: &ContextId,
        request: &AppendTurnRequest,
    ) -> Result<AppendTurnResponse, CxdbClientError> {
        let mut last_error = None;
        for attempt in 0..APPEND_RETRY_ATTEMPTS {
            match self.append_turn_remote(context_id, request).await {
                Ok(response) => return Ok(response),
                Err(CxdbClientError::Backend(message)) => {
                    last_error = Some(CxdbClientError::Backend(message));
                    if attempt + 1 < APPEND_RETRY_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(
                            APPEND_RETRY_DELAY_MS << attempt,
                        ))
                        .await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_error
            .unwrap_or_else(|| CxdbClientError::Backend("append retries exhausted".to_string())))
    }

    pub async fn list_turns_remote(
        &self,
        context_id: &ContextId,
        before_turn_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Turn>, CxdbClientError> {
        let mut path = format!("/v1/contexts/{context_id}/turns?limit={limit}");
        if let Some(before) = before_turn_id {
            path.push_str(&format!("&before_turn_id={before}"));
        }
        let response = self
            .client
            .get(self.endpoint(&path))
            .send()
            .await
            .map_err(|error| CxdbClientError::Backend(error.to_string()))?;
        let listed: ListTurnsResponse = decode_json(check_status(response).await?).await?;
        Ok(listed.turns)
    }

    pub async fn get_head(&self, context_id: &ContextId) -> Result<ContextInfo, CxdbClientError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/v1/contexts/{context_id}")))
            .send()
            .await
            .map_err(|error| CxdbClientError::Backend(error.to_string()))?;
        decode_json(check_status(response).await?).await
    }

    pub async fn publish_registry_bundle(
        &self,
        bundle_id: &str,
        bundle_json: &Value,
    ) -> Result<(), CxdbClientError> {
        let response = self
            .client
            .put(self.endpoint(&format!("/v1/registry/bundles/{bundle_id}")))
            .json(bundle_json)
            .send()
            .await
            .map_err(|error| CxdbClientError::Backend(error.to_string()))?;
        check_status(response).await.map(|_| ())
    }

    async fn post_with_legacy_fallback<B: Serialize>(
        &self,
        canonical_path: &str,
        legacy_path: &str,
        body: &B,
    ) -> Result<reqwest::Response, CxdbClientError> {
        let response = self
            .client
            .post(self.endpoint(canonical_path))
            .json(body)
            .send()
            .await
            .map_err(|error| CxdbClientError::Backend(error.to_string()))?;

        if should_retry_on_other_path(response.status()) {
            let legacy = self
                .client
                .post(self.endpoint(legacy_path))
                .json(body)
                .send()
                .await
                .map_err(|error| CxdbClientError::Backend(error.to_string()))?;
            return check_status(legacy).await;
        }

        check_status(response).await
    }
}

fn should_retry_on_other_path(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::METHOD_NOT_ALLOWED
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CxdbClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let raw = response.text().await.unwrap_or_default();
    let envelope: ErrorEnvelope = serde_json::from_str(&raw).unwrap_or_default();
    let body = envelope.error.unwrap_or_default();
    let message = if body.message.is_empty() {
        format!("status {status}: {raw}")
    } else {
        match &body.details {
            Some(details) => format!("{} ({}): {details}", body.message, body.code),
            None => format!("{} ({})", body.message, body.code),
        }
    };

    Err(match status.as_u16() {
        404 => CxdbClientError::NotFound(message),
        409 => CxdbClientError::Conflict(if raw.is_empty() { message } else { raw }),
        400 | 422 => CxdbClientError::InvalidInput(message),
        _ => CxdbClientError::Backend(message),
    })
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, CxdbClientError> {
    response
        .json::<T>()
        .await
        .map_err(|error| CxdbClientError::Backend(format!("failed to decode response: {error}")))
}

#[async_trait::async_trait]
impl TurnStore for CxdbClient {
    async fn create_context(&self, base_turn_id: Option<String>) -> JournalResult<ContextInfo> {
        CxdbClient::create_context(self, base_turn_id)
            .await
            .map_err(JournalError::from)
    }

    async fn append_turn(&self, request: AppendTurnRequest) -> JournalResult<Turn> {
        let context_id = request.context_id.clone();
        let response = self
            .append_turn_with_retry(&context_id, &request)
            .await
            .map_err(JournalError::from)?;
        Ok(Turn {
            turn_id: response.turn_id,
            parent_turn_id: response.parent_turn_id,
            depth: response.depth,
            type_id: request.type_id,
            type_version: request.type_version,
            payload_hash: attractor_journal::payload_hash(&request.payload),
            payload: request.payload,
            created_at: String::new(),
            idempotency_key: Some(request.idempotency_key).filter(|value| !value.is_empty()),
        })
    }

    async fn get_head(&self, context_id: &ContextId) -> JournalResult<ContextInfo> {
        CxdbClient::get_head(self, context_id)
            .await
            .map_err(JournalError::from)
    }

    async fn list_turns(
        &self,
        context_id: &ContextId,
        before_turn_id: Option<&String>,
        limit: usize,
    ) -> JournalResult<Vec<Turn>> {
        self.list_turns_remote(context_id, before_turn_id.map(String::as_str), limit)
            .await
            .map_err(JournalError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joining_expected_single_slash() {
        let client = CxdbClient::new("http://localhost:9010/");
        assert_eq!(
            client.endpoint("/v1/contexts"),
            "http://localhost:9010/v1/contexts"
        );
        assert_eq!(client.endpoint("health"), "http://localhost:9010/health");
    }

    #[test]
    fn should_retry_on_other_path_expected_404_and_405_only() {
        assert!(should_retry_on_other_path(reqwest::StatusCode::NOT_FOUND));
        assert!(should_retry_on_other_path(
            reqwest::StatusCode::METHOD_NOT_ALLOWED
        ));
        assert!(!should_retry_on_other_path(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(!should_retry_on_other_path(reqwest::StatusCode::OK));
    }

    #[test]
    fn error_envelope_decode_expected_code_and_message() {
        let raw = r#"{"error":{"code":"not_found","message":"context missing","details":{"id":"9"}}}"#;
        let envelope: ErrorEnvelope = serde_json::from_str(raw).expect("envelope should decode");
        let body = envelope.error.expect("error body should be present");
        assert_eq!(body.code, "not_found");
        assert_eq!(body.message, "context missing");
        assert!(body.details.is_some());
    }
}
