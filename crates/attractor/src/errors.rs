use crate::Diagnostic;
use attractor_journal::JournalError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttractorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("parse error at byte {offset}: {message}")]
    Parse { message: String, offset: usize },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no edge matched for node '{node_id}' with outcome '{outcome}'")]
    Routing { node_id: String, outcome: String },

    #[error("loop through node '{node_id}' exceeded {iterations} iterations without progress")]
    LoopDivergence { node_id: String, iterations: u64 },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("no object generated: {message}")]
    NoObjectGenerated { message: String, raw_text: String },

    #[error("tool execution failed: {0}")]
    ToolExec(String),

    #[error("patch apply failed: {0}")]
    PatchApply(String),

    #[error("canceled: {reason}")]
    Cancel { reason: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("journal write failed: {0}")]
    JournalWrite(String),

    #[error("resume failed: {0}")]
    Resume(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl AttractorError {
    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel { .. })
    }
}

impl From<JournalError> for AttractorError {
    fn from(error: JournalError) -> Self {
        Self::JournalWrite(error.to_string())
    }
}

impl From<attractor_exec::ExecError> for AttractorError {
    fn from(error: attractor_exec::ExecError) -> Self {
        match error {
            attractor_exec::ExecError::Environment(message) => Self::ToolExec(message),
            attractor_exec::ExecError::PatchParse(message)
            | attractor_exec::ExecError::PatchApply(message) => Self::PatchApply(message),
        }
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {errors_count} error(s)")]
pub struct ValidationError {
    pub diagnostics: Vec<Diagnostic>,
    pub errors_count: usize,
}

impl ValidationError {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let errors_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            errors_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    InvalidRequest,
    Authentication,
    AccessDenied,
    NotFound,
    RequestTimeout,
    ContextLength,
    RateLimit,
    Server,
    Stream,
    Abort,
    Unknown,
}

impl ProviderErrorKind {
    /// Default retryability when the adapter does not say otherwise.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::RequestTimeout | Self::RateLimit | Self::Server | Self::Stream
        )
    }
}

#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("provider request failed ({kind:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    pub raw: Option<serde_json::Value>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            retry_after_ms: None,
            raw: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after_ms(mut self, delay_ms: u64) -> Self {
        self.retry_after_ms = Some(delay_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_kind_default_retryable_expected_transient_kinds_only() {
        assert!(ProviderErrorKind::RateLimit.default_retryable());
        assert!(ProviderErrorKind::Server.default_retryable());
        assert!(!ProviderErrorKind::Authentication.default_retryable());
        assert!(!ProviderErrorKind::InvalidRequest.default_retryable());
        assert!(!ProviderErrorKind::ContextLength.default_retryable());
    }

    #[test]
    fn exec_error_mapping_expected_tool_and_patch_variants() {
        let tool: AttractorError =
            attractor_exec::ExecError::Environment("spawn failed".to_string()).into();
        assert!(matches!(tool, AttractorError::ToolExec(_)));

        let patch: AttractorError =
            attractor_exec::ExecError::PatchApply("hunk mismatch".to_string()).into();
        assert!(matches!(patch, AttractorError::PatchApply(_)));
    }
}
