use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Normalized stage status. Well-known aliases collapse on parse
/// (`ok` -> success, `skip` -> skipped, `failure`/`error` -> fail); anything
/// else is a custom token matched case-sensitively.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum StageStatus {
    Success,
    Fail,
    Skipped,
    Canceled,
    Custom(String),
}

impl StageStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "success" | "ok" => Self::Success,
            "fail" | "failure" | "error" => Self::Fail,
            "skipped" | "skip" => Self::Skipped,
            "canceled" | "cancelled" => Self::Canceled,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
            Self::Canceled => "canceled",
            Self::Custom(token) => token,
        }
    }

    /// Canonical form of a raw status token.
    pub fn canonical(raw: &str) -> String {
        Self::parse(raw).as_str().to_string()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

impl From<StageStatus> for String {
    fn from(status: StageStatus) -> Self {
        status.as_str().to_string()
    }
}

impl From<String> for StageStatus {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientInfra,
    BudgetExhausted,
    CompilationLoop,
    Deterministic,
    Canceled,
    Structural,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientInfra => "transient_infra",
            Self::BudgetExhausted => "budget_exhausted",
            Self::CompilationLoop => "compilation_loop",
            Self::Deterministic => "deterministic",
            Self::Canceled => "canceled",
            Self::Structural => "structural",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub preferred_label: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub duration_ms: u64,
    pub notes: Option<String>,
    pub context_updates: BTreeMap<String, Value>,
    pub provider_raw: BTreeMap<String, Value>,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Success
    }
}

impl StageOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(class: FailureClass, reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            failure_class: Some(class),
            notes: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StageStatus::Skipped,
            ..Self::default()
        }
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Canceled,
            failure_class: Some(FailureClass::Canceled),
            notes: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_status_token(token: &str) -> Self {
        Self {
            status: StageStatus::parse(token),
            ..Self::default()
        }
    }

    /// Only transient infrastructure failures are retried by the scheduler.
    pub fn is_retryable(&self) -> bool {
        self.failure_class == Some(FailureClass::TransientInfra)
    }
}
