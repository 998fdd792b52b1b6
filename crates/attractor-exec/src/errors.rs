use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("execution environment error: {0}")]
    Environment(String),

    #[error("patch parse error: {0}")]
    PatchParse(String),

    #[error("patch apply error: {0}")]
    PatchApply(String),
}
