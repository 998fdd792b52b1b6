//! Execution environment for Attractor stages.
//!
//! Tool stages and patch application go through the [`ExecutionEnvironment`]
//! trait; the local implementation runs children in their own process group
//! with a scrubbed environment and hard timeouts.

pub mod environment;
pub mod errors;
pub mod patch;

pub use environment::{
    DirEntry, ExecResult, ExecutionEnvironment, GrepOptions, LocalExecutionEnvironment,
    TIMEOUT_EXIT_CODE, default_env_strip_list, is_sensitive_env_var,
};
pub use errors::ExecError;
pub use patch::{apply_patch, apply_patch_operations, parse_patch};
