mod apply;
mod parser;
mod types;

pub use apply::apply_patch_operations;
pub use parser::parse_patch;
pub use types::{PatchHunk, PatchHunkLine, PatchOperation};

use crate::{ExecError, ExecutionEnvironment};
use std::sync::Arc;

/// Parses and applies a textual patch in one step.
pub async fn apply_patch(
    patch: &str,
    env: Arc<dyn ExecutionEnvironment>,
) -> Result<String, ExecError> {
    let operations = parse_patch(patch)?;
    apply_patch_operations(&operations, env).await
}
