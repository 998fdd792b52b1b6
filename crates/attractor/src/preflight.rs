use crate::{
    AttractorError, PreflightReport, RunFileConfig, build_preflight_report,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

pub const DEFAULT_STALE_BUILD_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Runs provider resolution for every configured provider and, when a logs
/// root is known, persists `preflight_report.json` next to the manifest.
pub fn run_preflight(
    config: &RunFileConfig,
    allow_test_shim: bool,
    logs_root: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> Result<PreflightReport, AttractorError> {
    config.validate()?;
    let report = build_preflight_report(
        config.llm.cli_profile,
        allow_test_shim,
        &config.provider_executables(),
        env,
    )?;
    if let Some(logs_root) = logs_root {
        crate::artifacts::write_preflight_report(logs_root, &report)?;
    }
    Ok(report)
}

/// Aborts when the running binary predates the repository's newest source
/// change by more than the threshold, unless the caller confirmed.
pub fn check_stale_build(
    repo_path: &Path,
    threshold: Duration,
    confirmed: bool,
) -> Result<(), AttractorError> {
    let binary_path = std::env::current_exe().map_err(|error| {
        AttractorError::Configuration(format!("cannot locate running binary: {error}"))
    })?;
    let binary_mtime = mtime_of(&binary_path)?;
    let Some(newest_source) = newest_source_mtime(repo_path) else {
        return Ok(());
    };

    let gap = newest_source
        .duration_since(binary_mtime)
        .unwrap_or(Duration::ZERO);
    if gap <= threshold {
        return Ok(());
    }
    if confirmed {
        return Ok(());
    }

    Err(AttractorError::Configuration(format!(
        "the running binary is older than the newest source change in '{}' by {}s; \
         rebuild, or pass --confirm-stale-build to run anyway",
        repo_path.display(),
        gap.as_secs()
    )))
}

fn mtime_of(path: &Path) -> Result<SystemTime, AttractorError> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|error| {
            AttractorError::Configuration(format!(
                "cannot stat '{}': {}",
                path.display(),
                error
            ))
        })
}

fn newest_source_mtime(repo_path: &Path) -> Option<SystemTime> {
    const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv"];

    let mut newest = None;
    for entry in walkdir::WalkDir::new(repo_path)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| !SKIP_DIRS.contains(&name))
                .unwrap_or(true)
        })
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(Ok(modified)) = entry.metadata().map(|metadata| metadata.modified()) {
            newest = Some(match newest {
                Some(current) if current >= modified => current,
                _ => modified,
            });
        }
    }
    newest
}
