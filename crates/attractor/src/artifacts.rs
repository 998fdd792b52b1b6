use crate::{AttractorError, PreflightReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const PID_FILE_NAME: &str = "run.pid";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const FINAL_FILE_NAME: &str = "final.json";
pub const PREFLIGHT_FILE_NAME: &str = "preflight_report.json";
pub const MODELDB_DIR_NAME: &str = "modeldb";

/// Written once at run start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub graph_name: String,
    pub goal: Option<String>,
    pub started_at: String,
    pub logs_root: String,
    pub repo_path: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub cxdb_context_id: Option<String>,
    pub run_branch: Option<String>,
}

/// The last write before PID cleanup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub status: String,
    pub ended_at: String,
    pub final_commit_sha: Option<String>,
    pub warning_count: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunLiveness {
    /// No `run.pid` file: the run is not running.
    NotRunning,
    Running(u32),
    /// `run.pid` exists but the process is gone.
    StalePid(u32),
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AttractorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            AttractorError::Runtime(format!(
                "failed to create directory '{}': {}",
                parent.display(),
                error
            ))
        })?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|error| AttractorError::Runtime(format!("failed to serialize: {error}")))?;
    fs::write(path, bytes).map_err(|error| {
        AttractorError::Runtime(format!("failed to write '{}': {}", path.display(), error))
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, AttractorError> {
    let bytes = fs::read(path).map_err(|error| {
        AttractorError::Runtime(format!("failed to read '{}': {}", path.display(), error))
    })?;
    serde_json::from_slice(&bytes).map_err(|error| {
        AttractorError::Runtime(format!(
            "failed to deserialize '{}': {}",
            path.display(),
            error
        ))
    })
}

pub fn write_manifest(logs_root: &Path, manifest: &RunManifest) -> Result<(), AttractorError> {
    write_json(&logs_root.join(MANIFEST_FILE_NAME), manifest)
}

pub fn read_manifest(logs_root: &Path) -> Result<RunManifest, AttractorError> {
    read_json(&logs_root.join(MANIFEST_FILE_NAME))
}

pub fn write_final_report(logs_root: &Path, report: &FinalReport) -> Result<(), AttractorError> {
    write_json(&logs_root.join(FINAL_FILE_NAME), report)
}

pub fn read_final_report(logs_root: &Path) -> Result<FinalReport, AttractorError> {
    read_json(&logs_root.join(FINAL_FILE_NAME))
}

pub fn write_preflight_report(
    logs_root: &Path,
    report: &PreflightReport,
) -> Result<(), AttractorError> {
    write_json(&logs_root.join(PREFLIGHT_FILE_NAME), report)
}

pub fn write_pid_file(logs_root: &Path) -> Result<(), AttractorError> {
    fs::create_dir_all(logs_root).map_err(|error| {
        AttractorError::Runtime(format!(
            "failed to create logs root '{}': {}",
            logs_root.display(),
            error
        ))
    })?;
    let path = logs_root.join(PID_FILE_NAME);
    fs::write(&path, std::process::id().to_string()).map_err(|error| {
        AttractorError::Runtime(format!("failed to write '{}': {}", path.display(), error))
    })
}

pub fn read_pid_file(logs_root: &Path) -> Option<u32> {
    let raw = fs::read_to_string(logs_root.join(PID_FILE_NAME)).ok()?;
    raw.trim().parse().ok()
}

pub fn remove_pid_file(logs_root: &Path) {
    let _ = fs::remove_file(logs_root.join(PID_FILE_NAME));
}

pub fn probe_liveness(logs_root: &Path) -> RunLiveness {
    match read_pid_file(logs_root) {
        None => RunLiveness::NotRunning,
        Some(pid) => {
            if pid_alive(pid) {
                RunLiveness::Running(pid)
            } else {
                RunLiveness::StalePid(pid)
            }
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        // Without a portable probe, assume a recorded PID is live.
        let _ = pid;
        true
    }
}

pub fn modeldb_dir(logs_root: &Path) -> std::path::PathBuf {
    logs_root.join(MODELDB_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> RunManifest {
        RunManifest {
            run_id: "run-1".to_string(),
            graph_name: "g".to_string(),
            goal: Some("ship".to_string()),
            started_at: "2026-02-10T10:00:00.000000000Z".to_string(),
            logs_root: "/tmp/logs".to_string(),
            repo_path: None,
            labels: BTreeMap::from([("team".to_string(), "infra".to_string())]),
            cxdb_context_id: Some("7".to_string()),
            run_branch: Some("attractor/run/run-1".to_string()),
        }
    }

    #[test]
    fn manifest_round_trip() {
        let dir = TempDir::new().expect("temp dir should be created");
        write_manifest(dir.path(), &manifest()).expect("manifest should write");
        let read_back = read_manifest(dir.path()).expect("manifest should read");
        assert_eq!(read_back, manifest());
    }

    #[test]
    fn final_report_round_trip() {
        let dir = TempDir::new().expect("temp dir should be created");
        let report = FinalReport {
            status: "success".to_string(),
            ended_at: "2026-02-10T11:00:00.000000000Z".to_string(),
            final_commit_sha: None,
            warning_count: 2,
        };
        write_final_report(dir.path(), &report).expect("final report should write");
        let read_back = read_final_report(dir.path()).expect("final report should read");
        assert_eq!(read_back, report);
    }

    #[test]
    fn pid_file_lifecycle_and_liveness() {
        let dir = TempDir::new().expect("temp dir should be created");
        assert_eq!(probe_liveness(dir.path()), RunLiveness::NotRunning);

        write_pid_file(dir.path()).expect("pid file should write");
        assert_eq!(
            probe_liveness(dir.path()),
            RunLiveness::Running(std::process::id())
        );

        remove_pid_file(dir.path());
        assert_eq!(probe_liveness(dir.path()), RunLiveness::NotRunning);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stale_pid_detected() {
        let dir = TempDir::new().expect("temp dir should be created");
        std::fs::write(dir.path().join(PID_FILE_NAME), "999999999")
            .expect("pid file should write");
        assert_eq!(probe_liveness(dir.path()), RunLiveness::StalePid(999999999));
    }
}
