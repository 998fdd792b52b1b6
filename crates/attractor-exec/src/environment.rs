use crate::ExecError;
use async_trait::async_trait;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{Duration, sleep};

pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepOptions {
    pub glob_filter: Option<String>,
    pub case_insensitive: bool,
    pub max_results: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    async fn exec_command(
        &self,
        command: &str,
        timeout_ms: u64,
        working_dir: Option<&str>,
        env_overrides: Option<HashMap<String, String>>,
    ) -> Result<ExecResult, ExecError>;

    async fn read_file(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, ExecError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecError>;

    async fn edit_file(
        &self,
        path: &str,
        old_str: &str,
        new_str: &str,
        replace_all: bool,
    ) -> Result<usize, ExecError>;

    async fn delete_file(&self, path: &str) -> Result<(), ExecError>;
    async fn move_file(&self, from: &str, to: &str) -> Result<(), ExecError>;
    async fn file_exists(&self, path: &str) -> Result<bool, ExecError>;
    async fn list_directory(&self, path: &str, depth: usize) -> Result<Vec<DirEntry>, ExecError>;
    async fn glob(&self, pattern: &str, path: &str) -> Result<Vec<String>, ExecError>;
    async fn grep(
        &self,
        pattern: &str,
        path: &str,
        options: GrepOptions,
    ) -> Result<String, ExecError>;

    fn working_directory(&self) -> &Path;
    fn platform(&self) -> &str;
    fn os_version(&self) -> &str;
}

/// Local implementation. Children run in their own process group with a
/// scrubbed environment: the parent env minus sensitive keys and the
/// configured strip list, plus the run's base env and per-call overrides.
#[derive(Clone, Debug)]
pub struct LocalExecutionEnvironment {
    working_directory: PathBuf,
    platform: String,
    os_version: String,
    base_env: HashMap<String, String>,
    env_strip_list: Vec<String>,
    default_command_timeout_ms: u64,
    max_command_timeout_ms: u64,
}

impl LocalExecutionEnvironment {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            platform: std::env::consts::OS.to_string(),
            os_version: detect_os_version(),
            base_env: HashMap::new(),
            env_strip_list: default_env_strip_list(),
            default_command_timeout_ms: 10_000,
            max_command_timeout_ms: 600_000,
        }
    }

    pub fn with_base_env(mut self, base_env: HashMap<String, String>) -> Self {
        self.base_env = base_env;
        self
    }

    pub fn with_env_strip_list(mut self, strip_list: Vec<String>) -> Self {
        self.env_strip_list = strip_list;
        self
    }

    pub fn with_command_timeout_limits(
        mut self,
        default_timeout_ms: u64,
        max_timeout_ms: u64,
    ) -> Self {
        self.default_command_timeout_ms = default_timeout_ms.max(1);
        self.max_command_timeout_ms = max_timeout_ms.max(1);
        self
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_directory.join(path)
        }
    }

    fn effective_timeout_ms(&self, timeout_ms: u64) -> u64 {
        let requested = if timeout_ms == 0 {
            self.default_command_timeout_ms
        } else {
            timeout_ms
        };
        requested.min(self.max_command_timeout_ms)
    }

    fn build_command_env(
        &self,
        inherited_env: impl IntoIterator<Item = (String, String)>,
        env_overrides: Option<HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = inherited_env
            .into_iter()
            .filter(|(key, _)| !is_sensitive_env_var(key))
            .filter(|(key, _)| !self.env_strip_list.iter().any(|strip| strip == key))
            .collect();

        for (key, value) in &self.base_env {
            env.insert(key.clone(), value.clone());
        }
        if let Some(overrides) = env_overrides {
            for (key, value) in overrides {
                env.insert(key, value);
            }
        }
        env
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalExecutionEnvironment {
    async fn exec_command(
        &self,
        command: &str,
        timeout_ms: u64,
        working_dir: Option<&str>,
        env_overrides: Option<HashMap<String, String>>,
    ) -> Result<ExecResult, ExecError> {
        let started = Instant::now();
        let timeout_ms = self.effective_timeout_ms(timeout_ms);
        let working_dir = working_dir
            .map(|path| self.resolve_path(path))
            .unwrap_or_else(|| self.working_directory.clone());

        let mut cmd = build_shell_command(command);
        cmd.current_dir(working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let env = self.build_command_env(std::env::vars(), env_overrides);
        cmd.env_clear();
        cmd.envs(env);

        let mut child = cmd.spawn().map_err(|error| {
            ExecError::Environment(format!("failed to spawn command '{command}': {error}"))
        })?;

        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let mut timed_out = false;
        let status =
            match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait()).await {
                Ok(wait_result) => wait_result.map_err(|error| {
                    ExecError::Environment(format!(
                        "failed to wait for command '{command}': {error}"
                    ))
                })?,
                Err(_) => {
                    timed_out = true;
                    terminate_command(&mut child).await?;
                    child.wait().await.map_err(|error| {
                        ExecError::Environment(format!(
                            "failed to collect timed-out command '{command}': {error}"
                        ))
                    })?
                }
            };

        let stdout = String::from_utf8_lossy(&stdout_task.await.map_err(|error| {
            ExecError::Environment(format!("stdout reader task failed for '{command}': {error}"))
        })?)
        .to_string();
        let stderr = String::from_utf8_lossy(&stderr_task.await.map_err(|error| {
            ExecError::Environment(format!("stderr reader task failed for '{command}': {error}"))
        })?)
        .to_string();

        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            status.code().unwrap_or(-1)
        };

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn read_file(
        &self,
        path: &str,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String, ExecError> {
        let path = self.resolve_path(path);
        let content = tokio::fs::read_to_string(&path).await.map_err(|error| {
            ExecError::Environment(format!("failed to read '{}': {}", path.display(), error))
        })?;

        if offset.is_none() && limit.is_none() {
            return Ok(content);
        }

        let start = offset.unwrap_or(1).saturating_sub(1);
        let max_lines = limit.unwrap_or(usize::MAX);
        let lines: Vec<&str> = content.lines().collect();
        if start >= lines.len() {
            return Ok(String::new());
        }
        let end = start.saturating_add(max_lines).min(lines.len());
        Ok(lines[start..end].join("\n"))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecError> {
        let path = self.resolve_path(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                ExecError::Environment(format!(
                    "failed to create directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }
        tokio::fs::write(&path, content).await.map_err(|error| {
            ExecError::Environment(format!("failed to write '{}': {}", path.display(), error))
        })
    }

    async fn edit_file(
        &self,
        path: &str,
        old_str: &str,
        new_str: &str,
        replace_all: bool,
    ) -> Result<usize, ExecError> {
        let content = self.read_file(path, None, None).await?;
        let occurrences = content.matches(old_str).count();
        if occurrences == 0 {
            return Err(ExecError::Environment(format!(
                "edit target not found in '{path}'"
            )));
        }
        if !replace_all && occurrences > 1 {
            return Err(ExecError::Environment(format!(
                "edit target is ambiguous in '{path}' ({occurrences} occurrences)"
            )));
        }

        let (updated, replaced) = if replace_all {
            (content.replace(old_str, new_str), occurrences)
        } else {
            (content.replacen(old_str, new_str, 1), 1)
        };
        self.write_file(path, &updated).await?;
        Ok(replaced)
    }

    async fn delete_file(&self, path: &str) -> Result<(), ExecError> {
        let path = self.resolve_path(path);
        tokio::fs::remove_file(&path).await.map_err(|error| {
            ExecError::Environment(format!("failed to delete '{}': {}", path.display(), error))
        })
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<(), ExecError> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        if let Some(parent) = to_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                ExecError::Environment(format!(
                    "failed to create directory '{}': {}",
                    parent.display(),
                    error
                ))
            })?;
        }
        tokio::fs::rename(&from_path, &to_path).await.map_err(|error| {
            ExecError::Environment(format!(
                "failed to move '{}' to '{}': {}",
                from_path.display(),
                to_path.display(),
                error
            ))
        })
    }

    async fn file_exists(&self, path: &str) -> Result<bool, ExecError> {
        let path = self.resolve_path(path);
        Ok(tokio::fs::metadata(path).await.is_ok())
    }

    async fn list_directory(&self, path: &str, depth: usize) -> Result<Vec<DirEntry>, ExecError> {
        let root = self.resolve_path(path);
        let max_depth = depth.saturating_add(1);

        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&root)
            .min_depth(1)
            .max_depth(max_depth)
        {
            let entry = entry.map_err(|error| {
                ExecError::Environment(format!(
                    "failed to list directory '{}': {}",
                    root.display(),
                    error
                ))
            })?;
            let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let metadata = entry.metadata().map_err(|error| {
                ExecError::Environment(format!(
                    "failed to read metadata for '{}': {}",
                    entry.path().display(),
                    error
                ))
            })?;

            entries.push(DirEntry {
                name: relative.to_string_lossy().to_string(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_file() {
                    Some(metadata.len())
                } else {
                    None
                },
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn glob(&self, pattern: &str, path: &str) -> Result<Vec<String>, ExecError> {
        let root = self.resolve_path(path);
        let pattern_path = if Path::new(pattern).is_absolute() {
            PathBuf::from(pattern)
        } else {
            root.join(pattern)
        };
        let pattern_string = pattern_path.to_string_lossy().to_string();

        let mut matches = Vec::new();
        for entry in glob::glob(&pattern_string).map_err(|error| {
            ExecError::Environment(format!("invalid glob pattern '{pattern}': {error}"))
        })? {
            let entry = entry.map_err(|error| {
                ExecError::Environment(format!(
                    "glob match failed for '{pattern_string}': {error}"
                ))
            })?;
            matches.push(entry.to_string_lossy().to_string());
        }
        matches.sort();
        Ok(matches)
    }

    async fn grep(
        &self,
        pattern: &str,
        path: &str,
        options: GrepOptions,
    ) -> Result<String, ExecError> {
        let root = self.resolve_path(path);
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(options.case_insensitive)
            .build()
            .map_err(|error| {
                ExecError::Environment(format!("invalid regex '{pattern}': {error}"))
            })?;

        let glob_filter = options
            .glob_filter
            .as_ref()
            .map(|filter| glob::Pattern::new(filter))
            .transpose()
            .map_err(|error| {
                ExecError::Environment(format!("invalid glob filter in grep options: {error}"))
            })?;

        let mut matches = Vec::new();
        let max_results = options.max_results.unwrap_or(100);
        for file in enumerate_files(&root)? {
            if let Some(filter) = &glob_filter {
                if !filter.matches_path(&file) {
                    continue;
                }
            }
            let content = match tokio::fs::read_to_string(&file).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}:{}", file.display(), idx + 1, line));
                    if matches.len() >= max_results {
                        return Ok(matches.join("\n"));
                    }
                }
            }
        }
        Ok(matches.join("\n"))
    }

    fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    fn os_version(&self) -> &str {
        &self.os_version
    }
}

fn build_shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd.exe");
        cmd.arg("/c").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c").arg(command);
        cmd
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    match pipe {
        Some(mut reader) => {
            let mut bytes = Vec::new();
            let _ = reader.read_to_end(&mut bytes).await;
            bytes
        }
        None => Vec::new(),
    }
}

#[cfg(unix)]
async fn terminate_command(child: &mut Child) -> Result<(), ExecError> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    sleep(Duration::from_secs(2)).await;
    if child
        .try_wait()
        .map_err(|error| ExecError::Environment(format!("failed checking child status: {error}")))?
        .is_none()
    {
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_command(child: &mut Child) -> Result<(), ExecError> {
    child.kill().await.map_err(|error| {
        ExecError::Environment(format!("failed to terminate child process: {error}"))
    })
}

fn enumerate_files(path: &Path) -> Result<Vec<PathBuf>, ExecError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.exists() {
        return Err(ExecError::Environment(format!(
            "path not found for grep: {}",
            path.display()
        )));
    }

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|error| {
            ExecError::Environment(format!(
                "failed to walk path '{}' for grep: {}",
                path.display(),
                error
            ))
        })?;
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

fn detect_os_version() -> String {
    #[cfg(unix)]
    {
        if let Ok(output) = std::process::Command::new("uname").arg("-r").output() {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !text.is_empty() {
                    return text;
                }
            }
        }
    }
    "unknown".to_string()
}

pub fn default_env_strip_list() -> Vec<String> {
    ["CLAUDECODE", "CLAUDE_CODE_SSE_PORT"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn is_sensitive_env_var(key: &str) -> bool {
    let key = key.to_ascii_uppercase();
    key.ends_with("_API_KEY")
        || key.contains("SECRET")
        || key.ends_with("_TOKEN")
        || key.ends_with("_PASSWORD")
        || key.ends_with("_CREDENTIAL")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test(flavor = "current_thread")]
    async fn read_write_and_edit_work_for_local_environment() {
        let dir = tempdir().expect("temp dir should be created");
        let env = LocalExecutionEnvironment::new(dir.path());
        env.write_file("nested/file.txt", "a\nb\nc")
            .await
            .expect("write should succeed");

        let content = env
            .read_file("nested/file.txt", Some(2), Some(1))
            .await
            .expect("read should succeed");
        assert_eq!(content, "b");

        let replaced = env
            .edit_file("nested/file.txt", "b", "beta", false)
            .await
            .expect("edit should succeed");
        assert_eq!(replaced, 1);
        let content = env
            .read_file("nested/file.txt", None, None)
            .await
            .expect("read should succeed");
        assert_eq!(content, "a\nbeta\nc");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn edit_file_ambiguous_without_replace_all_expected_error() {
        let dir = tempdir().expect("temp dir should be created");
        let env = LocalExecutionEnvironment::new(dir.path());
        env.write_file("f.txt", "x x x")
            .await
            .expect("write should succeed");

        let error = env
            .edit_file("f.txt", "x", "y", false)
            .await
            .expect_err("ambiguous edit should fail");
        assert!(error.to_string().contains("ambiguous"));

        let replaced = env
            .edit_file("f.txt", "x", "y", true)
            .await
            .expect("replace all should succeed");
        assert_eq!(replaced, 3);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exec_command_timeout_expected_exit_124_and_fast_return() {
        let dir = tempdir().expect("temp dir should be created");
        let env = LocalExecutionEnvironment::new(dir.path())
            .with_command_timeout_limits(10_000, 600_000);

        let started = std::time::Instant::now();
        let result = env
            .exec_command("sleep 30", 50, None, None)
            .await
            .expect("command should return a timeout result");

        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn exec_command_captures_stdout_and_exit_code() {
        let dir = tempdir().expect("temp dir should be created");
        let env = LocalExecutionEnvironment::new(dir.path());

        let result = env
            .exec_command("echo hello; exit 3", 5_000, None, None)
            .await
            .expect("command should run");
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
    }

    #[test]
    fn env_filtering_drops_sensitive_and_stripped_keys() {
        let env = LocalExecutionEnvironment::new(".").with_base_env(HashMap::from([(
            "RUN_ID".to_string(),
            "r1".to_string(),
        )]));
        let filtered = env.build_command_env(
            BTreeMap::from([
                ("PATH".to_string(), "/bin".to_string()),
                ("SERVICE_API_KEY".to_string(), "secret".to_string()),
                ("MY_SECRET_SAUCE".to_string(), "secret".to_string()),
                ("CLAUDECODE".to_string(), "1".to_string()),
                ("CLAUDE_CODE_SSE_PORT".to_string(), "4141".to_string()),
            ]),
            Some(HashMap::from([(
                "STAGE_ID".to_string(),
                "plan".to_string(),
            )])),
        );

        assert_eq!(filtered.get("PATH"), Some(&"/bin".to_string()));
        assert!(!filtered.contains_key("SERVICE_API_KEY"));
        assert!(!filtered.contains_key("MY_SECRET_SAUCE"));
        assert!(!filtered.contains_key("CLAUDECODE"));
        assert!(!filtered.contains_key("CLAUDE_CODE_SSE_PORT"));
        assert_eq!(filtered.get("RUN_ID"), Some(&"r1".to_string()));
        assert_eq!(filtered.get("STAGE_ID"), Some(&"plan".to_string()));
    }

    #[test]
    fn timeout_value_zero_uses_default_and_clamps_to_max() {
        let env = LocalExecutionEnvironment::new(".").with_command_timeout_limits(10_000, 600_000);
        assert_eq!(env.effective_timeout_ms(0), 10_000);
        assert_eq!(env.effective_timeout_ms(700_000), 600_000);
    }
}
