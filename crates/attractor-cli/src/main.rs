use attractor::{
    Diagnostic, FinishReason, InterviewDesk, ModelCatalog, PipelineRunner, ProviderAdapter,
    ProviderError, ProviderErrorKind, ProviderRequest, ProviderResponse, RunConfig, RunFileConfig,
    RunStatus, RuntimeEvent, RuntimeEventKind, RuntimeEventSink, Usage, cancel_pair, env_snapshot,
    parse_graph_text, run_preflight, runtime_event_channel, validate,
};
use attractor::handlers::human_gate::HumanGateHandler;
use attractor::handlers::llm::LlmStageHandler;
use attractor::handlers::registry::{RegistryStageExecutor, base_registry};
use attractor::handlers::tool::ToolStageHandler;
use attractor_cxdb::CxdbClient;
use attractor_exec::{ExecutionEnvironment, LocalExecutionEnvironment};
use clap::{ArgAction, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "attractor")]
#[command(about = "Graph-driven runner for multi-stage LLM engineering runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Resume(ResumeArgs),
    Validate(ValidateArgs),
    Stop(StopArgs),
    Status(StatusArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    graph: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    logs_root: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    allow_test_shim: bool,
    #[arg(long = "no-cxdb", action = ArgAction::SetTrue)]
    no_cxdb: bool,
    /// provider=model override applied to every LLM stage.
    #[arg(long)]
    force_model: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    confirm_stale_build: bool,
    /// Re-exec in the background and return immediately; `stop` and
    /// `status` address the detached run through its logs root.
    #[arg(long, action = ArgAction::SetTrue)]
    detach: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    graph: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, conflicts_with_all = ["cxdb", "run_branch"])]
    logs_root: Option<PathBuf>,
    #[arg(long, requires = "context_id")]
    cxdb: Option<String>,
    #[arg(long)]
    context_id: Option<String>,
    #[arg(long)]
    run_branch: Option<String>,
    #[arg(long)]
    repo: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    allow_test_shim: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    #[arg(long)]
    graph: Option<PathBuf>,
    #[arg(long, num_args = 1..)]
    batch: Vec<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct StopArgs {
    #[arg(long)]
    logs_root: PathBuf,
    #[arg(long, default_value_t = 5000)]
    grace_ms: u64,
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct StatusArgs {
    #[arg(long)]
    logs_root: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    load_env_files();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Resume(args) => resume_command(args).await,
        Commands::Validate(args) => validate_command(args),
        Commands::Stop(args) => stop_command(args).await,
        Commands::Status(args) => status_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn load_env_files() {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
}

fn detach_run(args: &RunArgs) -> Result<ExitCode, String> {
    let logs_root = args
        .logs_root
        .as_ref()
        .ok_or_else(|| "--detach requires --logs-root".to_string())?;
    std::fs::create_dir_all(logs_root)
        .map_err(|error| format!("failed to create logs root: {error}"))?;
    let log_file = std::fs::File::create(logs_root.join("run.log"))
        .map_err(|error| format!("failed to create run.log: {error}"))?;

    let exe = std::env::current_exe()
        .map_err(|error| format!("cannot locate running binary: {error}"))?;
    let forwarded: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--detach")
        .collect();
    let child = std::process::Command::new(exe)
        .args(forwarded)
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone().map_err(|error| error.to_string())?)
        .stderr(log_file)
        .spawn()
        .map_err(|error| format!("failed to spawn detached run: {error}"))?;

    println!("detached run pid: {}", child.id());
    println!("logs_root: {}", logs_root.display());
    Ok(ExitCode::SUCCESS)
}

fn load_run_file_config(path: Option<&Path>) -> Result<RunFileConfig, String> {
    match path {
        Some(path) => RunFileConfig::load(path).map_err(|error| error.to_string()),
        None => Ok(RunFileConfig::default()),
    }
}

fn load_catalog(config: &RunFileConfig) -> Result<Option<ModelCatalog>, String> {
    match config.modeldb.as_ref() {
        Some(modeldb) => ModelCatalog::load(Path::new(&modeldb.catalog_path))
            .map(Some)
            .map_err(|error| error.to_string()),
        None => Ok(None),
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    if args.detach {
        return detach_run(&args);
    }

    let source =
        std::fs::read_to_string(&args.graph).map_err(|error| {
            format!("failed reading graph '{}': {error}", args.graph.display())
        })?;
    let mut graph = parse_graph_text(&source).map_err(|error| error.to_string())?;
    let config = load_run_file_config(args.config.as_deref())?;
    let catalog = load_catalog(&config)?;

    if let Some(force_model) = args.force_model.as_deref() {
        apply_force_model(&mut graph, force_model)?;
    }

    let diagnostics = validate(&graph, catalog.as_ref());
    print_diagnostics(&diagnostics, false);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Ok(ExitCode::from(1));
    }

    let repo_path = config
        .repo
        .as_ref()
        .map(|repo| PathBuf::from(&repo.path));
    if let Some(repo) = repo_path.as_ref() {
        attractor::check_stale_build(
            repo,
            attractor::DEFAULT_STALE_BUILD_THRESHOLD,
            args.confirm_stale_build,
        )
        .map_err(|error| error.to_string())?;
    }

    let env = env_snapshot();
    let preflight = run_preflight(
        &config,
        args.allow_test_shim,
        args.logs_root.as_deref(),
        &env,
    )
    .map_err(|error| error.to_string())?;
    if let Some(catalog) = catalog.as_ref() {
        if let Some(logs_root) = args.logs_root.as_ref() {
            catalog
                .save_snapshot(logs_root)
                .map_err(|error| error.to_string())?;
        }
    }

    let remote_store = if args.no_cxdb {
        None
    } else {
        config
            .cxdb
            .as_ref()
            .and_then(|cxdb| cxdb.http_base_url.clone())
            .map(|base_url| {
                Arc::new(CxdbClient::new(base_url)) as Arc<dyn attractor_journal::TurnStore>
            })
    };

    let (cancel_handle, cancel) = cancel_pair();
    spawn_signal_task(cancel_handle);
    let (event_sink, event_task) = event_stream(args.event_json);

    let desk = InterviewDesk::new();
    let executor = build_executor(&config, &preflight, repo_path.as_deref(), desk.clone())?;

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                run_id: args.run_id,
                logs_root: args.logs_root,
                repo_path,
                events: event_sink,
                executor,
                remote_store,
                cancel,
                interview_desk: desk,
                ..RunConfig::default()
            },
        )
        .await
        .map_err(|error| error.to_string())?;

    if let Some(task) = event_task {
        task.abort();
    }
    print_run_summary(&result);
    Ok(exit_code_for_status(result.status))
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode, String> {
    let source =
        std::fs::read_to_string(&args.graph).map_err(|error| {
            format!("failed reading graph '{}': {error}", args.graph.display())
        })?;
    let graph = parse_graph_text(&source).map_err(|error| error.to_string())?;
    let config = load_run_file_config(args.config.as_deref())?;

    let (resume, logs_root) = if let Some(logs_root) = args.logs_root {
        let state =
            attractor::resume_from_logs_root(&logs_root).map_err(|error| error.to_string())?;
        (state, logs_root)
    } else if let (Some(base_url), Some(context_id)) = (&args.cxdb, &args.context_id) {
        let client = CxdbClient::new(base_url.clone());
        let state = attractor::resume_from_cxdb(&client, context_id)
            .await
            .map_err(|error| error.to_string())?;
        let logs_root = std::env::temp_dir().join(format!("attractor-resume-{}", state.run_id));
        (state, logs_root)
    } else if let Some(branch) = &args.run_branch {
        let repo = args.repo.clone().unwrap_or_else(|| PathBuf::from("."));
        let env = LocalExecutionEnvironment::new(repo.clone());
        let branch_state = attractor::read_run_branch_state(&env, branch, Some(&repo))
            .await
            .map_err(|error| error.to_string())?;
        let logs_root = PathBuf::from(&branch_state.logs_root);
        let state =
            attractor::resume_from_logs_root(&logs_root).map_err(|error| error.to_string())?;
        (state, logs_root)
    } else {
        return Err("one of --logs-root, --cxdb --context-id, or --run-branch is required"
            .to_string());
    };

    let env = env_snapshot();
    let preflight = run_preflight(&config, args.allow_test_shim, Some(&logs_root), &env)
        .map_err(|error| error.to_string())?;

    let repo_path = config.repo.as_ref().map(|repo| PathBuf::from(&repo.path));
    let (cancel_handle, cancel) = cancel_pair();
    spawn_signal_task(cancel_handle);
    let (event_sink, event_task) = event_stream(args.event_json);

    let desk = InterviewDesk::new();
    let executor = build_executor(&config, &preflight, repo_path.as_deref(), desk.clone())?;
    let run_id = resume.run_id.clone();

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                run_id: Some(run_id),
                logs_root: Some(logs_root),
                repo_path,
                events: event_sink,
                executor,
                cancel,
                interview_desk: desk,
                resume: Some(resume),
                ..RunConfig::default()
            },
        )
        .await
        .map_err(|error| error.to_string())?;

    if let Some(task) = event_task {
        task.abort();
    }
    print_run_summary(&result);
    Ok(exit_code_for_status(result.status))
}

fn validate_command(args: ValidateArgs) -> Result<ExitCode, String> {
    let catalog = match args.catalog.as_deref() {
        Some(path) => Some(ModelCatalog::load(path).map_err(|error| error.to_string())?),
        None => None,
    };

    let mut files = args.batch.clone();
    if let Some(single) = args.graph.clone() {
        files.insert(0, single);
    }
    if files.is_empty() {
        return Err("one of --graph or --batch is required".to_string());
    }
    let batch = files.len() > 1;

    let mut error_files = 0usize;
    let mut warning_files = 0usize;
    for path in &files {
        let diagnostics = match std::fs::read_to_string(path)
            .map_err(|error| error.to_string())
            .and_then(|source| {
                parse_graph_text(&source).map_err(|error| error.to_string())
            }) {
            Ok(graph) => validate(&graph, catalog.as_ref()),
            Err(message) => {
                vec![Diagnostic::new(
                    "parse",
                    attractor::Severity::Error,
                    message,
                )]
            }
        };

        if batch {
            println!("== {}", path.display());
        }
        print_diagnostics(&diagnostics, args.json);
        if diagnostics.iter().any(Diagnostic::is_error) {
            error_files += 1;
        } else if diagnostics.iter().any(Diagnostic::is_warning) {
            warning_files += 1;
        }
    }

    if batch {
        println!(
            "Total files: {} ({} with errors, {} with warnings)",
            files.len(),
            error_files,
            warning_files
        );
    }

    Ok(ExitCode::from(validate_exit_code(error_files, warning_files)))
}

/// 0 clean, 1 any error, 2 warnings only.
fn validate_exit_code(error_files: usize, warning_files: usize) -> u8 {
    if error_files > 0 {
        1
    } else if warning_files > 0 {
        2
    } else {
        0
    }
}

async fn stop_command(args: StopArgs) -> Result<ExitCode, String> {
    match attractor::probe_liveness(&args.logs_root) {
        attractor::RunLiveness::NotRunning => {
            println!("not running");
            Ok(ExitCode::SUCCESS)
        }
        attractor::RunLiveness::StalePid(pid) => {
            println!("stale pid file (pid {pid} is gone); removing");
            attractor::artifacts::remove_pid_file(&args.logs_root);
            Ok(ExitCode::SUCCESS)
        }
        attractor::RunLiveness::Running(pid) => {
            signal_process(pid, false)?;
            tokio::time::sleep(std::time::Duration::from_millis(args.grace_ms)).await;
            if matches!(
                attractor::probe_liveness(&args.logs_root),
                attractor::RunLiveness::Running(_)
            ) {
                if args.force {
                    signal_process(pid, true)?;
                    println!("force-killed pid {pid}");
                } else {
                    println!("pid {pid} still running after {}ms grace", args.grace_ms);
                    return Ok(ExitCode::from(1));
                }
            } else {
                println!("stopped pid {pid}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn status_command(args: StatusArgs) -> Result<ExitCode, String> {
    let manifest = attractor::read_manifest(&args.logs_root).ok();
    let final_report = attractor::read_final_report(&args.logs_root).ok();
    let liveness = attractor::probe_liveness(&args.logs_root);

    match manifest {
        Some(manifest) => {
            println!("run_id: {}", manifest.run_id);
            println!("graph: {}", manifest.graph_name);
            if let Some(goal) = manifest.goal.as_deref() {
                println!("goal: {goal}");
            }
            println!("started_at: {}", manifest.started_at);
        }
        None => println!("no manifest found under {}", args.logs_root.display()),
    }
    match liveness {
        attractor::RunLiveness::Running(pid) => println!("state: running (pid {pid})"),
        attractor::RunLiveness::StalePid(pid) => println!("state: crashed (stale pid {pid})"),
        attractor::RunLiveness::NotRunning => match final_report.as_ref() {
            Some(report) => println!("state: finished ({})", report.status),
            None => println!("state: not running"),
        },
    }
    if let Some(report) = final_report {
        println!("ended_at: {}", report.ended_at);
        println!("warnings: {}", report.warning_count);
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(unix)]
fn signal_process(pid: u32, force: bool) -> Result<(), String> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|error| format!("failed to signal pid {pid}: {error}"))
}

#[cfg(not(unix))]
fn signal_process(_pid: u32, _force: bool) -> Result<(), String> {
    Err("stop is only supported on unix hosts".to_string())
}

fn spawn_signal_task(handle: attractor::CancelHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => handle.cancel("stopped by signal SIGINT"),
                _ = sigterm.recv() => handle.cancel("stopped by signal SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.cancel("stopped by signal SIGINT");
            }
        }
    });
}

fn event_stream(event_json: bool) -> (RuntimeEventSink, Option<tokio::task::JoinHandle<()>>) {
    let (tx, mut rx) = runtime_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RuntimeEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RuntimeEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_kind_label(&event.kind)
    );
}

fn event_kind_label(kind: &RuntimeEventKind) -> &'static str {
    match kind {
        RuntimeEventKind::Run(_) => "run",
        RuntimeEventKind::Stage(_) => "stage",
        RuntimeEventKind::FanOut(_) => "fan_out",
        RuntimeEventKind::Interview(_) => "interview",
        RuntimeEventKind::Warning(_) => "warning",
    }
}

fn print_diagnostics(diagnostics: &[Diagnostic], json: bool) {
    for diagnostic in diagnostics {
        if json {
            if let Ok(line) = serde_json::to_string(diagnostic) {
                println!("{line}");
                continue;
            }
        }
        let location = match (&diagnostic.node_id, &diagnostic.edge) {
            (Some(node_id), _) => format!(" [{node_id}]"),
            (None, Some((from, to))) => format!(" [{from} -> {to}]"),
            _ => String::new(),
        };
        println!(
            "{}: {}{}: {}",
            match diagnostic.severity {
                attractor::Severity::Error => "error",
                attractor::Severity::Warning => "warning",
                attractor::Severity::Info => "info",
            },
            diagnostic.rule,
            location,
            diagnostic.message
        );
        if let Some(fix) = diagnostic.fix.as_deref() {
            println!("    fix: {fix}");
        }
    }
}

fn print_run_summary(result: &attractor::RunResult) {
    println!("run_id: {}", result.run_id);
    println!("status: {}", result.status.as_str());
    println!("completed_nodes: {}", result.completed_nodes.join(", "));
    println!("warnings: {}", result.warning_count);
    if let Some(reason) = result.failure_reason.as_deref() {
        println!("failure_reason: {reason}");
    }
}

fn exit_code_for_status(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Success => ExitCode::SUCCESS,
        RunStatus::Fail | RunStatus::Canceled => ExitCode::from(1),
    }
}

fn apply_force_model(graph: &mut attractor::Graph, force_model: &str) -> Result<(), String> {
    let Some((provider, model)) = force_model.split_once('=') else {
        return Err("--force-model expects provider=model".to_string());
    };
    for node in graph.nodes.values_mut() {
        if node.prompt().is_some() {
            node.attrs.set_explicit(
                "provider",
                attractor::AttrValue::String(provider.to_string()),
            );
            node.attrs
                .set_explicit("model", attractor::AttrValue::String(model.to_string()));
        }
    }
    Ok(())
}

fn build_executor(
    config: &RunFileConfig,
    preflight: &attractor::PreflightReport,
    repo_path: Option<&Path>,
    desk: InterviewDesk,
) -> Result<Arc<dyn attractor::handlers::StageHandler>, String> {
    let working_dir = repo_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let exec_env: Arc<dyn ExecutionEnvironment> = Arc::new(
        LocalExecutionEnvironment::new(working_dir).with_base_env(
            config.env_overrides().into_iter().collect(),
        ),
    );

    let adapter = Arc::new(SubprocessProviderAdapter {
        executables: preflight
            .providers
            .iter()
            .map(|(provider, entry)| (provider.clone(), entry.resolved_path.clone()))
            .collect(),
        env: Arc::clone(&exec_env),
    });

    let mut registry = base_registry();
    registry.register_type("llm", Arc::new(LlmStageHandler::new(adapter)));
    registry.register_type("tool", Arc::new(ToolStageHandler::new(exec_env)));
    registry.register_type("wait.human", Arc::new(HumanGateHandler::new(desk)));
    Ok(Arc::new(RegistryStageExecutor::new(registry)))
}

/// Vendor-CLI provider adapter: runs the resolved executable with the prompt
/// in `ATTRACTOR_PROMPT`; stdout is the assistant text. This is the host-side
/// collaborator the core's abstract provider interface expects, and the
/// executable is always the exec-policy resolution — never composed here.
struct SubprocessProviderAdapter {
    executables: BTreeMap<String, String>,
    env: Arc<dyn ExecutionEnvironment>,
}

#[async_trait::async_trait]
impl ProviderAdapter for SubprocessProviderAdapter {
    fn name(&self) -> &str {
        "cli"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let executable = self
            .executables
            .get(&request.provider)
            .or_else(|| self.executables.values().next())
            .ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::InvalidRequest,
                    format!("no executable resolved for provider '{}'", request.provider),
                )
            })?;

        let prompt = request
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("ATTRACTOR_PROMPT".to_string(), prompt);
        if let Some(model) = request.model.as_deref() {
            overrides.insert("ATTRACTOR_MODEL".to_string(), model.to_string());
        }

        let result = self
            .env
            .exec_command(executable, 0, None, Some(overrides))
            .await
            .map_err(|error| {
                ProviderError::new(ProviderErrorKind::Unknown, error.to_string())
            })?;

        if result.timed_out {
            return Err(ProviderError::new(
                ProviderErrorKind::RequestTimeout,
                "provider cli timed out",
            ));
        }
        if result.exit_code != 0 {
            return Err(ProviderError::new(
                ProviderErrorKind::Server,
                format!(
                    "provider cli exited with code {}: {}",
                    result.exit_code,
                    result.stderr.trim()
                ),
            ));
        }

        Ok(ProviderResponse {
            text: result.stdout,
            tool_calls: Vec::new(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            raw: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_exit_code_classes() {
        assert_eq!(validate_exit_code(0, 0), 0);
        assert_eq!(validate_exit_code(0, 1), 2);
        assert_eq!(validate_exit_code(1, 0), 1);
        assert_eq!(validate_exit_code(1, 3), 1);
    }

    #[test]
    fn apply_force_model_sets_provider_and_model_on_llm_stages() {
        let mut graph = parse_graph_text(
            r#"
            digraph G {
                start [shape=Mdiamond]
                plan [prompt="Plan"]
                t [shape=parallelogram, tool_command="true"]
                exit [shape=Msquare]
                start -> plan -> t -> exit
            }
            "#,
        )
        .expect("graph should parse");

        apply_force_model(&mut graph, "anthropic=claude-opus-4.6")
            .expect("force model should apply");
        let plan = graph.nodes.get("plan").expect("plan should exist");
        assert_eq!(plan.attrs.get_str("provider"), Some("anthropic"));
        assert_eq!(plan.attrs.get_str("model"), Some("claude-opus-4.6"));
        let tool = graph.nodes.get("t").expect("tool should exist");
        assert_eq!(tool.attrs.get_str("model"), None);
    }

    #[test]
    fn apply_force_model_rejects_malformed_value() {
        let mut graph =
            parse_graph_text("digraph G { n }").expect("graph should parse");
        let error = apply_force_model(&mut graph, "claude-opus-4.6")
            .expect_err("missing provider should fail");
        assert!(error.contains("provider=model"));
    }
}
