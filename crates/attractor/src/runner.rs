use crate::{
    AttractorError, CancelToken, ContextStore, ContextValues, FailureClass, FanOutEvent, Graph,
    InterviewDesk, JournalWriter, Node, NodeKind, RetryBackoffConfig, RunEvent, RunEventPayload,
    RuntimeEvent, RuntimeEventKind, RuntimeEventSink, StageOutcome, StageOutcomeRecord,
    StageRuntimeEvent, StageStatus, WarningEvent, build_retry_policy, delay_for_attempt_ms,
    handlers::StageHandler, handlers::registry::{RegistryStageExecutor, base_registry},
    jitter_seed, node_kind, resume::ResumeState, select_outgoing_edges, should_retry_outcome,
    timestamp_rfc3339_nanos,
};
use attractor_journal::{ContextId, TurnStore};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

pub const DEFAULT_LOOP_ITERATION_CAP: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Fail,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: BTreeMap<String, StageOutcome>,
    pub context: ContextValues,
    pub warning_count: u64,
}

#[derive(Clone)]
pub struct RunConfig {
    pub run_id: Option<String>,
    pub logs_root: Option<PathBuf>,
    pub repo_path: Option<PathBuf>,
    pub labels: BTreeMap<String, String>,
    pub events: RuntimeEventSink,
    pub executor: Arc<dyn StageHandler>,
    pub remote_store: Option<Arc<dyn TurnStore>>,
    pub remote_context_id: Option<ContextId>,
    pub retry_backoff: RetryBackoffConfig,
    /// Worker pool size for stage execution; 0 means the number of logical
    /// CPUs.
    pub max_workers: usize,
    pub loop_iteration_cap: u64,
    /// Per-stage wall-clock bound in milliseconds; 0 means unbounded.
    pub timeout_per_step_ms: u64,
    /// Run-wide wall-clock bound in milliseconds; 0 means unbounded.
    pub timeout_total_ms: u64,
    pub cancel: CancelToken,
    pub interview_desk: InterviewDesk,
    pub resume: Option<ResumeState>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            logs_root: None,
            repo_path: None,
            labels: BTreeMap::new(),
            events: RuntimeEventSink::default(),
            executor: Arc::new(RegistryStageExecutor::new(base_registry())),
            remote_store: None,
            remote_context_id: None,
            retry_backoff: RetryBackoffConfig::default(),
            max_workers: 0,
            loop_iteration_cap: DEFAULT_LOOP_ITERATION_CAP,
            timeout_per_step_ms: 0,
            timeout_total_ms: 0,
            cancel: CancelToken::never(),
            interview_desk: InterviewDesk::new(),
            resume: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineRunner;

impl PipelineRunner {
    pub async fn run(
        &self,
        graph: &Graph,
        config: RunConfig,
    ) -> Result<RunResult, AttractorError> {
        crate::validate_or_raise(graph, None)?;

        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| format!("{}-run", graph.id));

        // A run that already finished resumes to its recorded result.
        if let Some(resume) = config.resume.as_ref() {
            if let Some(status) = resume.finished_status.as_deref() {
                return Ok(RunResult {
                    run_id,
                    graph_id: graph.id.clone(),
                    status: parse_run_status(status),
                    failure_reason: resume.failure_reason.clone(),
                    completed_nodes: resume.completed_order.clone(),
                    node_outcomes: outcomes_from_records(&resume.completed),
                    context: resume.context.clone(),
                    warning_count: resume.warning_count,
                });
            }
        }

        let shared = RunShared::initialize(graph, &config, run_id.clone()).await?;

        let start_node = match config.resume.as_ref() {
            Some(resume) => {
                shared
                    .journal_append(RunEventPayload::RunResumed {
                        run_id: run_id.clone(),
                        replay_head_turn_id: resume.head_turn_id.clone(),
                    })
                    .await?;
                shared.emit(RuntimeEventKind::Run(RunEvent::Resumed {
                    run_id: run_id.clone(),
                    graph_id: graph.id.clone(),
                }));
                match resume.resume_node() {
                    Some(node_id) => node_id.to_string(),
                    None => match shared.route_after_resume(resume)? {
                        Some(node_id) => node_id,
                        None => {
                            let result = shared.finalize(RunStatus::Success, None).await?;
                            return Ok(result);
                        }
                    },
                }
            }
            None => {
                shared
                    .journal_append(RunEventPayload::RunStarted {
                        run_id: run_id.clone(),
                        graph_id: graph.id.clone(),
                        goal: graph.attrs.get_str("goal").map(ToOwned::to_owned),
                    })
                    .await?;
                shared.emit(RuntimeEventKind::Run(RunEvent::Started {
                    run_id: run_id.clone(),
                    graph_id: graph.id.clone(),
                }));
                resolve_start_node(graph)?.id.clone()
            }
        };

        let end = walk_chain(Arc::clone(&shared), start_node, false).await;
        let (status, reason) = match end {
            Ok(ChainEnd::Terminal(_)) => (RunStatus::Success, None),
            Ok(ChainEnd::FanIn(node_id)) => (
                RunStatus::Fail,
                Some(format!(
                    "fan-in node '{node_id}' reached outside a component branch"
                )),
            ),
            Ok(ChainEnd::RunFailed(reason)) => (RunStatus::Fail, Some(reason)),
            Ok(ChainEnd::Canceled(reason)) => (RunStatus::Canceled, Some(reason)),
            Err(error) if error.is_cancel() => (RunStatus::Canceled, Some(error.to_string())),
            Err(error @ AttractorError::JournalWrite(_)) => return Err(error),
            Err(error) => (RunStatus::Fail, Some(error.to_string())),
        };

        shared.finalize(status, reason).await
    }
}

fn parse_run_status(raw: &str) -> RunStatus {
    match raw {
        "success" => RunStatus::Success,
        "canceled" => RunStatus::Canceled,
        _ => RunStatus::Fail,
    }
}

fn outcomes_from_records(
    records: &BTreeMap<String, StageOutcomeRecord>,
) -> BTreeMap<String, StageOutcome> {
    records
        .iter()
        .map(|(node_id, record)| (node_id.clone(), record.to_outcome()))
        .collect()
}

fn resolve_start_node(graph: &Graph) -> Result<&Node, AttractorError> {
    graph
        .start_candidates()
        .into_iter()
        .next()
        .ok_or_else(|| AttractorError::Runtime("graph does not have a start node".to_string()))
}

enum ChainEnd {
    Terminal(String),
    FanIn(String),
    RunFailed(String),
    Canceled(String),
}

struct RunShared {
    graph: Graph,
    run_id: String,
    executor: Arc<dyn StageHandler>,
    events: RuntimeEventSink,
    retry_backoff: RetryBackoffConfig,
    loop_iteration_cap: u64,
    timeout_per_step_ms: u64,
    cancel: CancelToken,
    context: ContextStore,
    journal: tokio::sync::Mutex<Option<JournalWriter>>,
    logs_root: Option<PathBuf>,
    event_seq: AtomicU64,
    warning_count: AtomicU64,
    workers: Arc<Semaphore>,
    completed: Mutex<Vec<String>>,
    outcomes: Mutex<BTreeMap<String, StageOutcome>>,
    loop_counters: Mutex<BTreeMap<String, (u64, String)>>,
    deadline: Option<Instant>,
}

impl RunShared {
    async fn initialize(
        graph: &Graph,
        config: &RunConfig,
        run_id: String,
    ) -> Result<Arc<Self>, AttractorError> {
        let context = ContextStore::new();
        match config.resume.as_ref() {
            Some(resume) => {
                context.replace(crate::ContextSnapshot {
                    values: resume.context.clone(),
                    logs: Vec::new(),
                })?;
            }
            None => {
                for (key, value) in graph.attrs.values() {
                    context.set(format!("graph.{key}"), attr_value_to_json(value))?;
                }
            }
        }

        let mut remote_context_id = config.remote_context_id.clone();
        let journal = match config.logs_root.as_ref() {
            Some(logs_root) => {
                let mut writer = match config.resume.as_ref() {
                    Some(resume) => JournalWriter::resume(
                        logs_root,
                        resume.head_turn_id.clone(),
                        resume.head_depth,
                        resume.next_turn_id,
                    )?,
                    None => JournalWriter::create(logs_root)?,
                };
                if let Some(store) = config.remote_store.clone() {
                    let context_id = match remote_context_id.clone() {
                        Some(context_id) => context_id,
                        None => store.create_context(None).await?.context_id,
                    };
                    remote_context_id = Some(context_id.clone());
                    writer = writer.with_remote(store, context_id);
                }
                Some(writer)
            }
            None => None,
        };

        if let Some(logs_root) = config.logs_root.as_ref() {
            crate::artifacts::write_pid_file(logs_root)?;
            if config.resume.is_none() {
                crate::artifacts::write_manifest(
                    logs_root,
                    &crate::artifacts::RunManifest {
                        run_id: run_id.clone(),
                        graph_name: graph.id.clone(),
                        goal: graph.attrs.get_str("goal").map(ToOwned::to_owned),
                        started_at: timestamp_rfc3339_nanos(),
                        logs_root: logs_root.to_string_lossy().to_string(),
                        repo_path: config
                            .repo_path
                            .as_ref()
                            .map(|path| path.to_string_lossy().to_string()),
                        labels: config.labels.clone(),
                        cxdb_context_id: remote_context_id.clone(),
                        run_branch: Some(format!("attractor/run/{run_id}")),
                    },
                )?;
            }
        }

        let max_workers = if config.max_workers > 0 {
            config.max_workers
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
        };

        let mut completed = Vec::new();
        let mut outcomes = BTreeMap::new();
        if let Some(resume) = config.resume.as_ref() {
            completed = resume.completed_order.clone();
            outcomes = outcomes_from_records(&resume.completed);
        }

        Ok(Arc::new(Self {
            graph: graph.clone(),
            run_id,
            executor: Arc::clone(&config.executor),
            events: config.events.clone(),
            retry_backoff: config.retry_backoff.clone(),
            loop_iteration_cap: config.loop_iteration_cap.max(1),
            timeout_per_step_ms: config.timeout_per_step_ms,
            cancel: config.cancel.clone(),
            context,
            journal: tokio::sync::Mutex::new(journal),
            logs_root: config.logs_root.clone(),
            event_seq: AtomicU64::new(0),
            warning_count: AtomicU64::new(config.resume.as_ref().map_or(0, |r| r.warning_count)),
            workers: Arc::new(Semaphore::new(max_workers)),
            completed: Mutex::new(completed),
            outcomes: Mutex::new(outcomes),
            loop_counters: Mutex::new(BTreeMap::new()),
            deadline: if config.timeout_total_ms > 0 {
                Some(Instant::now() + Duration::from_millis(config.timeout_total_ms))
            } else {
                None
            },
        }))
    }

    fn emit(&self, kind: RuntimeEventKind) {
        if !self.events.is_enabled() {
            return;
        }
        let sequence_no = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.emit(RuntimeEvent {
            sequence_no,
            timestamp: timestamp_rfc3339_nanos(),
            kind,
        });
    }

    fn warn_runtime(&self, message: impl Into<String>) {
        self.warning_count.fetch_add(1, Ordering::SeqCst);
        self.emit(RuntimeEventKind::Warning(WarningEvent {
            run_id: self.run_id.clone(),
            message: message.into(),
        }));
    }

    async fn journal_append(&self, payload: RunEventPayload) -> Result<(), AttractorError> {
        let mut guard = self.journal.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        let appended = writer.append(payload).await?;
        drop(guard);
        if let Some(warning) = appended.sync_warning {
            self.warn_runtime(warning);
        }
        Ok(())
    }

    async fn journal_warning(&self, message: String) -> Result<(), AttractorError> {
        self.warning_count.fetch_add(1, Ordering::SeqCst);
        self.emit(RuntimeEventKind::Warning(WarningEvent {
            run_id: self.run_id.clone(),
            message: message.clone(),
        }));
        let mut guard = self.journal.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        let appended = writer
            .append(RunEventPayload::WarningIssued { message })
            .await?;
        drop(guard);
        if let Some(warning) = appended.sync_warning {
            self.warn_runtime(warning);
        }
        Ok(())
    }

    fn snapshot_values(&self) -> Result<ContextValues, AttractorError> {
        Ok(self.context.snapshot()?.values)
    }

    fn check_deadline(&self) -> Result<(), AttractorError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(AttractorError::Cancel {
                    reason: "run-wide timeout exhausted".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resume routing when the crash happened between stages: route from the
    /// last completed node's recorded outcome.
    fn route_after_resume(&self, resume: &ResumeState) -> Result<Option<String>, AttractorError> {
        let Some(last) = resume.completed_order.last() else {
            return Ok(Some(resolve_start_node(&self.graph)?.id.clone()));
        };
        let Some(record) = resume.completed.get(last) else {
            return Ok(None);
        };
        let outcome = record.to_outcome();
        let selection = select_outgoing_edges(&self.graph, last, &outcome, &resume.context);
        Ok(selection.edges.first().map(|edge| edge.to.clone()))
    }

    /// Applies a completed outcome exactly the way journal reduction does, so
    /// replaying the journal reconstructs this context.
    fn apply_outcome_to_context(
        &self,
        outcome: &StageOutcome,
    ) -> Result<(), AttractorError> {
        self.context.apply_updates(&outcome.context_updates)?;
        self.context.set(
            "outcome",
            Value::String(outcome.status.as_str().to_string()),
        )?;
        if let Some(label) = &outcome.preferred_label {
            self.context
                .set("preferred_label", Value::String(label.clone()))?;
        }
        Ok(())
    }

    fn record_completion(&self, node_id: &str, outcome: &StageOutcome) {
        self.completed
            .lock()
            .expect("completed mutex should lock")
            .push(node_id.to_string());
        self.outcomes
            .lock()
            .expect("outcomes mutex should lock")
            .insert(node_id.to_string(), outcome.clone());
    }

    fn was_completed(&self, node_id: &str) -> bool {
        self.completed
            .lock()
            .expect("completed mutex should lock")
            .iter()
            .any(|completed| completed == node_id)
    }

    /// Counts a loop traversal; errors once the cap is exceeded without the
    /// head node's outcome changing.
    fn count_loop_traversal(
        &self,
        edge_key: &str,
        from_node: &str,
        head_status: &str,
    ) -> Result<u64, AttractorError> {
        let mut counters = self
            .loop_counters
            .lock()
            .expect("loop counters mutex should lock");
        let entry = counters
            .entry(edge_key.to_string())
            .or_insert((0, head_status.to_string()));
        if entry.1 == head_status {
            entry.0 += 1;
        } else {
            *entry = (1, head_status.to_string());
        }
        if entry.0 > self.loop_iteration_cap {
            return Err(AttractorError::LoopDivergence {
                node_id: from_node.to_string(),
                iterations: entry.0,
            });
        }
        Ok(entry.0)
    }

    fn first_unsatisfied_goal_gate(&self) -> Option<String> {
        let outcomes = self.outcomes.lock().expect("outcomes mutex should lock");
        for (node_id, outcome) in outcomes.iter() {
            let Some(node) = self.graph.nodes.get(node_id) else {
                continue;
            };
            if node.attrs.get_bool("goal_gate") == Some(true) && !outcome.status.is_success() {
                return Some(node_id.clone());
            }
        }
        None
    }

    async fn finalize(
        &self,
        status: RunStatus,
        failure_reason: Option<String>,
    ) -> Result<RunResult, AttractorError> {
        self.journal_append(RunEventPayload::RunFinished {
            status: status.as_str().to_string(),
            failure_reason: failure_reason.clone(),
        })
        .await?;

        let warning_count = self.warning_count.load(Ordering::SeqCst);
        match (&status, failure_reason.as_deref()) {
            (RunStatus::Success, _) => self.emit(RuntimeEventKind::Run(RunEvent::Completed {
                run_id: self.run_id.clone(),
                graph_id: self.graph.id.clone(),
            })),
            (RunStatus::Fail, reason) => self.emit(RuntimeEventKind::Run(RunEvent::Failed {
                run_id: self.run_id.clone(),
                graph_id: self.graph.id.clone(),
                reason: reason.unwrap_or("run failed").to_string(),
            })),
            (RunStatus::Canceled, reason) => self.emit(RuntimeEventKind::Run(RunEvent::Canceled {
                run_id: self.run_id.clone(),
                graph_id: self.graph.id.clone(),
                reason: reason.unwrap_or("canceled").to_string(),
            })),
        }

        if let Some(logs_root) = self.logs_root.as_ref() {
            crate::artifacts::write_final_report(
                logs_root,
                &crate::artifacts::FinalReport {
                    status: status.as_str().to_string(),
                    ended_at: timestamp_rfc3339_nanos(),
                    final_commit_sha: None,
                    warning_count,
                },
            )?;
            crate::artifacts::remove_pid_file(logs_root);
        }

        Ok(RunResult {
            run_id: self.run_id.clone(),
            graph_id: self.graph.id.clone(),
            status,
            failure_reason,
            completed_nodes: self
                .completed
                .lock()
                .expect("completed mutex should lock")
                .clone(),
            node_outcomes: self
                .outcomes
                .lock()
                .expect("outcomes mutex should lock")
                .clone(),
            context: self.snapshot_values()?,
            warning_count,
        })
    }
}

fn attr_value_to_json(value: &crate::AttrValue) -> Value {
    match value {
        crate::AttrValue::String(inner) => Value::String(inner.clone()),
        crate::AttrValue::Integer(inner) => json!(inner),
        crate::AttrValue::Float(inner) => json!(inner),
        crate::AttrValue::Boolean(inner) => json!(inner),
        crate::AttrValue::Duration(inner) => Value::String(inner.raw.clone()),
    }
}

fn walk_chain(
    shared: Arc<RunShared>,
    start_node: String,
    is_branch: bool,
) -> futures::future::BoxFuture<'static, Result<ChainEnd, AttractorError>> {
    Box::pin(async move {
        let mut current = start_node;
        loop {
            shared.check_deadline()?;
            if let Some(reason) = shared.cancel.reason() {
                return Ok(ChainEnd::Canceled(reason));
            }

            let node = shared
                .graph
                .nodes
                .get(&current)
                .ok_or_else(|| {
                    AttractorError::Runtime(format!("traversal reached unknown node '{current}'"))
                })?
                .clone();
            let kind = node_kind(&node);

            match kind {
                NodeKind::Terminal => {
                    if let Some(gate_node) = shared.first_unsatisfied_goal_gate() {
                        if let Some(target) = resolve_retry_target(&shared.graph, &gate_node) {
                            shared
                                .journal_warning(format!(
                                    "goal gate '{gate_node}' unsatisfied; rerouting to '{target}'"
                                ))
                                .await?;
                            current = target;
                            continue;
                        }
                        return Ok(ChainEnd::RunFailed(format!(
                            "goal gate node '{gate_node}' did not reach success and no retry \
                             target is configured"
                        )));
                    }
                    return Ok(ChainEnd::Terminal(current));
                }
                NodeKind::FanIn if is_branch => {
                    return Ok(ChainEnd::FanIn(current));
                }
                NodeKind::Component => {
                    match run_component(&shared, &node).await? {
                        ComponentContinuation::Continue(next) => {
                            current = next;
                            continue;
                        }
                        ComponentContinuation::End(end) => return Ok(end),
                    }
                }
                _ => {
                    let (outcome, attempts) = execute_stage(&shared, &node).await?;

                    shared.apply_outcome_to_context(&outcome)?;
                    shared.record_completion(&node.id, &outcome);
                    shared
                        .journal_append(RunEventPayload::NodeCompleted {
                            node_id: node.id.clone(),
                            outcome: StageOutcomeRecord::from_outcome(&outcome),
                        })
                        .await?;
                    emit_stage_completion(&shared, &node.id, &outcome, attempts);

                    if outcome.status == StageStatus::Canceled {
                        let reason = outcome
                            .notes
                            .clone()
                            .unwrap_or_else(|| "stage canceled".to_string());
                        return Ok(ChainEnd::Canceled(reason));
                    }

                    let snapshot = shared.snapshot_values()?;
                    let selection =
                        select_outgoing_edges(&shared.graph, &node.id, &outcome, &snapshot);
                    for warning in &selection.warnings {
                        shared.journal_warning(warning.clone()).await?;
                    }

                    let Some(edge) = selection.edges.first() else {
                        return Err(AttractorError::Routing {
                            node_id: node.id.clone(),
                            outcome: outcome.status.as_str().to_string(),
                        });
                    };

                    shared
                        .journal_append(RunEventPayload::EdgeTaken {
                            from: edge.from.clone(),
                            to: edge.to.clone(),
                            condition: edge.condition().to_string(),
                        })
                        .await?;

                    // Revisiting a completed node means a loop traversal.
                    if shared.was_completed(&edge.to) {
                        let key = shared.graph.edge_key(edge);
                        let count = shared.count_loop_traversal(
                            &key,
                            &edge.from,
                            outcome.status.as_str(),
                        )?;
                        let counter_key = format!("__loop.{key}");
                        shared.context.set(counter_key.clone(), json!(count))?;
                        shared
                            .journal_append(RunEventPayload::ContextPut {
                                key: counter_key,
                                value: json!(count),
                            })
                            .await?;
                    }

                    current = edge.to.clone();
                }
            }
        }
    })
}

enum ComponentContinuation {
    Continue(String),
    End(ChainEnd),
}

/// Fan-out: all matching edges fire in parallel; the component completes
/// only after every branch reached a fan-in or terminal, and its
/// `NodeCompleted` turn is journaled strictly after the children's.
async fn run_component(
    shared: &Arc<RunShared>,
    node: &Node,
) -> Result<ComponentContinuation, AttractorError> {
    shared
        .journal_append(RunEventPayload::NodeEntered {
            node_id: node.id.clone(),
            attempt: 1,
        })
        .await?;

    let snapshot = shared.snapshot_values()?;
    let routing_outcome = pseudo_outcome_from_context(&snapshot);
    let selection = select_outgoing_edges(&shared.graph, &node.id, &routing_outcome, &snapshot);
    for warning in &selection.warnings {
        shared.journal_warning(warning.clone()).await?;
    }
    if selection.edges.is_empty() {
        return Err(AttractorError::Routing {
            node_id: node.id.clone(),
            outcome: routing_outcome.status.as_str().to_string(),
        });
    }

    let branch_targets: Vec<String> = selection
        .edges
        .iter()
        .map(|edge| edge.to.clone())
        .collect();
    shared.emit(RuntimeEventKind::FanOut(FanOutEvent::Started {
        run_id: shared.run_id.clone(),
        node_id: node.id.clone(),
        branch_count: branch_targets.len(),
    }));

    let mut branch_futures = Vec::with_capacity(branch_targets.len());
    for (index, edge) in selection.edges.iter().enumerate() {
        shared
            .journal_append(RunEventPayload::EdgeTaken {
                from: edge.from.clone(),
                to: edge.to.clone(),
                condition: edge.condition().to_string(),
            })
            .await?;
        shared.emit(RuntimeEventKind::FanOut(FanOutEvent::BranchStarted {
            run_id: shared.run_id.clone(),
            node_id: node.id.clone(),
            branch_index: index,
            target_node: edge.to.clone(),
        }));
        branch_futures.push(walk_chain(
            Arc::clone(shared),
            edge.to.clone(),
            true,
        ));
    }

    let branch_ends = join_all(branch_futures).await;

    let mut failure: Option<String> = None;
    let mut canceled: Option<String> = None;
    let mut fan_in_target: Option<String> = None;
    let mut terminal_target: Option<String> = None;
    let mut success_count = 0usize;
    let mut failure_count = 0usize;
    for (index, end) in branch_ends.into_iter().enumerate() {
        let (status_label, target) = match end? {
            ChainEnd::Terminal(node_id) => {
                success_count += 1;
                terminal_target.get_or_insert(node_id.clone());
                ("success", node_id)
            }
            ChainEnd::FanIn(node_id) => {
                success_count += 1;
                fan_in_target.get_or_insert(node_id.clone());
                ("success", node_id)
            }
            ChainEnd::RunFailed(reason) => {
                failure_count += 1;
                failure.get_or_insert(reason);
                ("fail", branch_targets[index].clone())
            }
            ChainEnd::Canceled(reason) => {
                canceled.get_or_insert(reason);
                ("canceled", branch_targets[index].clone())
            }
        };
        shared.emit(RuntimeEventKind::FanOut(FanOutEvent::BranchCompleted {
            run_id: shared.run_id.clone(),
            node_id: node.id.clone(),
            branch_index: index,
            target_node: target,
            status: status_label.to_string(),
        }));
    }

    let mut outcome = if failure.is_some() {
        StageOutcome::failure(
            FailureClass::Structural,
            format!("{failure_count} of {} branches failed", branch_targets.len()),
        )
    } else if canceled.is_some() {
        StageOutcome::canceled(canceled.clone().unwrap_or_default())
    } else {
        StageOutcome::success()
    };
    outcome.context_updates.insert(
        format!("{}.branch_count", node.id),
        json!(branch_targets.len()),
    );
    outcome
        .context_updates
        .insert(format!("{}.success_count", node.id), json!(success_count));

    shared.apply_outcome_to_context(&outcome)?;
    shared.record_completion(&node.id, &outcome);
    shared
        .journal_append(RunEventPayload::NodeCompleted {
            node_id: node.id.clone(),
            outcome: StageOutcomeRecord::from_outcome(&outcome),
        })
        .await?;
    shared.emit(RuntimeEventKind::FanOut(FanOutEvent::Completed {
        run_id: shared.run_id.clone(),
        node_id: node.id.clone(),
        success_count,
        failure_count,
    }));

    if let Some(reason) = canceled {
        return Ok(ComponentContinuation::End(ChainEnd::Canceled(reason)));
    }
    if let Some(reason) = failure {
        return Ok(ComponentContinuation::End(ChainEnd::RunFailed(reason)));
    }
    if let Some(join_node) = fan_in_target {
        return Ok(ComponentContinuation::Continue(join_node));
    }
    Ok(ComponentContinuation::End(ChainEnd::Terminal(
        terminal_target.unwrap_or_else(|| node.id.clone()),
    )))
}

/// Component nodes do not execute; their edge conditions evaluate against
/// the run's current outcome state.
fn pseudo_outcome_from_context(context: &ContextValues) -> StageOutcome {
    let mut outcome = match context.get("outcome").and_then(Value::as_str) {
        Some(token) => StageOutcome::with_status_token(token),
        None => StageOutcome::success(),
    };
    outcome.preferred_label = context
        .get("preferred_label")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    outcome
}

async fn execute_stage(
    shared: &Arc<RunShared>,
    node: &Node,
) -> Result<(StageOutcome, u32), AttractorError> {
    let policy = build_retry_policy(node, &shared.graph, shared.retry_backoff.clone());

    shared
        .journal_append(RunEventPayload::NodeEntered {
            node_id: node.id.clone(),
            attempt: 1,
        })
        .await?;

    let mut attempt = 1u32;
    loop {
        shared.emit(RuntimeEventKind::Stage(StageRuntimeEvent::Started {
            run_id: shared.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
        }));

        let snapshot = shared.snapshot_values()?;
        let mut outcome = run_single_attempt(shared, node, &snapshot).await?;

        if !outcome.provider_raw.is_empty() {
            let request_hash = blake3::hash(node.prompt().unwrap_or_default().as_bytes())
                .to_hex()
                .to_string();
            shared
                .journal_append(RunEventPayload::ProviderDigest {
                    node_id: node.id.clone(),
                    request_hash,
                    response_hash: outcome
                        .context_updates
                        .get(&format!("{}.output", node.id))
                        .and_then(Value::as_str)
                        .map(|text| blake3::hash(text.as_bytes()).to_hex().to_string()),
                    finish_reason: outcome
                        .provider_raw
                        .get("finish_reason")
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned),
                })
                .await?;
        }

        let will_retry = should_retry_outcome(&outcome) && attempt < policy.max_attempts;
        if !will_retry {
            let retries_used = attempt.saturating_sub(1);
            outcome.context_updates.insert(
                format!("internal.retry_count.{}", node.id),
                json!(retries_used),
            );
            return Ok((outcome, attempt));
        }

        let delay_ms = delay_for_attempt_ms(
            attempt,
            &policy.backoff,
            jitter_seed(&shared.run_id, &node.id),
        );
        shared
            .journal_warning(format!(
                "node '{}' attempt {attempt} failed ({}); retrying in {delay_ms}ms",
                node.id,
                outcome.notes.as_deref().unwrap_or("transient failure"),
            ))
            .await?;
        shared.emit(RuntimeEventKind::Stage(StageRuntimeEvent::Retrying {
            run_id: shared.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
            next_attempt: attempt + 1,
            delay_ms,
        }));

        if delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                reason = shared.cancel.cancelled() => {
                    return Ok((StageOutcome::canceled(reason), attempt));
                }
            }
        }
        attempt += 1;
    }
}

async fn run_single_attempt(
    shared: &Arc<RunShared>,
    node: &Node,
    snapshot: &ContextValues,
) -> Result<StageOutcome, AttractorError> {
    let permit = shared
        .workers
        .acquire()
        .await
        .map_err(|_| AttractorError::Runtime("worker pool closed".to_string()))?;
    let started = Instant::now();

    let execution = shared
        .executor
        .execute(node, snapshot, &shared.graph, &shared.cancel);
    let result = if shared.timeout_per_step_ms > 0 {
        match tokio::time::timeout(
            Duration::from_millis(shared.timeout_per_step_ms),
            execution,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Ok(StageOutcome::canceled(format!(
                "stage '{}' exceeded step timeout of {}ms",
                node.id, shared.timeout_per_step_ms
            ))),
        }
    } else {
        execution.await
    };
    drop(permit);

    let mut outcome = match result {
        Ok(outcome) => outcome,
        Err(error) => error_outcome(error)?,
    };
    if outcome.duration_ms == 0 {
        outcome.duration_ms = started.elapsed().as_millis() as u64;
    }
    Ok(outcome)
}

/// Stage errors become terminal outcomes; journal failures stay errors
/// because the run cannot advance without its journal.
fn error_outcome(error: AttractorError) -> Result<StageOutcome, AttractorError> {
    match error {
        AttractorError::JournalWrite(_) => Err(error),
        AttractorError::Cancel { reason } => Ok(StageOutcome::canceled(reason)),
        AttractorError::NoObjectGenerated { message, raw_text } => {
            let mut outcome = StageOutcome::failure(FailureClass::Deterministic, message);
            outcome
                .provider_raw
                .insert("raw_text".to_string(), Value::String(raw_text));
            Ok(outcome)
        }
        AttractorError::Provider(provider_error) => {
            let class = if provider_error.retryable {
                FailureClass::TransientInfra
            } else {
                FailureClass::Deterministic
            };
            Ok(StageOutcome::failure(class, provider_error.message))
        }
        AttractorError::Timeout(message) => Ok(StageOutcome::canceled(message)),
        other => Ok(StageOutcome::failure(
            FailureClass::Deterministic,
            other.to_string(),
        )),
    }
}

fn emit_stage_completion(
    shared: &Arc<RunShared>,
    node_id: &str,
    outcome: &StageOutcome,
    attempt: u32,
) {
    let status = outcome.status.as_str().to_string();
    if outcome.status.is_fail() {
        shared.emit(RuntimeEventKind::Stage(StageRuntimeEvent::Failed {
            run_id: shared.run_id.clone(),
            node_id: node_id.to_string(),
            attempt,
            status,
            notes: outcome.notes.clone(),
            will_retry: false,
        }));
    } else {
        shared.emit(RuntimeEventKind::Stage(StageRuntimeEvent::Completed {
            run_id: shared.run_id.clone(),
            node_id: node_id.to_string(),
            attempt,
            status,
            notes: outcome.notes.clone(),
        }));
    }
}

fn resolve_retry_target(graph: &Graph, node_id: &str) -> Option<String> {
    let node = graph.nodes.get(node_id)?;
    for key in ["retry_target", "fallback_retry_target"] {
        let target = node.attrs.get_str(key).unwrap_or_default();
        if !target.is_empty() && graph.nodes.contains_key(target) {
            return Some(target.to_string());
        }
    }
    for key in ["retry_target", "fallback_retry_target"] {
        let target = graph.attrs.get_str(key).unwrap_or_default();
        if !target.is_empty() && graph.nodes.contains_key(target) {
            return Some(target.to_string());
        }
    }
    None
}
