use crate::journal::{JournalReduction, StageOutcomeRecord, reduce_turns};
use crate::{AttractorError, ContextValues};
use attractor_journal::{ContextId, JOURNAL_FILE_NAME, NdjsonJournal, TurnId, TurnStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const RUN_BRANCH_PREFIX: &str = "attractor/run/";
pub const RUN_BRANCH_STATE_PATH: &str = ".attractor/state.json";

const RESUME_PAGE_SIZE: usize = 256;

/// Everything needed to restart an interrupted run: the rehydrated context,
/// completed outcomes, the journal head to chain `RunResumed` onto, and the
/// node to pick up at.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeState {
    pub run_id: String,
    pub context: ContextValues,
    pub completed: BTreeMap<String, StageOutcomeRecord>,
    pub completed_order: Vec<String>,
    pub pending_nodes: Vec<String>,
    pub finished_status: Option<String>,
    pub failure_reason: Option<String>,
    pub warning_count: u64,
    pub head_turn_id: TurnId,
    pub head_depth: u32,
    pub next_turn_id: u64,
}

impl ResumeState {
    pub fn resume_node(&self) -> Option<&str> {
        self.pending_nodes.last().map(String::as_str)
    }

    fn from_reduction(reduction: JournalReduction) -> Result<Self, AttractorError> {
        let run_id = reduction.run_id.ok_or_else(|| {
            AttractorError::Resume("journal has no run_started turn".to_string())
        })?;
        Ok(Self {
            run_id,
            context: reduction.context,
            completed: reduction.completed,
            completed_order: reduction.completed_order,
            pending_nodes: reduction.pending_nodes,
            finished_status: reduction.finished_status,
            failure_reason: reduction.failure_reason,
            warning_count: reduction.warning_count,
            head_turn_id: reduction.head_turn_id,
            head_depth: reduction.head_depth,
            next_turn_id: reduction.next_turn_id,
        })
    }
}

/// Mode 1: rehydrate from the local journal under a logs root.
pub fn resume_from_logs_root(logs_root: &Path) -> Result<ResumeState, AttractorError> {
    let journal_path = logs_root.join(JOURNAL_FILE_NAME);
    let turns = NdjsonJournal::read_all(&journal_path)
        .map_err(|error| AttractorError::Resume(error.to_string()))?;
    if turns.is_empty() {
        return Err(AttractorError::Resume(format!(
            "journal '{}' is empty",
            journal_path.display()
        )));
    }
    ResumeState::from_reduction(reduce_turns(&turns)?)
}

/// Mode 2: replay turns from CXDB; identical reduction semantics.
pub async fn resume_from_cxdb(
    store: &dyn TurnStore,
    context_id: &ContextId,
) -> Result<ResumeState, AttractorError> {
    let mut before: Option<TurnId> = None;
    let mut pages = Vec::new();
    loop {
        let page = store
            .list_turns(context_id, before.as_ref(), RESUME_PAGE_SIZE)
            .await
            .map_err(|error| AttractorError::Resume(error.to_string()))?;
        if page.is_empty() {
            break;
        }
        before = page.first().map(|turn| turn.turn_id.clone());
        let more = page.len() == RESUME_PAGE_SIZE;
        pages.push(page);
        if !more {
            break;
        }
    }

    let mut turns = Vec::new();
    for page in pages.into_iter().rev() {
        turns.extend(page);
    }
    if turns.is_empty() {
        return Err(AttractorError::Resume(format!(
            "cxdb context '{context_id}' has no turns"
        )));
    }
    ResumeState::from_reduction(reduce_turns(&turns)?)
}

pub fn run_branch_name(run_id: &str) -> String {
    format!("{RUN_BRANCH_PREFIX}{run_id}")
}

/// State file committed on the run branch; points back at the logs root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunBranchState {
    pub run_id: String,
    pub logs_root: String,
}

/// Reads the state file committed on a run branch.
pub async fn read_run_branch_state(
    env: &dyn attractor_exec::ExecutionEnvironment,
    branch: &str,
    repo: Option<&Path>,
) -> Result<RunBranchState, AttractorError> {
    if !branch.starts_with(RUN_BRANCH_PREFIX) {
        return Err(AttractorError::Resume(format!(
            "'{branch}' is not a run branch; expected the {RUN_BRANCH_PREFIX}<run-id> form"
        )));
    }

    let command = format!("git show {branch}:{RUN_BRANCH_STATE_PATH}");
    let cwd = repo.map(|path| path.to_string_lossy().to_string());
    let result = env
        .exec_command(&command, 30_000, cwd.as_deref(), None)
        .await
        .map_err(|error| AttractorError::Resume(error.to_string()))?;
    if result.exit_code != 0 {
        return Err(AttractorError::Resume(format!(
            "failed to read {RUN_BRANCH_STATE_PATH} from '{branch}': {}",
            result.stderr.trim()
        )));
    }

    serde_json::from_str(&result.stdout).map_err(|error| {
        AttractorError::Resume(format!(
            "invalid {RUN_BRANCH_STATE_PATH} on '{branch}': {error}"
        ))
    })
}

/// Mode 3: locate the resumable state referenced by `attractor/run/<RunID>`;
/// the committed state file names the logs root, and mode 1 takes over.
pub async fn resume_from_run_branch(
    env: &dyn attractor_exec::ExecutionEnvironment,
    branch: &str,
    repo: Option<&Path>,
) -> Result<ResumeState, AttractorError> {
    let state = read_run_branch_state(env, branch, repo).await?;
    resume_from_logs_root(Path::new(&state.logs_root))
}
