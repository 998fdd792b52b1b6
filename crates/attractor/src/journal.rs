use crate::{AttractorError, ContextValues, FailureClass, StageOutcome, StageStatus};
use attractor_journal::{
    ContextId, NdjsonJournal, ROOT_TURN_ID, Turn, TurnId, TurnStore, payload_hash,
    turn_idempotency_key,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub const TURN_TYPE_VERSION: u32 = 1;

/// Serializable projection of a stage outcome for journal payloads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcomeRecord {
    pub status: String,
    pub failure_class: Option<FailureClass>,
    pub preferred_label: Option<String>,
    pub notes: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub context_updates: ContextValues,
}

impl StageOutcomeRecord {
    pub fn from_outcome(outcome: &StageOutcome) -> Self {
        Self {
            status: outcome.status.as_str().to_string(),
            failure_class: outcome.failure_class,
            preferred_label: outcome.preferred_label.clone(),
            notes: outcome.notes.clone(),
            duration_ms: outcome.duration_ms,
            context_updates: outcome.context_updates.clone(),
        }
    }

    pub fn to_outcome(&self) -> StageOutcome {
        StageOutcome {
            status: StageStatus::parse(&self.status),
            preferred_label: self.preferred_label.clone(),
            failure_class: self.failure_class,
            duration_ms: self.duration_ms,
            notes: self.notes.clone(),
            context_updates: self.context_updates.clone(),
            provider_raw: BTreeMap::new(),
        }
    }
}

/// One journal entry per state transition. The tag doubles as the turn's
/// dotted type id (`attractor.<kind>`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventPayload {
    RunStarted {
        run_id: String,
        graph_id: String,
        goal: Option<String>,
    },
    RunResumed {
        run_id: String,
        replay_head_turn_id: String,
    },
    NodeEntered {
        node_id: String,
        attempt: u32,
    },
    NodeCompleted {
        node_id: String,
        outcome: StageOutcomeRecord,
    },
    EdgeTaken {
        from: String,
        to: String,
        condition: String,
    },
    ContextPut {
        key: String,
        value: Value,
    },
    WarningIssued {
        message: String,
    },
    ProviderDigest {
        node_id: String,
        request_hash: String,
        response_hash: Option<String>,
        finish_reason: Option<String>,
    },
    RunFinished {
        status: String,
        failure_reason: Option<String>,
    },
}

impl RunEventPayload {
    pub fn type_id(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "attractor.run_started",
            Self::RunResumed { .. } => "attractor.run_resumed",
            Self::NodeEntered { .. } => "attractor.node_entered",
            Self::NodeCompleted { .. } => "attractor.node_completed",
            Self::EdgeTaken { .. } => "attractor.edge_taken",
            Self::ContextPut { .. } => "attractor.context_put",
            Self::WarningIssued { .. } => "attractor.warning_issued",
            Self::ProviderDigest { .. } => "attractor.provider_digest",
            Self::RunFinished { .. } => "attractor.run_finished",
        }
    }
}

pub fn decode_payload(turn: &Turn) -> Result<RunEventPayload, AttractorError> {
    serde_json::from_value(turn.payload.clone()).map_err(|error| {
        AttractorError::Resume(format!(
            "failed to decode journal turn '{}' ({}): {error}",
            turn.turn_id, turn.type_id
        ))
    })
}

#[derive(Clone)]
struct RemoteJournal {
    store: Arc<dyn TurnStore>,
    context_id: ContextId,
}

pub struct JournalAppend {
    pub turn: Turn,
    /// Remote replication failure, if any. Reported as a warning; the run
    /// itself is unaffected.
    pub sync_warning: Option<String>,
}

/// Single appender for a run's journal. Turn ids are assigned monotonically;
/// the local disk write must succeed before the head advances, and remote
/// CXDB replication is best-effort.
pub struct JournalWriter {
    local: NdjsonJournal,
    next_turn_id: u64,
    head_turn_id: TurnId,
    head_depth: u32,
    remote: Option<RemoteJournal>,
}

impl JournalWriter {
    pub fn create(logs_root: &Path) -> Result<Self, AttractorError> {
        let local = NdjsonJournal::open_under(logs_root)
            .map_err(|error| AttractorError::JournalWrite(error.to_string()))?;
        Ok(Self {
            local,
            next_turn_id: 1,
            head_turn_id: ROOT_TURN_ID.to_string(),
            head_depth: 0,
            remote: None,
        })
    }

    /// Reopens a journal after a crash. Prior turn ids are preserved; new
    /// ids continue the monotonic sequence.
    pub fn resume(
        logs_root: &Path,
        head_turn_id: TurnId,
        head_depth: u32,
        next_turn_id: u64,
    ) -> Result<Self, AttractorError> {
        let local = NdjsonJournal::open_under(logs_root)
            .map_err(|error| AttractorError::JournalWrite(error.to_string()))?;
        Ok(Self {
            local,
            next_turn_id,
            head_turn_id,
            head_depth,
            remote: None,
        })
    }

    pub fn with_remote(mut self, store: Arc<dyn TurnStore>, context_id: ContextId) -> Self {
        self.remote = Some(RemoteJournal { store, context_id });
        self
    }

    pub fn head_turn_id(&self) -> &str {
        &self.head_turn_id
    }

    pub fn head_depth(&self) -> u32 {
        self.head_depth
    }

    pub async fn append(
        &mut self,
        payload: RunEventPayload,
    ) -> Result<JournalAppend, AttractorError> {
        let type_id = payload.type_id();
        let value = serde_json::to_value(&payload)
            .map_err(|error| AttractorError::JournalWrite(error.to_string()))?;
        let idempotency_key = turn_idempotency_key(&value, &self.head_turn_id);

        let turn = Turn {
            turn_id: self.next_turn_id.to_string(),
            parent_turn_id: self.head_turn_id.clone(),
            depth: self.head_depth + 1,
            type_id: type_id.to_string(),
            type_version: TURN_TYPE_VERSION,
            payload_hash: payload_hash(&value),
            payload: value.clone(),
            created_at: timestamp_rfc3339_nanos(),
            idempotency_key: Some(idempotency_key.clone()),
        };

        self.local
            .append(&turn)
            .map_err(|error| AttractorError::JournalWrite(error.to_string()))?;
        self.next_turn_id += 1;
        self.head_turn_id = turn.turn_id.clone();
        self.head_depth = turn.depth;

        let mut sync_warning = None;
        if let Some(remote) = self.remote.clone() {
            let request = attractor_journal::AppendTurnRequest {
                context_id: remote.context_id.clone(),
                parent_turn_id: Some(turn.parent_turn_id.clone()),
                type_id: turn.type_id.clone(),
                type_version: turn.type_version,
                payload: value,
                idempotency_key,
            };
            if let Err(error) = remote.store.append_turn(request).await {
                sync_warning = Some(format!(
                    "cxdb sync failed for turn {} ({type_id}): {error}",
                    turn.turn_id
                ));
            }
        }

        Ok(JournalAppend { turn, sync_warning })
    }
}

pub fn timestamp_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Folded view of a journal: replaying every turn reconstructs the final
/// context and status exactly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JournalReduction {
    pub run_id: Option<String>,
    pub graph_id: Option<String>,
    pub goal: Option<String>,
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

impl JournalReduction {
    /// The node to pick up at on resume: the last `NodeEntered` whose
    /// matching `NodeCompleted` never arrived.
    pub fn resume_node(&self) -> Option<&str> {
        self.pending_nodes.last().map(String::as_str)
    }
}

pub fn reduce_turns(turns: &[Turn]) -> Result<JournalReduction, AttractorError> {
    let mut reduction = JournalReduction {
        head_turn_id: ROOT_TURN_ID.to_string(),
        next_turn_id: 1,
        ..JournalReduction::default()
    };

    for turn in turns {
        match decode_payload(turn)? {
            RunEventPayload::RunStarted {
                run_id,
                graph_id,
                goal,
            } => {
                reduction.run_id = Some(run_id);
                reduction.graph_id = Some(graph_id);
                reduction.goal = goal;
            }
            RunEventPayload::RunResumed { run_id, .. } => {
                reduction.run_id.get_or_insert(run_id);
            }
            RunEventPayload::NodeEntered { node_id, .. } => {
                reduction.pending_nodes.push(node_id);
            }
            RunEventPayload::NodeCompleted { node_id, outcome } => {
                if let Some(position) = reduction
                    .pending_nodes
                    .iter()
                    .rposition(|pending| *pending == node_id)
                {
                    reduction.pending_nodes.remove(position);
                }
                for (key, value) in &outcome.context_updates {
                    reduction.context.insert(key.clone(), value.clone());
                }
                reduction.context.insert(
                    "outcome".to_string(),
                    Value::String(StageStatus::canonical(&outcome.status)),
                );
                if let Some(label) = &outcome.preferred_label {
                    reduction
                        .context
                        .insert("preferred_label".to_string(), Value::String(label.clone()));
                }
                reduction.completed_order.push(node_id.clone());
                reduction.completed.insert(node_id, outcome);
            }
            RunEventPayload::EdgeTaken { .. } => {}
            RunEventPayload::ContextPut { key, value } => {
                reduction.context.insert(key, value);
            }
            RunEventPayload::WarningIssued { .. } => {
                reduction.warning_count += 1;
            }
            RunEventPayload::ProviderDigest { .. } => {}
            RunEventPayload::RunFinished {
                status,
                failure_reason,
            } => {
                reduction.finished_status = Some(status);
                reduction.failure_reason = failure_reason;
            }
        }

        reduction.head_turn_id = turn.turn_id.clone();
        reduction.head_depth = turn.depth;
        if let Ok(numeric) = turn.turn_id.parse::<u64>() {
            reduction.next_turn_id = reduction.next_turn_id.max(numeric + 1);
        }
    }

    Ok(reduction)
}
