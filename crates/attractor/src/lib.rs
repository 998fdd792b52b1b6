//! Attractor: graph-driven runtime for multi-stage, LLM-driven engineering
//! runs.
//!
//! A run is a directed graph with conditional edges: parse the text form,
//! validate it, then walk it — each node invokes an LLM provider or a tool,
//! the outcome routes through edge conditions over the shared run context,
//! and every state transition lands in an append-only turn journal that can
//! rebuild the run after a crash.

pub mod artifacts;
pub mod cancel;
pub mod condition;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod errors;
pub mod events;
pub mod execpolicy;
pub mod graph;
pub mod handlers;
pub mod interviewer;
pub mod journal;
pub mod lint;
pub mod modeldb;
pub mod outcome;
pub mod parse;
pub mod preflight;
pub mod provider;
pub mod resume;
pub mod retry;
pub mod routing;
pub mod runner;

pub use artifacts::{
    FinalReport, RunLiveness, RunManifest, probe_liveness, read_final_report, read_manifest,
    write_final_report, write_manifest, write_pid_file,
};
pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use condition::{
    evaluate_condition_expression, referenced_outcome_tokens, validate_condition_expression,
};
pub use config::{
    LlmConfig, ProviderBackend, ProviderConfig, RunFileConfig,
};
pub use context::{ContextSnapshot, ContextStore, ContextValues, validate_context_key};
pub use diagnostics::{Diagnostic, Severity};
pub use errors::{AttractorError, ProviderError, ProviderErrorKind, ValidationError};
pub use events::{
    FanOutEvent, InterviewEvent, RunEvent, RuntimeEvent, RuntimeEventKind, RuntimeEventReceiver,
    RuntimeEventSender, RuntimeEventSink, SharedRuntimeEventObserver, StageRuntimeEvent,
    WarningEvent, runtime_event_channel,
};
pub use execpolicy::{
    CliProfile, ExecPolicyInput, ExecResolution, PreflightProviderEntry, PreflightReport,
    ResolutionSource, build_preflight_report, env_snapshot, provider_path_env_var,
    resolve_provider_executable,
};
pub use graph::{
    AttrValue, Attributes, DurationValue, Edge, Graph, Node, NodeKind, node_kind,
};
pub use interviewer::{
    Answer, AutoApproveInterviewer, InterviewDesk, Interviewer, Question, QueueInterviewer,
    attach_interviewer,
};
pub use journal::{
    JournalAppend, JournalReduction, JournalWriter, RunEventPayload, StageOutcomeRecord,
    decode_payload, reduce_turns, timestamp_rfc3339_nanos,
};
pub use lint::{validate, validate_or_raise};
pub use modeldb::{ModelCatalog, canonical_anthropic_model};
pub use outcome::{FailureClass, StageOutcome, StageStatus};
pub use parse::parse_graph_text;
pub use preflight::{DEFAULT_STALE_BUILD_THRESHOLD, check_stale_build, run_preflight};
pub use provider::{
    ChatMessage, FinishReason, ProviderAdapter, ProviderRequest, ProviderResponse, Role,
    ScriptedProviderAdapter, ToolCall, Usage, parse_structured_output,
};
pub use resume::{
    ResumeState, RunBranchState, read_run_branch_state, resume_from_cxdb, resume_from_logs_root,
    resume_from_run_branch, run_branch_name,
};
pub use retry::{
    RetryBackoffConfig, RetryPolicy, build_retry_policy, delay_for_attempt_ms, jitter_seed,
    should_retry_outcome,
};
pub use routing::{RouteSelection, select_outgoing_edges};
pub use runner::{
    DEFAULT_LOOP_ITERATION_CAP, PipelineRunner, RunConfig, RunResult, RunStatus,
};
