mod support;

use attractor::{
    AttractorError, PipelineRunner, RunConfig, RunStatus, StageOutcome, parse_graph_text,
};
use attractor_journal::{JOURNAL_FILE_NAME, NdjsonJournal};
use serde_json::json;
use std::sync::Arc;
use support::ScriptedExecutor;
use tempfile::TempDir;

fn transient_outcome(attempts: u64) -> StageOutcome {
    let mut outcome = StageOutcome::with_status_token("transient_infra");
    outcome
        .context_updates
        .insert("attempts".to_string(), json!(attempts));
    outcome
}

fn success_outcome(attempts: u64) -> StageOutcome {
    let mut outcome = StageOutcome::success();
    outcome
        .context_updates
        .insert("attempts".to_string(), json!(attempts));
    outcome
}

#[tokio::test(flavor = "current_thread")]
async fn guarded_loop_restart_retries_until_success() {
    let dir = TempDir::new().expect("temp dir should be created");
    let graph = parse_graph_text(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            work [prompt="Work", auto_status="transient_infra"]
            exit [shape=Msquare]
            start -> work
            work -> work [condition="outcome=transient_infra && context.attempts<3", loop_restart=true]
            work -> exit [condition="outcome=success"]
        }
        "#,
    )
    .expect("graph should parse");
    let executor = ScriptedExecutor::new().script(
        "work",
        [
            transient_outcome(1),
            transient_outcome(2),
            success_outcome(3),
        ],
    );

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                logs_root: Some(dir.path().to_path_buf()),
                executor: Arc::new(executor),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.context.get("attempts"), Some(&json!(3)));

    let turns = NdjsonJournal::read_all(&dir.path().join(JOURNAL_FILE_NAME))
        .expect("journal should read back");
    let entered = turns
        .iter()
        .filter(|turn| {
            turn.type_id == "attractor.node_entered"
                && turn.payload.get("node_id") == Some(&json!("work"))
        })
        .count();
    let completed = turns
        .iter()
        .filter(|turn| {
            turn.type_id == "attractor.node_completed"
                && turn.payload.get("node_id") == Some(&json!("work"))
        })
        .count();
    assert_eq!(entered, 3);
    assert_eq!(completed, 3);
}

#[tokio::test(flavor = "current_thread")]
async fn loop_counter_lands_in_context_per_edge() {
    let graph = parse_graph_text(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            work [prompt="Work", auto_status="again"]
            exit [shape=Msquare]
            start -> work
            work -> work [condition="outcome=again && context.attempts<2"]
            work -> exit
        }
        "#,
    )
    .expect("graph should parse");
    let mut again = StageOutcome::with_status_token("again");
    again.context_updates.insert("attempts".to_string(), json!(1));
    let mut done = StageOutcome::with_status_token("again");
    done.context_updates.insert("attempts".to_string(), json!(2));

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                executor: Arc::new(ScriptedExecutor::new().script("work", [again, done])),
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::Success);
    let loop_keys: Vec<&String> = result
        .context
        .keys()
        .filter(|key| key.starts_with("__loop."))
        .collect();
    assert_eq!(loop_keys.len(), 1);
    assert_eq!(result.context.get(loop_keys[0]), Some(&json!(1)));
}

#[tokio::test(flavor = "current_thread")]
async fn divergent_loop_halts_at_iteration_cap() {
    let graph = parse_graph_text(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            work [prompt="Work"]
            exit [shape=Msquare]
            start -> work
            work -> work [condition="outcome=success"]
            work -> exit [condition="outcome=fail"]
        }
        "#,
    )
    .expect("graph should parse");

    // Every traversal completes with the same outcome; the cap must stop it.
    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                executor: Arc::new(ScriptedExecutor::new()),
                loop_iteration_cap: 5,
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should produce a result");

    assert_eq!(result.status, RunStatus::Fail);
    let reason = result.failure_reason.expect("failure reason expected");
    assert!(reason.contains("iterations"), "unexpected reason: {reason}");
}

#[tokio::test(flavor = "current_thread")]
async fn guarded_loop_under_cap_completes_normally() {
    let graph = parse_graph_text(
        r#"
        digraph pipeline {
            start [shape=Mdiamond]
            work [prompt="Work", auto_status="ping"]
            exit [shape=Msquare]
            start -> work
            work -> work [condition="outcome=ping && context.rounds<4"]
            work -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let mut outcomes = Vec::new();
    for round in 1..=4u64 {
        let mut outcome = StageOutcome::with_status_token("ping");
        outcome
            .context_updates
            .insert("rounds".to_string(), json!(round));
        outcomes.push(outcome);
    }

    let result = PipelineRunner
        .run(
            &graph,
            RunConfig {
                executor: Arc::new(ScriptedExecutor::new().script("work", outcomes)),
                loop_iteration_cap: 10,
                ..RunConfig::default()
            },
        )
        .await
        .expect("run should complete");
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.context.get("rounds"), Some(&json!(4)));

    let error = AttractorError::LoopDivergence {
        node_id: "work".to_string(),
        iterations: 11,
    };
    assert!(error.to_string().contains("'work'"));
}
