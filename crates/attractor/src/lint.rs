use crate::{
    Diagnostic, Graph, ModelCatalog, NodeKind, Severity, ValidationError,
    canonical_anthropic_model, node_kind, referenced_outcome_tokens, validate_condition_expression,
};
use crate::StageStatus;
use std::collections::{BTreeSet, VecDeque};

const DEPRECATED_POLICY_KEYS: &[(&str, &str)] = &[(
    "git.checkpoint_exclude_globs",
    "artifact_policy.checkpoint.exclude_globs",
)];

/// Runs every rule over the graph. Deterministic: the same graph bytes
/// produce the same diagnostics in the same order.
pub fn validate(graph: &Graph, catalog: Option<&ModelCatalog>) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_start_node(graph));
    diagnostics.extend(rule_terminal_node(graph));
    diagnostics.extend(rule_edge_endpoints_exist(graph));
    diagnostics.extend(rule_start_no_incoming(graph));
    diagnostics.extend(rule_exit_no_outgoing(graph));
    diagnostics.extend(rule_reachability(graph));
    diagnostics.extend(rule_condition_syntax(graph));
    diagnostics.extend(rule_outcome_tokens(graph));
    diagnostics.extend(rule_model_lint(graph, catalog));
    diagnostics.extend(rule_loop_discipline(graph));
    diagnostics.extend(rule_artifact_policy_keys(graph));
    diagnostics.extend(rule_tool_command_present(graph));
    diagnostics.extend(rule_prompt_on_llm_nodes(graph));

    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    catalog: Option<&ModelCatalog>,
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(graph, catalog);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    if starts.len() == 1 {
        Vec::new()
    } else {
        vec![Diagnostic::new(
            "start_node",
            Severity::Error,
            format!(
                "graph must have exactly one start node; found {}",
                starts.len()
            ),
        )]
    }
}

fn rule_terminal_node(graph: &Graph) -> Vec<Diagnostic> {
    let exits = graph.terminal_candidates();
    if exits.is_empty() {
        return vec![Diagnostic::new(
            "terminal_node",
            Severity::Error,
            "graph must have at least one terminal node",
        )];
    }

    let reachable = reachable_from_start(graph);
    if !exits.iter().any(|exit| reachable.contains(&exit.id)) {
        return vec![Diagnostic::new(
            "terminal_node",
            Severity::Error,
            "no terminal node is reachable from the start node",
        )];
    }
    Vec::new()
}

fn rule_edge_endpoints_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        for (endpoint, label) in [(&edge.from, "source"), (&edge.to, "target")] {
            if !graph.nodes.contains_key(endpoint) {
                diagnostics.push(
                    Diagnostic::new(
                        "edge_endpoints_exist",
                        Severity::Error,
                        format!("edge {label} '{endpoint}' does not exist"),
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
        }
    }
    diagnostics
}

fn rule_start_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for start in graph.start_candidates() {
        if graph.incoming_edges(&start.id).next().is_some() {
            diagnostics.push(
                Diagnostic::new(
                    "start_no_incoming",
                    Severity::Error,
                    "start node must have no incoming edges",
                )
                .with_node_id(start.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_exit_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for terminal in graph.terminal_candidates() {
        if graph.outgoing_edges(&terminal.id).next().is_some() {
            diagnostics.push(
                Diagnostic::new(
                    "exit_no_outgoing",
                    Severity::Error,
                    "terminal node must have no outgoing edges",
                )
                .with_node_id(terminal.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_reachability(graph: &Graph) -> Vec<Diagnostic> {
    if graph.start_candidates().len() != 1 {
        return Vec::new();
    }
    let reachable = reachable_from_start(graph);

    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if !reachable.contains(&node.id) {
            diagnostics.push(
                Diagnostic::new(
                    "reachability",
                    Severity::Warning,
                    "node is unreachable from start",
                )
                .with_node_id(node.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_condition_syntax(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        let condition = edge.condition();
        if condition.is_empty() {
            continue;
        }
        if let Err(message) = validate_condition_expression(condition) {
            diagnostics.push(
                Diagnostic::new("condition_syntax", Severity::Error, message)
                    .with_edge(edge.from.clone(), edge.to.clone()),
            );
        }
    }
    diagnostics
}

/// `outcome=` may only reference a known status or a custom token some node
/// declares via `auto_status`.
fn rule_outcome_tokens(graph: &Graph) -> Vec<Diagnostic> {
    let known: BTreeSet<&str> = ["success", "fail", "skipped", "canceled"].into();
    let declared: BTreeSet<String> = graph
        .nodes
        .values()
        .filter_map(|node| node.attrs.get_str("auto_status"))
        .map(StageStatus::canonical)
        .collect();

    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        for token in referenced_outcome_tokens(edge.condition()) {
            if known.contains(token.as_str()) || declared.contains(&token) {
                continue;
            }
            diagnostics.push(
                Diagnostic::new(
                    "outcome_tokens",
                    Severity::Error,
                    format!(
                        "outcome token '{token}' is neither a known status nor declared by any \
                         node's auto_status"
                    ),
                )
                .with_edge(edge.from.clone(), edge.to.clone()),
            );
        }
    }
    diagnostics
}

fn rule_model_lint(graph: &Graph, catalog: Option<&ModelCatalog>) -> Vec<Diagnostic> {
    let Some(catalog) = catalog else {
        return Vec::new();
    };

    let default_provider = graph.attrs.get_str("default_provider");
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        let Some(model) = node.attrs.get_str("model") else {
            continue;
        };
        let provider = node.attrs.get_str("provider").or(default_provider);
        let resolves = match provider {
            Some(provider) => catalog.resolves(provider, model),
            None => catalog.any_provider_resolves(model),
        };
        if resolves {
            continue;
        }

        let suggestion = canonical_anthropic_model(model).filter(|canonical| match provider {
            Some(provider) => catalog.resolves(provider, canonical),
            None => catalog.any_provider_resolves(canonical),
        });
        let mut diagnostic = Diagnostic::new(
            "model_lint",
            Severity::Warning,
            match provider {
                Some(provider) => format!("model '{provider}/{model}' is not in the catalog"),
                None => format!("model '{model}' is not in the catalog"),
            },
        )
        .with_node_id(node.id.clone());
        if let Some(canonical) = suggestion {
            diagnostic = diagnostic.with_fix(format!("did you mean '{canonical}'?"));
        }
        diagnostics.push(diagnostic);
    }
    diagnostics
}

/// Every back edge must carry an `outcome=` guard or loop_restart; a guarded
/// restart is fine, a bare one only warns.
fn rule_loop_discipline(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (from, to) in back_edges(graph) {
        let Some(edge) = graph
            .edges
            .iter()
            .find(|edge| edge.from == from && edge.to == to)
        else {
            continue;
        };
        let has_outcome_guard = !referenced_outcome_tokens(edge.condition()).is_empty();
        let is_restart = edge.is_loop_restart();

        if has_outcome_guard {
            continue;
        }
        if is_restart {
            if edge.condition().is_empty() {
                diagnostics.push(
                    Diagnostic::new(
                        "loop_discipline",
                        Severity::Warning,
                        "loop_restart edge has no terminating guard",
                    )
                    .with_edge(edge.from.clone(), edge.to.clone()),
                );
            }
            continue;
        }
        diagnostics.push(
            Diagnostic::new(
                "loop_discipline",
                Severity::Warning,
                "back edge has no outcome guard or loop_restart; possibly infinite loop",
            )
            .with_edge(edge.from.clone(), edge.to.clone()),
        );
    }
    diagnostics
}

fn rule_artifact_policy_keys(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (deprecated, replacement) in DEPRECATED_POLICY_KEYS {
        if graph.attrs.get(deprecated).is_some() {
            diagnostics.push(
                Diagnostic::new(
                    "artifact_policy_keys",
                    Severity::Error,
                    format!("'{deprecated}' is deprecated"),
                )
                .with_fix(format!("use '{replacement}'")),
            );
        }
    }
    diagnostics
}

fn rule_tool_command_present(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if node_kind(node) == NodeKind::ToolStage
            && node
                .attrs
                .get_str("tool_command")
                .unwrap_or_default()
                .trim()
                .is_empty()
        {
            diagnostics.push(
                Diagnostic::new(
                    "tool_command_present",
                    Severity::Error,
                    "tool node has no tool_command",
                )
                .with_node_id(node.id.clone()),
            );
        }
    }
    diagnostics
}

fn rule_prompt_on_llm_nodes(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for node in graph.nodes.values() {
        if node_kind(node) == NodeKind::LlmStage && node.prompt().is_none() {
            diagnostics.push(
                Diagnostic::new(
                    "prompt_on_llm_nodes",
                    Severity::Warning,
                    "llm node has no prompt",
                )
                .with_node_id(node.id.clone()),
            );
        }
    }
    diagnostics
}

fn reachable_from_start(graph: &Graph) -> BTreeSet<String> {
    let mut visited = BTreeSet::new();
    let Some(start) = graph.start_candidates().into_iter().next() else {
        return visited;
    };

    let mut queue = VecDeque::new();
    visited.insert(start.id.clone());
    queue.push_back(start.id.clone());
    while let Some(node_id) = queue.pop_front() {
        for edge in graph.outgoing_edges(&node_id) {
            if visited.insert(edge.to.clone()) {
                queue.push_back(edge.to.clone());
            }
        }
    }
    visited
}

/// Back edges found by DFS from the start node.
fn back_edges(graph: &Graph) -> Vec<(String, String)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let Some(start) = graph.start_candidates().into_iter().next() else {
        return Vec::new();
    };

    let mut colors: std::collections::BTreeMap<String, Color> = graph
        .nodes
        .keys()
        .map(|id| (id.clone(), Color::White))
        .collect();
    let mut back = Vec::new();
    let mut stack: Vec<(String, Vec<String>)> = Vec::new();

    colors.insert(start.id.clone(), Color::Gray);
    let neighbors: Vec<String> = graph.outgoing_edges(&start.id).map(|e| e.to.clone()).collect();
    stack.push((start.id.clone(), neighbors));

    while !stack.is_empty() {
        let (current, next) = {
            let (node_id, neighbors) = stack.last_mut().expect("stack is non-empty");
            (node_id.clone(), neighbors.pop())
        };
        match next {
            Some(next) => match colors.get(&next).copied() {
                Some(Color::White) => {
                    colors.insert(next.clone(), Color::Gray);
                    let next_neighbors: Vec<String> =
                        graph.outgoing_edges(&next).map(|e| e.to.clone()).collect();
                    stack.push((next, next_neighbors));
                }
                Some(Color::Gray) => back.push((current, next)),
                _ => {}
            },
            None => {
                colors.insert(current, Color::Black);
                stack.pop();
            }
        }
    }
    back.sort();
    back.dedup();
    back
}
