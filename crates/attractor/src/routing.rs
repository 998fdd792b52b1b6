use crate::{
    ContextValues, Edge, Graph, NodeKind, StageOutcome, evaluate_condition_expression, node_kind,
};

/// Result of routing a completed node.
#[derive(Debug)]
pub struct RouteSelection<'a> {
    /// Matching edges in declaration order. Exactly one for ordinary nodes,
    /// possibly several for component fan-out.
    pub edges: Vec<&'a Edge>,
    /// Conditions that failed to evaluate; surfaced as runtime diagnostics,
    /// the edges themselves treated as non-matching.
    pub warnings: Vec<String>,
}

/// Selects outgoing edges for a completed node: declaration order, first
/// condition that evaluates true. Component nodes fire every matching edge.
pub fn select_outgoing_edges<'a>(
    graph: &'a Graph,
    node_id: &'a str,
    outcome: &StageOutcome,
    context: &ContextValues,
) -> RouteSelection<'a> {
    let fan_out = graph
        .nodes
        .get(node_id)
        .is_some_and(|node| node_kind(node) == NodeKind::Component);

    let mut edges = Vec::new();
    let mut warnings = Vec::new();
    for edge in graph.outgoing_edges(node_id) {
        let condition = edge.condition();
        let matched = if condition.is_empty() {
            true
        } else {
            match evaluate_condition_expression(condition, outcome, context) {
                Ok(matched) => matched,
                Err(message) => {
                    warnings.push(format!(
                        "condition '{condition}' on edge {} -> {} failed to evaluate: {message}",
                        edge.from, edge.to
                    ));
                    false
                }
            }
        };
        if matched {
            edges.push(edge);
            if !fan_out {
                break;
            }
        }
    }

    RouteSelection { edges, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StageStatus, parse_graph_text};
    use std::collections::BTreeMap;

    fn success_outcome() -> StageOutcome {
        StageOutcome::success()
    }

    #[test]
    fn select_first_matching_edge_in_declaration_order() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> a [condition="outcome=fail"]
                n1 -> b [condition="outcome=success"]
                n1 -> a
            }
            "#,
        )
        .expect("graph should parse");

        let selection =
            select_outgoing_edges(&graph, "n1", &success_outcome(), &BTreeMap::new());
        assert_eq!(selection.edges.len(), 1);
        assert_eq!(selection.edges[0].to, "b");
        assert!(selection.warnings.is_empty());
    }

    #[test]
    fn unconditional_edge_matches_any_outcome() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                n1
                fallback
                n1 -> fallback
            }
            "#,
        )
        .expect("graph should parse");

        let mut outcome = success_outcome();
        outcome.status = StageStatus::Custom("weird_token".to_string());
        let selection = select_outgoing_edges(&graph, "n1", &outcome, &BTreeMap::new());
        assert_eq!(selection.edges.len(), 1);
        assert_eq!(selection.edges[0].to, "fallback");
    }

    #[test]
    fn component_node_fires_all_matching_edges() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                fan [shape=component]
                a
                b
                c
                fan -> a
                fan -> b [condition="outcome=fail"]
                fan -> c
            }
            "#,
        )
        .expect("graph should parse");

        let selection =
            select_outgoing_edges(&graph, "fan", &success_outcome(), &BTreeMap::new());
        let targets: Vec<&str> = selection.edges.iter().map(|edge| edge.to.as_str()).collect();
        assert_eq!(targets, vec!["a", "c"]);
    }

    #[test]
    fn malformed_condition_treated_as_non_matching_with_warning() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                n1
                a
                b
                n1 -> a [condition="=broken"]
                n1 -> b
            }
            "#,
        )
        .expect("graph should parse");

        let selection =
            select_outgoing_edges(&graph, "n1", &success_outcome(), &BTreeMap::new());
        assert_eq!(selection.edges.len(), 1);
        assert_eq!(selection.edges[0].to, "b");
        assert_eq!(selection.warnings.len(), 1);
        assert!(selection.warnings[0].contains("failed to evaluate"));
    }

    #[test]
    fn no_matching_edge_returns_empty_selection() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                n1
                a
                n1 -> a [condition="outcome=fail"]
            }
            "#,
        )
        .expect("graph should parse");

        let selection =
            select_outgoing_edges(&graph, "n1", &success_outcome(), &BTreeMap::new());
        assert!(selection.edges.is_empty());
    }
}
