use crate::handlers::{MarkerHandler, SharedStageHandler, StageHandler};
use crate::{AttractorError, CancelToken, ContextValues, Graph, Node, StageOutcome};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_HANDLER_TYPE: &str = "llm";

/// Maps nodes to handlers. An explicit `type` attribute wins; otherwise the
/// node's shape decides; unknown shapes fall back to the LLM stage handler.
pub struct HandlerRegistry {
    handlers_by_type: BTreeMap<String, SharedStageHandler>,
    shape_to_type: BTreeMap<String, String>,
    default_handler_type: String,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers_by_type: BTreeMap::new(),
            shape_to_type: default_shape_mapping(),
            default_handler_type: DEFAULT_HANDLER_TYPE.to_string(),
        }
    }

    pub fn register_type(
        &mut self,
        handler_type: impl Into<String>,
        handler: SharedStageHandler,
    ) -> Option<SharedStageHandler> {
        self.handlers_by_type.insert(handler_type.into(), handler)
    }

    pub fn register_shape_mapping(
        &mut self,
        shape: impl Into<String>,
        handler_type: impl Into<String>,
    ) -> Option<String> {
        self.shape_to_type.insert(shape.into(), handler_type.into())
    }

    pub fn resolve_handler_type(&self, node: &Node) -> String {
        if let Some(node_type) = node.attrs.get_str("type") {
            let trimmed = node_type.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }

        let shape = node.attrs.get_str("shape").unwrap_or("box");
        self.shape_to_type
            .get(shape)
            .cloned()
            .unwrap_or_else(|| self.default_handler_type.clone())
    }

    pub fn resolve_handler(&self, node: &Node) -> Option<SharedStageHandler> {
        let handler_type = self.resolve_handler_type(node);
        self.handlers_by_type
            .get(&handler_type)
            .cloned()
            .or_else(|| {
                self.handlers_by_type
                    .get(&self.default_handler_type)
                    .cloned()
            })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with the marker handlers pre-registered; hosts add the LLM and
/// tool handlers they build from their adapters.
pub fn base_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_type("start", Arc::new(MarkerHandler));
    registry.register_type("exit", Arc::new(MarkerHandler));
    registry.register_type("fan_in", Arc::new(MarkerHandler));
    registry.register_type("component", Arc::new(MarkerHandler));
    registry
}

/// Executes stages by resolving through a registry.
pub struct RegistryStageExecutor {
    pub registry: HandlerRegistry,
}

impl RegistryStageExecutor {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl StageHandler for RegistryStageExecutor {
    async fn execute(
        &self,
        node: &Node,
        context: &ContextValues,
        graph: &Graph,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, AttractorError> {
        let handler = self.registry.resolve_handler(node).ok_or_else(|| {
            AttractorError::Runtime(format!(
                "no handler registered for type '{}'",
                self.registry.resolve_handler_type(node)
            ))
        })?;
        handler.execute(node, context, graph, cancel).await
    }
}

fn default_shape_mapping() -> BTreeMap<String, String> {
    [
        ("Mdiamond", "start"),
        ("Msquare", "exit"),
        ("box", "llm"),
        ("parallelogram", "tool"),
        ("component", "component"),
        ("tripleoctagon", "fan_in"),
        ("hexagon", "wait.human"),
    ]
    .into_iter()
    .map(|(shape, handler_type)| (shape.to_string(), handler_type.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_graph_text;

    fn node_with_attrs(attrs: &str) -> Node {
        let graph = parse_graph_text(&format!("digraph G {{ n1 [{attrs}] }}"))
            .expect("graph should parse");
        graph.nodes.get("n1").expect("node should exist").clone()
    }

    #[test]
    fn resolve_handler_type_explicit_type_expected_highest_precedence() {
        let registry = HandlerRegistry::new();
        let node = node_with_attrs("shape=parallelogram, type=\"llm\"");
        assert_eq!(registry.resolve_handler_type(&node), "llm");
    }

    #[test]
    fn resolve_handler_type_shape_mapping_expected_used_when_type_absent() {
        let registry = HandlerRegistry::new();
        let node = node_with_attrs("shape=parallelogram");
        assert_eq!(registry.resolve_handler_type(&node), "tool");
    }

    #[test]
    fn resolve_handler_type_unknown_shape_expected_default() {
        let registry = HandlerRegistry::new();
        let node = node_with_attrs("shape=oval");
        assert_eq!(registry.resolve_handler_type(&node), "llm");
    }

    #[test]
    fn resolve_handler_unregistered_type_falls_back_to_default_handler() {
        let mut registry = HandlerRegistry::new();
        let default_handler: SharedStageHandler = Arc::new(MarkerHandler);
        registry.register_type("llm", Arc::clone(&default_handler));

        let node = node_with_attrs("type=\"custom.handler\"");
        let resolved = registry
            .resolve_handler(&node)
            .expect("default handler should be returned");
        assert!(Arc::ptr_eq(&resolved, &default_handler));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registry_executor_without_default_handler_expected_error() {
        let registry = HandlerRegistry::new();
        let graph = parse_graph_text("digraph G { n1 }").expect("graph should parse");
        let node = graph.nodes.get("n1").expect("node should exist");
        let executor = RegistryStageExecutor::new(registry);

        let error = executor
            .execute(node, &ContextValues::new(), &graph, &CancelToken::never())
            .await
            .expect_err("execution should fail");
        assert!(matches!(error, AttractorError::Runtime(_)));
    }
}
