use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DurationValue {
    pub raw: String,
    pub millis: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Duration(DurationValue),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_duration_ms(&self) -> Option<u64> {
        match self {
            Self::Duration(value) => Some(value.millis),
            Self::Integer(value) if *value >= 0 => Some(*value as u64),
            Self::String(value) => crate::parse::parse_duration(value).map(|d| d.millis),
            _ => None,
        }
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Duration(value) => value.raw.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
    explicit_keys: BTreeSet<String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn set_inherited(&mut self, key: impl Into<String>, value: AttrValue) {
        self.values.insert(key.into(), value);
    }

    pub fn set_explicit(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        self.explicit_keys.insert(key.clone());
        self.values.insert(key, value);
    }

    pub fn merge_inherited(&mut self, other: &Attributes) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn merge_with_explicit_tracking(&mut self, other: &Attributes) {
        for (key, value) in &other.values {
            if other.explicit_keys.contains(key) {
                self.explicit_keys.insert(key.clone());
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn is_explicit(&self, key: &str) -> bool {
        self.explicit_keys.contains(key)
    }

    pub fn without_explicit(&self) -> Self {
        Self {
            values: self.values.clone(),
            explicit_keys: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub attrs: Attributes,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        self.attrs
            .get_str("prompt")
            .or_else(|| self.attrs.get_str("llm_prompt"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: Attributes,
}

impl Edge {
    pub fn condition(&self) -> &str {
        self.attrs.get_str("condition").unwrap_or_default().trim()
    }

    pub fn is_loop_restart(&self) -> bool {
        self.attrs.get_bool("loop_restart") == Some(true)
            || self.attrs.get_str("loop_restart") == Some("true")
    }
}

/// Node role projected from the free-form attribute map. Shapes are semantic:
/// the rest of the runtime is total over this closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    Terminal,
    LlmStage,
    ToolStage,
    Component,
    FanIn,
    HumanGate,
}

pub fn node_kind(node: &Node) -> NodeKind {
    if let Some(explicit) = node.attrs.get_str("type").map(str::trim) {
        match explicit {
            "start" => return NodeKind::Start,
            "exit" => return NodeKind::Terminal,
            "llm" | "codergen" => return NodeKind::LlmStage,
            "tool" => return NodeKind::ToolStage,
            "component" | "parallel" => return NodeKind::Component,
            "fan_in" | "parallel.fan_in" => return NodeKind::FanIn,
            "wait.human" => return NodeKind::HumanGate,
            _ => {}
        }
    }

    match node
        .attrs
        .get_str("shape")
        .map(str::trim)
        .unwrap_or("box")
        .to_ascii_lowercase()
        .as_str()
    {
        "mdiamond" => NodeKind::Start,
        "msquare" => NodeKind::Terminal,
        "parallelogram" => NodeKind::ToolStage,
        "component" => NodeKind::Component,
        "tripleoctagon" => NodeKind::FanIn,
        "hexagon" => NodeKind::HumanGate,
        _ => NodeKind::LlmStage,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub attrs: Attributes,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing, skip_deserializing)]
    pub source_text: Option<String>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attributes::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            source_text: None,
        }
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    pub fn start_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node_kind(node) == NodeKind::Start)
            .collect()
    }

    pub fn terminal_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node_kind(node) == NodeKind::Terminal)
            .collect()
    }

    /// Stable key identifying an edge for loop counters; edges are addressed
    /// by declaration index so parallel edges between the same pair stay
    /// distinct.
    pub fn edge_key(&self, edge: &Edge) -> String {
        let index = self
            .edges
            .iter()
            .position(|candidate| std::ptr::eq(candidate, edge))
            .unwrap_or(0);
        format!("{}->{}#{index}", edge.from, edge.to)
    }

    /// Prints the graph back into its text form. `parse(to_text(g))` equals
    /// `g` modulo attribute ordering.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph {} {{", quote_if_needed(&self.id));
        for (key, value) in self.attrs.values() {
            let _ = writeln!(out, "    {}={};", key, format_attr_value(value));
        }
        for node in self.nodes.values() {
            let _ = write!(out, "    {}", quote_if_needed(&node.id));
            write_attr_block(&mut out, &node.attrs);
            out.push_str(";\n");
        }
        for edge in &self.edges {
            let _ = write!(
                out,
                "    {} -> {}",
                quote_if_needed(&edge.from),
                quote_if_needed(&edge.to)
            );
            write_attr_block(&mut out, &edge.attrs);
            out.push_str(";\n");
        }
        out.push_str("}\n");
        out
    }
}

fn write_attr_block(out: &mut String, attrs: &Attributes) {
    if attrs.is_empty() {
        return;
    }
    out.push_str(" [");
    let mut first = true;
    for (key, value) in attrs.values() {
        if !first {
            out.push_str(", ");
        }
        first = false;
        let _ = write!(out, "{}={}", key, format_attr_value(value));
    }
    out.push(']');
}

fn format_attr_value(value: &AttrValue) -> String {
    match value {
        AttrValue::String(inner) => format!("\"{}\"", escape_string(inner)),
        AttrValue::Integer(inner) => inner.to_string(),
        AttrValue::Float(inner) => {
            let printed = inner.to_string();
            if printed.contains('.') {
                printed
            } else {
                format!("{printed}.0")
            }
        }
        AttrValue::Boolean(inner) => inner.to_string(),
        AttrValue::Duration(inner) => inner.raw.clone(),
    }
}

fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn quote_if_needed(value: &str) -> String {
    let bare = !value.is_empty()
        && value.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if bare {
        value.to_string()
    } else {
        format!("\"{}\"", escape_string(value))
    }
}
