use crate::{AttrValue, Attributes, AttractorError, DurationValue, Edge, Graph, Node};

/// Parses the graph text form: a DOT-like `digraph NAME { ... }` with node
/// and edge statements, default-attribute statements, and subgraphs. The
/// surface is wider than DOT in two ways that matter here: identifiers may
/// contain `-` unquoted (model ids like `claude-opus-4-6`) and numeric
/// literals may carry a duration unit suffix (`900s`, `250ms`).
pub fn parse_graph_text(source: &str) -> Result<Graph, AttractorError> {
    let mut parser = Parser::new(source);
    let mut graph = parser.parse_graph()?;
    graph.source_text = Some(source.to_string());
    Ok(graph)
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Integer(i64),
    Float(f64),
    Duration(DurationValue),
    Symbol(char),
    Arrow,
    Eof,
}

#[derive(Clone, Debug)]
struct Spanned {
    tok: Tok,
    offset: usize,
}

struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_byte_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn skip_trivia(&mut self) -> Result<(), AttractorError> {
        loop {
            match self.peek_byte() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.pos += 1;
                }
                Some(b'/') if self.peek_byte_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek_byte() {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'/') if self.peek_byte_at(1) == Some(b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    let mut closed = false;
                    while self.pos < self.bytes.len() {
                        if self.peek_byte() == Some(b'*') && self.peek_byte_at(1) == Some(b'/') {
                            self.pos += 2;
                            closed = true;
                            break;
                        }
                        self.pos += 1;
                    }
                    if !closed {
                        return Err(parse_error("unterminated block comment", start));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, AttractorError> {
        self.skip_trivia()?;
        let offset = self.pos;
        let Some(byte) = self.peek_byte() else {
            return Ok(Spanned {
                tok: Tok::Eof,
                offset,
            });
        };

        if byte == b'-' && self.peek_byte_at(1) == Some(b'>') {
            self.pos += 2;
            return Ok(Spanned {
                tok: Tok::Arrow,
                offset,
            });
        }

        if byte == b'"' {
            return self.lex_string(offset);
        }

        if byte.is_ascii_digit() {
            return self.lex_number(offset, false);
        }
        if byte == b'-' && self.peek_byte_at(1).is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
            return self.lex_number(offset, true);
        }

        if byte.is_ascii_alphabetic() || byte == b'_' {
            return self.lex_identifier(offset);
        }

        if matches!(
            byte,
            b'{' | b'}' | b'[' | b']' | b',' | b';' | b'=' | b'.' | b':' | b'/' | b'-'
        ) {
            self.pos += 1;
            return Ok(Spanned {
                tok: Tok::Symbol(byte as char),
                offset,
            });
        }

        Err(parse_error(
            format!("unexpected character '{}'", byte as char),
            offset,
        ))
    }

    fn lex_string(&mut self, offset: usize) -> Result<Spanned, AttractorError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(byte) = self.peek_byte() else {
                return Err(parse_error("unterminated string literal", offset));
            };
            self.pos += 1;
            match byte {
                b'"' => {
                    return Ok(Spanned {
                        tok: Tok::Str(out),
                        offset,
                    });
                }
                b'\\' => {
                    let Some(escaped) = self.peek_byte() else {
                        return Err(parse_error("unterminated string literal", offset));
                    };
                    self.pos += 1;
                    match escaped {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        other => {
                            // Unknown escapes pass through verbatim.
                            out.push('\\');
                            out.push(other as char);
                        }
                    }
                }
                other => out.push(other as char),
            }
        }
    }

    fn lex_number(&mut self, offset: usize, negative: bool) -> Result<Spanned, AttractorError> {
        let digits_start = self.pos;
        let mut seen_dot = false;
        while let Some(byte) = self.peek_byte() {
            if byte.is_ascii_digit() {
                self.pos += 1;
            } else if byte == b'.' {
                if seen_dot {
                    return Err(parse_error("malformed float literal", offset));
                }
                if !self.peek_byte_at(1).is_some_and(|b| b.is_ascii_digit()) {
                    return Err(parse_error("malformed float literal", offset));
                }
                seen_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }

        let digits = std::str::from_utf8(&self.bytes[digits_start..self.pos])
            .map_err(|_| parse_error("invalid numeric literal", offset))?
            .to_string();

        let mut suffix = String::new();
        while let Some(byte) = self.peek_byte() {
            if byte.is_ascii_alphabetic() {
                suffix.push(byte as char);
                self.pos += 1;
            } else {
                break;
            }
        }

        if !suffix.is_empty() {
            if negative || seen_dot {
                return Err(parse_error(
                    format!("invalid unit suffix '{suffix}' on numeric literal"),
                    offset,
                ));
            }
            let raw = format!("{digits}{suffix}");
            let Some(duration) = parse_duration(&raw) else {
                return Err(parse_error(
                    format!("unknown unit suffix '{suffix}' on numeric literal"),
                    offset,
                ));
            };
            return Ok(Spanned {
                tok: Tok::Duration(duration),
                offset,
            });
        }

        if seen_dot {
            let value: f64 = digits
                .parse()
                .map_err(|_| parse_error("malformed float literal", offset))?;
            let value = if negative { -value } else { value };
            return Ok(Spanned {
                tok: Tok::Float(value),
                offset,
            });
        }

        let value: i64 = digits
            .parse()
            .map_err(|_| parse_error("integer literal out of range", offset))?;
        let value = if negative { -value } else { value };
        Ok(Spanned {
            tok: Tok::Integer(value),
            offset,
        })
    }

    fn lex_identifier(&mut self, offset: usize) -> Result<Spanned, AttractorError> {
        let start = self.pos;
        while let Some(byte) = self.peek_byte() {
            let is_ident_byte = byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'.';
            // A dash continues the identifier only when not starting an arrow.
            let is_dash = byte == b'-' && self.peek_byte_at(1) != Some(b'>');
            if is_ident_byte || is_dash {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| parse_error("invalid identifier", offset))?
            .to_string();
        Ok(Spanned {
            tok: Tok::Ident(text),
            offset,
        })
    }
}

#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: Attributes,
    edge_defaults: Attributes,
    classes: Vec<String>,
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Spanned,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lexer: Lexer::new(source),
            current: Spanned {
                tok: Tok::Eof,
                offset: 0,
            },
        }
    }

    fn advance(&mut self) -> Result<(), AttractorError> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<(), AttractorError> {
        if self.current.tok == Tok::Symbol(symbol) {
            self.advance()
        } else {
            Err(parse_error(
                format!("expected '{symbol}'"),
                self.current.offset,
            ))
        }
    }

    fn parse_graph(&mut self) -> Result<Graph, AttractorError> {
        self.advance()?;
        match &self.current.tok {
            Tok::Ident(keyword) if keyword == "digraph" => {}
            Tok::Ident(keyword) if keyword == "graph" => {
                return Err(parse_error(
                    "undirected 'graph' is not supported; use 'digraph'",
                    self.current.offset,
                ));
            }
            _ => {
                return Err(parse_error("expected 'digraph'", self.current.offset));
            }
        }
        self.advance()?;

        let name = match &self.current.tok {
            Tok::Ident(name) => name.clone(),
            Tok::Str(name) => name.clone(),
            Tok::Symbol('{') => String::new(),
            _ => {
                return Err(parse_error("expected graph name", self.current.offset));
            }
        };
        if !name.is_empty() {
            self.advance()?;
        }
        self.expect_symbol('{')?;

        let mut graph = Graph::new(if name.is_empty() {
            "attractor".to_string()
        } else {
            name
        });
        let scope = Scope::default();
        self.parse_statements(&mut graph, &scope, true)?;
        self.expect_symbol('}')?;

        if self.current.tok != Tok::Eof {
            return Err(parse_error(
                "unexpected trailing input after graph body",
                self.current.offset,
            ));
        }
        Ok(graph)
    }

    fn parse_statements(
        &mut self,
        graph: &mut Graph,
        parent_scope: &Scope,
        top_level: bool,
    ) -> Result<(), AttractorError> {
        let mut scope = parent_scope.clone();

        loop {
            match &self.current.tok {
                Tok::Symbol('}') | Tok::Eof => return Ok(()),
                Tok::Symbol(';') | Tok::Symbol(',') => self.advance()?,
                Tok::Ident(keyword) if keyword == "subgraph" => {
                    self.parse_subgraph(graph, &scope)?;
                }
                Tok::Ident(keyword) if keyword == "node" => {
                    self.advance()?;
                    let attrs = self.parse_attr_block()?;
                    scope.node_defaults.merge_inherited(&attrs);
                }
                Tok::Ident(keyword) if keyword == "edge" => {
                    self.advance()?;
                    let attrs = self.parse_attr_block()?;
                    scope.edge_defaults.merge_inherited(&attrs);
                }
                Tok::Ident(keyword) if keyword == "graph" => {
                    self.advance()?;
                    let attrs = self.parse_attr_block()?;
                    if top_level {
                        graph.attrs.merge_with_explicit_tracking(&attrs);
                    }
                }
                Tok::Ident(_) | Tok::Str(_) => {
                    self.parse_node_or_edge_or_attr(graph, &scope, top_level)?;
                }
                _ => {
                    return Err(parse_error(
                        "expected a statement (node, edge, attribute, or subgraph)",
                        self.current.offset,
                    ));
                }
            }
        }
    }

    fn parse_subgraph(&mut self, graph: &mut Graph, scope: &Scope) -> Result<(), AttractorError> {
        self.advance()?;
        if matches!(self.current.tok, Tok::Ident(_) | Tok::Str(_)) {
            self.advance()?;
        }
        self.expect_symbol('{')?;

        let existing: std::collections::BTreeSet<String> = graph.nodes.keys().cloned().collect();
        let mut inner = scope.clone();
        let label = self.parse_subgraph_statements(graph, &mut inner)?;
        self.expect_symbol('}')?;

        // The subgraph label tags every node declared within it with a class.
        if let Some(class_name) = label.as_deref().and_then(derive_class_name) {
            for (node_id, node) in graph.nodes.iter_mut() {
                if existing.contains(node_id) {
                    continue;
                }
                let mut classes = parse_class_list(node.attrs.get_str("class").unwrap_or_default());
                if !classes.iter().any(|existing_class| *existing_class == class_name) {
                    classes.push(class_name.clone());
                }
                node.attrs
                    .set_inherited("class", AttrValue::String(classes.join(",")));
            }
        }
        Ok(())
    }

    fn parse_subgraph_statements(
        &mut self,
        graph: &mut Graph,
        scope: &mut Scope,
    ) -> Result<Option<String>, AttractorError> {
        let mut label = None;
        loop {
            match &self.current.tok {
                Tok::Symbol('}') | Tok::Eof => return Ok(label),
                Tok::Symbol(';') | Tok::Symbol(',') => self.advance()?,
                Tok::Ident(keyword) if keyword == "subgraph" => {
                    self.parse_subgraph(graph, scope)?;
                }
                Tok::Ident(keyword) if keyword == "node" => {
                    self.advance()?;
                    let attrs = self.parse_attr_block()?;
                    scope.node_defaults.merge_inherited(&attrs);
                }
                Tok::Ident(keyword) if keyword == "edge" => {
                    self.advance()?;
                    let attrs = self.parse_attr_block()?;
                    scope.edge_defaults.merge_inherited(&attrs);
                }
                Tok::Ident(keyword) if keyword == "graph" => {
                    self.advance()?;
                    let attrs = self.parse_attr_block()?;
                    if let Some(value) = attrs.get_str("label") {
                        label = Some(value.to_string());
                    }
                }
                Tok::Ident(name) if name == "label" => {
                    let name = name.clone();
                    self.advance()?;
                    if self.current.tok == Tok::Symbol('=') {
                        self.advance()?;
                        let value = self.parse_attr_value()?;
                        label = Some(value.to_string_value());
                    } else {
                        self.push_back_node(graph, scope, name)?;
                    }
                }
                Tok::Ident(_) | Tok::Str(_) => {
                    self.parse_node_or_edge_or_attr(graph, scope, false)?;
                }
                _ => {
                    return Err(parse_error(
                        "expected a statement inside subgraph",
                        self.current.offset,
                    ));
                }
            }
        }
    }

    fn push_back_node(
        &mut self,
        graph: &mut Graph,
        scope: &Scope,
        name: String,
    ) -> Result<(), AttractorError> {
        // `label` used as a plain node id (no '=' followed).
        self.finish_node_or_edge(graph, scope, name)
    }

    fn parse_node_or_edge_or_attr(
        &mut self,
        graph: &mut Graph,
        scope: &Scope,
        top_level: bool,
    ) -> Result<(), AttractorError> {
        let name = match &self.current.tok {
            Tok::Ident(name) => name.clone(),
            Tok::Str(name) => name.clone(),
            _ => {
                return Err(parse_error("expected identifier", self.current.offset));
            }
        };
        self.advance()?;

        if self.current.tok == Tok::Symbol('=') {
            self.advance()?;
            let value = self.parse_attr_value()?;
            if top_level {
                graph.attrs.set_explicit(name, value);
            }
            return Ok(());
        }

        self.finish_node_or_edge(graph, scope, name)
    }

    fn finish_node_or_edge(
        &mut self,
        graph: &mut Graph,
        scope: &Scope,
        first: String,
    ) -> Result<(), AttractorError> {
        if self.current.tok == Tok::Arrow {
            let mut chain = vec![first];
            while self.current.tok == Tok::Arrow {
                self.advance()?;
                let target = match &self.current.tok {
                    Tok::Ident(name) => name.clone(),
                    Tok::Str(name) => name.clone(),
                    _ => {
                        return Err(parse_error(
                            "expected node id after '->'",
                            self.current.offset,
                        ));
                    }
                };
                self.advance()?;
                chain.push(target);
            }

            let mut attrs = scope.edge_defaults.without_explicit();
            let parsed = self.parse_attr_block()?;
            attrs.merge_with_explicit_tracking(&parsed);

            for pair in chain.windows(2) {
                for id in pair {
                    ensure_node(graph, scope, id);
                }
                graph.edges.push(Edge {
                    from: pair[0].clone(),
                    to: pair[1].clone(),
                    attrs: attrs.clone(),
                });
            }
            return Ok(());
        }

        let mut attrs = scope.node_defaults.without_explicit();
        let parsed = self.parse_attr_block()?;
        attrs.merge_with_explicit_tracking(&parsed);

        let entry = graph
            .nodes
            .entry(first.clone())
            .or_insert_with(|| Node::new(first));
        entry.attrs.merge_with_explicit_tracking(&attrs);
        Ok(())
    }

    fn parse_attr_block(&mut self) -> Result<Attributes, AttractorError> {
        let mut attrs = Attributes::new();
        if self.current.tok != Tok::Symbol('[') {
            return Ok(attrs);
        }
        self.advance()?;

        loop {
            match &self.current.tok {
                Tok::Symbol(']') => {
                    self.advance()?;
                    return Ok(attrs);
                }
                Tok::Symbol(',') | Tok::Symbol(';') => self.advance()?,
                Tok::Ident(_) | Tok::Str(_) => {
                    let key = match &self.current.tok {
                        Tok::Ident(key) => key.clone(),
                        Tok::Str(key) => key.clone(),
                        _ => unreachable!(),
                    };
                    if !is_valid_attr_key(&key) {
                        return Err(parse_error(
                            format!("invalid attribute key '{key}'"),
                            self.current.offset,
                        ));
                    }
                    self.advance()?;
                    self.expect_symbol('=')?;
                    let value = self.parse_attr_value()?;
                    attrs.set_explicit(key, value);
                }
                Tok::Eof => {
                    return Err(parse_error(
                        "unterminated attribute block",
                        self.current.offset,
                    ));
                }
                _ => {
                    return Err(parse_error(
                        "expected attribute key",
                        self.current.offset,
                    ));
                }
            }
        }
    }

    fn parse_attr_value(&mut self) -> Result<AttrValue, AttractorError> {
        // Quoted values always stay strings; duration-typed keys parse them
        // on demand through `AttrValue::as_duration_ms`.
        let value = match &self.current.tok {
            Tok::Str(text) => AttrValue::String(text.clone()),
            Tok::Ident(text) => match text.as_str() {
                "true" => AttrValue::Boolean(true),
                "false" => AttrValue::Boolean(false),
                _ => AttrValue::String(text.clone()),
            },
            Tok::Integer(value) => AttrValue::Integer(*value),
            Tok::Float(value) => AttrValue::Float(*value),
            Tok::Duration(duration) => AttrValue::Duration(duration.clone()),
            _ => {
                return Err(parse_error(
                    "expected attribute value",
                    self.current.offset,
                ));
            }
        };
        self.advance()?;
        Ok(value)
    }
}

fn ensure_node(graph: &mut Graph, scope: &Scope, id: &str) {
    if !graph.nodes.contains_key(id) {
        let mut node = Node::new(id);
        node.attrs = scope.node_defaults.without_explicit();
        graph.nodes.insert(id.to_string(), node);
    }
}

fn parse_error(message: impl Into<String>, offset: usize) -> AttractorError {
    AttractorError::Parse {
        message: message.into(),
        offset,
    }
}

pub(crate) fn parse_duration(raw: &str) -> Option<DurationValue> {
    if raw.len() < 2 {
        return None;
    }

    let units = ["ms", "s", "m", "h", "d"];
    let unit = units.iter().find(|unit| raw.ends_with(**unit))?;
    let number_part = &raw[..raw.len() - unit.len()];
    let value = number_part.parse::<u64>().ok()?;

    let factor = match *unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };

    Some(DurationValue {
        raw: raw.to_string(),
        millis: value.saturating_mul(factor),
    })
}

fn parse_class_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn derive_class_name(label: &str) -> Option<String> {
    let mut out = String::new();
    let mut prev_dash = false;
    for ch in label.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_dash = false;
        } else if ch.is_ascii_whitespace() || ch == '-' {
            if !prev_dash && !out.is_empty() {
                out.push('-');
                prev_dash = true;
            }
        }
    }
    if out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() { None } else { Some(out) }
}

fn is_valid_attr_key(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    for part in value.split('.') {
        if part.is_empty() {
            return false;
        }
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
            _ => return false,
        }
        if !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_linear_graph_expected_nodes_and_edges() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                start [shape=Mdiamond]
                plan [prompt="Do thing"]
                exit [shape=Msquare]
                start -> plan -> exit
            }
            "#,
        )
        .expect("graph should parse");

        assert_eq!(graph.id, "G");
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(
            graph.nodes.get("plan").and_then(|node| node.prompt()),
            Some("Do thing")
        );
    }

    #[test]
    fn parse_comments_stripped_but_not_inside_strings() {
        let graph = parse_graph_text(
            "digraph G {\n// full line comment\nplan [prompt=\"keep // this /* and this */\"] /* block */\n}",
        )
        .expect("graph should parse");
        assert_eq!(
            graph.nodes.get("plan").and_then(|node| node.prompt()),
            Some("keep // this /* and this */")
        );
    }

    #[test]
    fn parse_dashed_identifier_expected_unquoted_model_id() {
        let graph = parse_graph_text("digraph G { plan [model=claude-opus-4-6] }")
            .expect("graph should parse");
        assert_eq!(
            graph
                .nodes
                .get("plan")
                .and_then(|node| node.attrs.get_str("model")),
            Some("claude-opus-4-6")
        );
    }

    #[test]
    fn parse_quoted_duration_lookalike_stays_string() {
        let graph = parse_graph_text(
            r#"digraph G { a b a -> b [label="5m", condition="outcome=success"] }"#,
        )
        .expect("graph should parse");
        let edge = graph.edges.first().expect("edge should exist");
        assert_eq!(edge.attrs.get_str("label"), Some("5m"));
        assert_eq!(
            edge.attrs.get("label"),
            Some(&AttrValue::String("5m".to_string()))
        );
    }

    #[test]
    fn parse_duration_literal_expected_millis() {
        let graph =
            parse_graph_text("digraph G { plan [timeout=900s, poll=250ms] }").expect("should parse");
        let node = graph.nodes.get("plan").expect("node should exist");
        assert!(matches!(
            node.attrs.get("timeout"),
            Some(AttrValue::Duration(DurationValue { millis: 900_000, .. }))
        ));
        assert!(matches!(
            node.attrs.get("poll"),
            Some(AttrValue::Duration(DurationValue { millis: 250, .. }))
        ));
    }

    #[test]
    fn parse_unterminated_string_expected_offset_error() {
        let error = parse_graph_text("digraph G { plan [prompt=\"oops] }")
            .expect_err("parse should fail");
        match error {
            AttractorError::Parse { message, offset } => {
                assert!(message.contains("unterminated string"));
                assert_eq!(offset, 25);
            }
            other => panic!("expected parse error, got {other}"),
        }
    }

    #[test]
    fn parse_unterminated_block_comment_expected_error() {
        let error =
            parse_graph_text("digraph G { /* never closed }").expect_err("parse should fail");
        assert!(error.to_string().contains("unterminated block comment"));
    }

    #[test]
    fn parse_malformed_float_expected_error() {
        let error =
            parse_graph_text("digraph G { n [weight=1.2.3] }").expect_err("parse should fail");
        assert!(error.to_string().contains("malformed float"));
    }

    #[test]
    fn parse_unknown_escape_passes_through_verbatim() {
        let graph = parse_graph_text(r#"digraph G { n [prompt="a\qb\n"] }"#)
            .expect("graph should parse");
        assert_eq!(
            graph.nodes.get("n").and_then(|node| node.prompt()),
            Some("a\\qb\n")
        );
    }

    #[test]
    fn parse_node_defaults_applied_to_later_nodes() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                node [max_retries=2]
                plan
                review [max_retries=5]
            }
            "#,
        )
        .expect("graph should parse");
        assert_eq!(
            graph
                .nodes
                .get("plan")
                .and_then(|node| node.attrs.get("max_retries"))
                .and_then(AttrValue::as_i64),
            Some(2)
        );
        assert_eq!(
            graph
                .nodes
                .get("review")
                .and_then(|node| node.attrs.get("max_retries"))
                .and_then(AttrValue::as_i64),
            Some(5)
        );
    }

    #[test]
    fn parse_subgraph_label_derives_class() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                subgraph cluster_loop {
                    label="Loop A"
                    Plan [timeout=900s]
                }
            }
            "#,
        )
        .expect("graph should parse");
        let node = graph.nodes.get("Plan").expect("node should exist");
        assert_eq!(node.attrs.get_str("class"), Some("loop-a"));
    }

    #[test]
    fn parse_graph_attributes_expected_on_graph() {
        let graph = parse_graph_text(
            r#"
            digraph G {
                goal="ship the feature"
                graph [default_max_retry=2]
                n
            }
            "#,
        )
        .expect("graph should parse");
        assert_eq!(graph.attrs.get_str("goal"), Some("ship the feature"));
        assert_eq!(
            graph.attrs.get("default_max_retry").and_then(AttrValue::as_i64),
            Some(2)
        );
    }

    #[test]
    fn parse_print_round_trip_identity_modulo_attr_order() {
        let source = r#"
            digraph G {
                goal="ship"
                start [shape=Mdiamond]
                plan [prompt="Plan it", max_retries=2, timeout=900s]
                exit [shape=Msquare]
                start -> plan [condition="outcome=success"]
                plan -> exit
            }
            "#;
        let graph = parse_graph_text(source).expect("graph should parse");
        let printed = graph.to_text();
        let reparsed = parse_graph_text(&printed).expect("printed graph should reparse");

        assert_eq!(reparsed.id, graph.id);
        assert_eq!(reparsed.attrs.values(), graph.attrs.values());
        assert_eq!(reparsed.nodes.len(), graph.nodes.len());
        for (id, node) in &graph.nodes {
            assert_eq!(
                reparsed.nodes.get(id).map(|reparsed_node| reparsed_node.attrs.values()),
                Some(node.attrs.values())
            );
        }
        assert_eq!(reparsed.edges.len(), graph.edges.len());
        for (reparsed_edge, edge) in reparsed.edges.iter().zip(graph.edges.iter()) {
            assert_eq!(reparsed_edge.from, edge.from);
            assert_eq!(reparsed_edge.to, edge.to);
            assert_eq!(reparsed_edge.attrs.values(), edge.attrs.values());
        }
    }

    #[test]
    fn parse_rejects_undirected_graph_keyword() {
        let error = parse_graph_text("graph G { a }").expect_err("parse should fail");
        assert!(error.to_string().contains("digraph"));
    }
}
