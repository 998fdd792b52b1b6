use crate::{ContextValues, StageOutcome, StageStatus};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Exists,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Clause<'a> {
    key: &'a str,
    operator: Operator,
    value: Option<&'a str>,
}

pub fn validate_condition_expression(condition: &str) -> Result<(), String> {
    for clause in parse_clauses(condition)? {
        if !is_condition_key(clause.key) {
            return Err(format!("condition key '{}' is invalid", clause.key));
        }
        if clause.operator != Operator::Exists
            && clause.value.unwrap_or_default().trim().is_empty()
        {
            return Err(format!(
                "condition clause on '{}' has empty comparison value",
                clause.key
            ));
        }
        if matches!(clause.operator, Operator::Lt | Operator::Gt)
            && !clause.key.starts_with("context.")
        {
            return Err(format!(
                "ordering comparison requires a context key, got '{}'",
                clause.key
            ));
        }
    }
    Ok(())
}

/// Evaluates an edge condition against a completed stage outcome and a
/// context snapshot. Never panics: malformed input comes back as `Err` and
/// callers treat the edge as non-matching.
pub fn evaluate_condition_expression(
    condition: &str,
    outcome: &StageOutcome,
    context: &ContextValues,
) -> Result<bool, String> {
    for clause in parse_clauses(condition)? {
        let actual = resolve_key(clause.key, outcome, context)?;
        let passed = match clause.operator {
            Operator::Exists => is_truthy(actual.as_ref()),
            Operator::Eq => equals(clause.key, actual.as_ref(), clause.value.unwrap_or_default()),
            Operator::Ne => !equals(clause.key, actual.as_ref(), clause.value.unwrap_or_default()),
            Operator::Lt => compare_numeric(actual.as_ref(), clause.value.unwrap_or_default())
                .is_some_and(|ordering| ordering == std::cmp::Ordering::Less),
            Operator::Gt => compare_numeric(actual.as_ref(), clause.value.unwrap_or_default())
                .is_some_and(|ordering| ordering == std::cmp::Ordering::Greater),
        };
        if !passed {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Outcome tokens referenced via `outcome=` / `outcome!=`, for lint R4.
pub fn referenced_outcome_tokens(condition: &str) -> Vec<String> {
    let Ok(clauses) = parse_clauses(condition) else {
        return Vec::new();
    };
    clauses
        .into_iter()
        .filter(|clause| clause.key == "outcome")
        .filter_map(|clause| clause.value)
        .map(|token| StageStatus::canonical(token))
        .collect()
}

fn parse_clauses(condition: &str) -> Result<Vec<Clause<'_>>, String> {
    let mut out = Vec::new();
    for raw_clause in condition.split("&&") {
        let clause = raw_clause.trim();
        if clause.is_empty() {
            continue;
        }
        if let Some((left, right)) = clause.split_once("!=") {
            out.push(Clause {
                key: left.trim(),
                operator: Operator::Ne,
                value: Some(right.trim()),
            });
            continue;
        }
        if let Some((left, right)) = clause.split_once('=') {
            out.push(Clause {
                key: left.trim(),
                operator: Operator::Eq,
                value: Some(right.trim()),
            });
            continue;
        }
        if let Some((left, right)) = clause.split_once('<') {
            out.push(Clause {
                key: left.trim(),
                operator: Operator::Lt,
                value: Some(right.trim()),
            });
            continue;
        }
        if let Some((left, right)) = clause.split_once('>') {
            out.push(Clause {
                key: left.trim(),
                operator: Operator::Gt,
                value: Some(right.trim()),
            });
            continue;
        }
        out.push(Clause {
            key: clause,
            operator: Operator::Exists,
            value: None,
        });
    }

    for clause in &out {
        if clause.key.is_empty() {
            return Err("condition clause has empty key".to_string());
        }
    }
    Ok(out)
}

fn is_condition_key(key: &str) -> bool {
    if key == "outcome" || key == "preferred_label" {
        return true;
    }
    let bare_or_context = key.strip_prefix("context.").unwrap_or(key);
    let mut chars = bare_or_context.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.')
}

fn resolve_key(
    key: &str,
    outcome: &StageOutcome,
    context: &ContextValues,
) -> Result<Option<Value>, String> {
    if key == "outcome" {
        return Ok(Some(Value::String(outcome.status.as_str().to_string())));
    }
    if key == "preferred_label" {
        return Ok(outcome.preferred_label.clone().map(Value::String));
    }
    if let Some(context_key) = key.strip_prefix("context.") {
        return Ok(context.get(context_key).cloned());
    }
    if is_condition_key(key) {
        // Bare identifier: a context key probed for truthiness.
        return Ok(context.get(key).cloned());
    }
    Err(format!("condition key '{}' is invalid", key))
}

fn equals(key: &str, actual: Option<&Value>, expected_raw: &str) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let mut actual_text = json_to_string(actual).trim().to_string();
    let mut expected_text = unquote(expected_raw.trim()).to_string();
    if key == "outcome" {
        actual_text = StageStatus::canonical(&actual_text);
        expected_text = StageStatus::canonical(&expected_text);
    }
    actual_text == expected_text
}

fn compare_numeric(actual: Option<&Value>, expected_raw: &str) -> Option<std::cmp::Ordering> {
    let actual = match actual? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let expected = unquote(expected_raw.trim()).parse::<f64>().ok()?;
    actual.partial_cmp(&expected)
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(raw)
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(inner) => inner.clone(),
        _ => value.to_string(),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(inner)) => *inner,
        Some(Value::String(inner)) => {
            !inner.is_empty() && inner != "false" && inner != "0"
        }
        Some(Value::Number(number)) => number.as_f64() != Some(0.0),
        Some(Value::Array(inner)) => !inner.is_empty(),
        Some(Value::Object(inner)) => !inner.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn outcome_with_status(token: &str) -> StageOutcome {
        StageOutcome::with_status_token(token)
    }

    #[test]
    fn evaluate_outcome_aliases_expected_canonical_matching() {
        let context = BTreeMap::new();
        assert!(
            evaluate_condition_expression("outcome=skip", &outcome_with_status("skipped"), &context)
                .expect("evaluation should succeed")
        );
        assert!(
            evaluate_condition_expression("outcome=failure", &outcome_with_status("fail"), &context)
                .expect("evaluation should succeed")
        );
        assert!(
            evaluate_condition_expression("outcome=ok", &outcome_with_status("success"), &context)
                .expect("evaluation should succeed")
        );
        assert!(
            !evaluate_condition_expression(
                "outcome!=skip",
                &outcome_with_status("skipped"),
                &context
            )
            .expect("evaluation should succeed")
        );
    }

    #[test]
    fn evaluate_empty_condition_expected_true() {
        let context = BTreeMap::new();
        assert!(
            evaluate_condition_expression("", &outcome_with_status("fail"), &context)
                .expect("evaluation should succeed")
        );
        assert!(
            evaluate_condition_expression("   ", &outcome_with_status("fail"), &context)
                .expect("evaluation should succeed")
        );
    }

    #[test]
    fn evaluate_context_equality_literal_string_after_trim() {
        let context = BTreeMap::from([
            ("mode".to_string(), json!("fast")),
            ("count".to_string(), json!(2)),
        ]);
        let outcome = outcome_with_status("success");
        assert!(
            evaluate_condition_expression("context.mode= fast ", &outcome, &context)
                .expect("evaluation should succeed")
        );
        assert!(
            evaluate_condition_expression("context.count=2", &outcome, &context)
                .expect("evaluation should succeed")
        );
        assert!(
            !evaluate_condition_expression("context.mode=slow", &outcome, &context)
                .expect("evaluation should succeed")
        );
    }

    #[test]
    fn evaluate_bare_identifier_truthiness() {
        let context = BTreeMap::from([
            ("present".to_string(), json!("yes")),
            ("empty".to_string(), json!("")),
            ("falsy".to_string(), json!("false")),
            ("zero".to_string(), json!("0")),
        ]);
        let outcome = outcome_with_status("success");
        assert!(
            evaluate_condition_expression("present", &outcome, &context)
                .expect("evaluation should succeed")
        );
        for key in ["empty", "falsy", "zero", "missing"] {
            assert!(
                !evaluate_condition_expression(key, &outcome, &context)
                    .expect("evaluation should succeed"),
                "key '{key}' should not be truthy"
            );
        }
    }

    #[test]
    fn evaluate_conjunction_all_clauses_must_hold() {
        let context = BTreeMap::from([("attempts".to_string(), json!(2))]);
        let outcome = outcome_with_status("transient_infra");
        assert!(
            evaluate_condition_expression(
                "outcome=transient_infra && context.attempts<3",
                &outcome,
                &context
            )
            .expect("evaluation should succeed")
        );
        let context = BTreeMap::from([("attempts".to_string(), json!(3))]);
        assert!(
            !evaluate_condition_expression(
                "outcome=transient_infra && context.attempts<3",
                &outcome,
                &context
            )
            .expect("evaluation should succeed")
        );
    }

    #[test]
    fn evaluate_preferred_label_expected_literal_match() {
        let mut outcome = outcome_with_status("success");
        outcome.preferred_label = Some("Approve".to_string());
        let context = BTreeMap::new();
        assert!(
            evaluate_condition_expression("preferred_label=Approve", &outcome, &context)
                .expect("evaluation should succeed")
        );
        assert!(
            !evaluate_condition_expression("preferred_label=Reject", &outcome, &context)
                .expect("evaluation should succeed")
        );
    }

    #[test]
    fn evaluate_malformed_input_expected_err_not_panic() {
        let context = BTreeMap::new();
        let outcome = outcome_with_status("success");
        let error = evaluate_condition_expression("=success", &outcome, &context)
            .expect_err("empty key should be rejected");
        assert!(error.contains("empty key"));

        let error = evaluate_condition_expression("!bad-key!=x", &outcome, &context)
            .expect_err("invalid key should be rejected");
        assert!(error.contains("invalid"));
    }

    #[test]
    fn validate_condition_rejects_empty_comparison_value() {
        let error =
            validate_condition_expression("outcome=").expect_err("validation should fail");
        assert!(error.contains("empty comparison value"));
    }

    #[test]
    fn referenced_outcome_tokens_canonicalize_aliases() {
        let tokens =
            referenced_outcome_tokens("outcome=skip && context.x=1 && outcome!=failure");
        assert_eq!(tokens, vec!["skipped".to_string(), "fail".to_string()]);
    }
}
