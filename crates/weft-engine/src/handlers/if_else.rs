use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::handlers::single_output;
use crate::variables::{
    has_reference, render_template, resolve_input, resolve_path, resolve_selector, resolve_value,
    single_reference, value_to_text,
};

/// Conditional branch node. Selects handle `if` or `else`, or the
/// `case_id` of the first matching case for Dify multi-case configs.
pub struct IfElseHandler;

#[derive(Deserialize, Default)]
struct IfElseConfig {
    #[serde(default)]
    condition: Option<Value>,
    #[serde(default)]
    cases: Vec<Case>,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    logical_operator: LogicalOperator,
}

#[derive(Deserialize)]
struct Case {
    case_id: String,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    logical_operator: LogicalOperator,
}

#[derive(Deserialize)]
struct Condition {
    #[serde(default)]
    variable_selector: Vec<String>,
    comparison_operator: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "lowercase")]
enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// Context key for a condition already evaluated upstream.
const CONDITION_RESULT_KEY: &str = "condition_result";

impl NodeHandler for IfElseHandler {
    fn node_type(&self) -> &str {
        "if_else"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: IfElseConfig = parse_config(node)?;

            let (handle, result) = match decide(node, &config, ctx)? {
                Decision::Bool(true) => ("if".to_string(), true),
                Decision::Bool(false) => ("else".to_string(), false),
                Decision::Case(case_id) => (case_id, true),
            };
            debug!(node_id = %node.id, handle = %handle, "Branch selected");
            Ok(NodeExecutionResult::branch(
                handle,
                single_output("result", Value::Bool(result)),
            ))
        })
    }
}

enum Decision {
    Bool(bool),
    Case(String),
}

fn decide(node: &GraphNode, config: &IfElseConfig, ctx: &ExecutionContext) -> Result<Decision> {
    if let Some(pre) = resolve_input(node, ctx, CONDITION_RESULT_KEY).and_then(|v| as_bool(&v)) {
        return Ok(Decision::Bool(pre));
    }

    if let Some(cond) = config.condition.as_ref().filter(|v| !v.is_null()) {
        return Ok(Decision::Bool(evaluate_expression(cond, ctx)));
    }

    if !config.cases.is_empty() {
        for case in &config.cases {
            if check_all(node, &case.conditions, case.logical_operator, ctx)? {
                return Ok(Decision::Case(case.case_id.clone()));
            }
        }
        return Ok(Decision::Bool(false));
    }

    if !config.conditions.is_empty() {
        return check_all(node, &config.conditions, config.logical_operator, ctx).map(Decision::Bool);
    }

    Ok(Decision::Bool(false))
}

fn check_all(
    node: &GraphNode,
    conditions: &[Condition],
    op: LogicalOperator,
    ctx: &ExecutionContext,
) -> Result<bool> {
    if conditions.is_empty() {
        return Ok(false);
    }
    for cond in conditions {
        let ok = check(node, cond, ctx)?;
        match op {
            LogicalOperator::And if !ok => return Ok(false),
            LogicalOperator::Or if ok => return Ok(true),
            _ => {}
        }
    }
    Ok(op == LogicalOperator::And)
}

fn check(node: &GraphNode, cond: &Condition, ctx: &ExecutionContext) -> Result<bool> {
    let actual = resolve_selector(ctx, &cond.variable_selector).unwrap_or(Value::Null);
    let expected = resolve_value(&cond.value, ctx);
    let actual_text = value_to_text(&actual);
    let expected_text = value_to_text(&expected);

    let ok = match cond.comparison_operator.trim() {
        "contains" => contains(&actual, &expected_text),
        "not contains" => !contains(&actual, &expected_text),
        "start with" | "starts with" => actual_text.starts_with(&expected_text),
        "end with" | "ends with" => actual_text.ends_with(&expected_text),
        "is" | "=" | "==" => loosely_equal(&actual_text, &expected_text),
        "is not" | "≠" | "!=" => !loosely_equal(&actual_text, &expected_text),
        "empty" => is_empty(&actual),
        "not empty" => !is_empty(&actual),
        "null" | "is null" => actual.is_null(),
        "not null" | "is not null" => !actual.is_null(),
        ">" => compare_numbers(&actual_text, &expected_text, |a, b| a > b),
        "<" => compare_numbers(&actual_text, &expected_text, |a, b| a < b),
        "≥" | ">=" => compare_numbers(&actual_text, &expected_text, |a, b| a >= b),
        "≤" | "<=" => compare_numbers(&actual_text, &expected_text, |a, b| a <= b),
        "in" => list_of(&expected).contains(&actual_text),
        "not in" => !list_of(&expected).contains(&actual_text),
        other => {
            return Err(WeftError::InvalidNodeConfig {
                node: node.id.clone(),
                message: format!("unsupported comparison operator: {}", other),
            })
        }
    };
    Ok(ok)
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => truthy_text(s),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn truthy_text(s: &str) -> bool {
    let t = s.trim().to_ascii_lowercase();
    !(t.is_empty() || t == "false" || t == "0" || t == "no" || t == "null")
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &str) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|v| value_to_text(v) == needle),
        other => value_to_text(other).contains(needle),
    }
}

fn list_of(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(value_to_text).collect(),
        other => value_to_text(other)
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
    }
}

fn loosely_equal(a: &str, b: &str) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn compare_numbers(a: &str, b: &str, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => cmp(x, y),
        _ => false,
    }
}

/// Evaluate a raw `condition` value.
///
/// Supported forms:
/// - boolean or numeric literals;
/// - `"true"` / `"false"`;
/// - a single `{{reference}}`, tested for truthiness;
/// - `lhs == rhs`, `lhs != rhs`, `lhs contains rhs`, where each side is a
///   quoted literal, a `{{reference}}`, or a bare context key.
pub fn evaluate_expression(value: &Value, ctx: &ExecutionContext) -> bool {
    match value {
        Value::String(s) => evaluate_str(s, ctx),
        other => truthy(other),
    }
}

fn evaluate_str(expr: &str, ctx: &ExecutionContext) -> bool {
    let expr = expr.trim();
    if let Some(b) = as_bool(&Value::String(expr.to_string())) {
        return b;
    }
    if let Some(path) = single_reference(expr) {
        return resolve_path(ctx, path).is_some_and(|v| truthy(&v));
    }

    // lhs contains rhs
    if let Some((lhs, rhs)) = parse_operator(expr, " contains ") {
        return operand(lhs, ctx).contains(&operand(rhs, ctx));
    }

    // lhs != rhs
    if let Some((lhs, rhs)) = parse_operator(expr, "!=") {
        return !loosely_equal(&operand(lhs, ctx), &operand(rhs, ctx));
    }

    // lhs == rhs
    if let Some((lhs, rhs)) = parse_operator(expr, "==") {
        return loosely_equal(&operand(lhs, ctx), &operand(rhs, ctx));
    }

    truthy_text(&render_template(expr, ctx))
}

/// Parse `lhs OP rhs` expressions. Operators inside quoted literals do
/// not count.
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let mut quote: Option<char> = None;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if (c == '"' || c == '\'') && opens_literal(&expr[..i]) => quote = Some(c),
            None if expr[i..].starts_with(op) => {
                return Some((expr[..i].trim(), expr[i + op.len()..].trim()));
            }
            None => {}
        }
    }
    None
}

/// A quote starts a literal only at the beginning of an operand.
fn opens_literal(before: &str) -> bool {
    before
        .chars()
        .next_back()
        .map_or(true, |p| p.is_whitespace() || p == '=')
}

fn operand(text: &str, ctx: &ExecutionContext) -> String {
    let t = text.trim();
    for quote in ['"', '\''] {
        if t.len() >= 2 && t.starts_with(quote) && t.ends_with(quote) {
            return t[1..t.len() - 1].to_string();
        }
    }
    if has_reference(t) {
        return render_template(t, ctx);
    }
    match resolve_path(ctx, t) {
        Some(v) => value_to_text(&v),
        None => t.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(node: GraphNode, ctx: &mut ExecutionContext) -> NodeExecutionResult {
        IfElseHandler.execute(&node, ctx).await.unwrap()
    }

    fn if_else(condition: Value) -> GraphNode {
        GraphNode::new("decide", "if_else").with_field("condition", condition)
    }

    #[tokio::test]
    async fn test_literal_conditions() {
        let mut ctx = ExecutionContext::new();
        let r = run(if_else(json!(true)), &mut ctx).await;
        assert_eq!(r.selected_handle, "if");
        assert_eq!(r.outputs["result"], json!(true));

        let r = run(if_else(json!("false")), &mut ctx).await;
        assert_eq!(r.selected_handle, "else");
        assert_eq!(r.outputs["result"], json!(false));
    }

    #[tokio::test]
    async fn test_missing_condition_is_else() {
        let mut ctx = ExecutionContext::new();
        let r = run(GraphNode::new("decide", "if_else"), &mut ctx).await;
        assert_eq!(r.selected_handle, "else");
    }

    #[tokio::test]
    async fn test_context_condition_result_wins() {
        let mut ctx = ExecutionContext::new();
        ctx.set(CONDITION_RESULT_KEY, json!(true));
        let r = run(if_else(json!(false)), &mut ctx).await;
        assert_eq!(r.selected_handle, "if");
    }

    #[tokio::test]
    async fn test_expressions() {
        let mut ctx = ExecutionContext::from_inputs(&json!({"status": "ok", "score": 3}));
        ctx.merge_outputs("llm", json!({"text": "the answer is yes"}).as_object().unwrap());

        assert_eq!(run(if_else(json!("status == \"ok\"")), &mut ctx).await.selected_handle, "if");
        assert_eq!(run(if_else(json!("status != 'ok'")), &mut ctx).await.selected_handle, "else");
        assert_eq!(
            run(if_else(json!("{{llm.text}} contains \"yes\"")), &mut ctx).await.selected_handle,
            "if"
        );
        assert_eq!(run(if_else(json!("score == 3.0")), &mut ctx).await.selected_handle, "if");
        assert_eq!(run(if_else(json!("{{ missing }}")), &mut ctx).await.selected_handle, "else");
        assert_eq!(run(if_else(json!("{{ score }}")), &mut ctx).await.selected_handle, "if");
    }

    #[tokio::test]
    async fn test_operators_inside_quotes_are_literal() {
        let mut ctx = ExecutionContext::new();
        ctx.set("status", json!("a!=b"));
        ctx.set("name", json!("O'Brien"));

        assert!(evaluate_expression(&json!("status == 'a!=b'"), &ctx));
        assert!(!evaluate_expression(&json!("status != 'a!=b'"), &ctx));
        assert!(evaluate_expression(&json!("\"x == y\" == \"x == y\""), &ctx));
        assert!(evaluate_expression(&json!("'say contains this' contains ' contains '"), &ctx));
        assert!(evaluate_expression(&json!("name == \"O'Brien\""), &ctx));

        let r = run(if_else(json!("status == 'a!=b'")), &mut ctx).await;
        assert_eq!(r.selected_handle, "if");
    }

    #[tokio::test]
    async fn test_dify_conditions() {
        let mut ctx = ExecutionContext::new();
        ctx.merge_outputs("start", json!({"age": 20, "name": "Ada"}).as_object().unwrap());
        let node = GraphNode::new("decide", "if_else").with_data(json!({
            "logical_operator": "and",
            "conditions": [
                {"variable_selector": ["start", "age"], "comparison_operator": "≥", "value": "18"},
                {"variable_selector": ["start", "name"], "comparison_operator": "start with", "value": "A"}
            ]
        }));
        assert_eq!(run(node, &mut ctx).await.selected_handle, "if");

        let node = GraphNode::new("decide", "if_else").with_data(json!({
            "logical_operator": "or",
            "conditions": [
                {"variable_selector": ["start", "age"], "comparison_operator": "<", "value": 10},
                {"variable_selector": ["start", "name"], "comparison_operator": "empty"}
            ]
        }));
        assert_eq!(run(node, &mut ctx).await.selected_handle, "else");
    }

    #[tokio::test]
    async fn test_dify_cases_select_case_id() {
        let mut ctx = ExecutionContext::new();
        ctx.merge_outputs("start", json!({"tier": "gold"}).as_object().unwrap());
        let node = GraphNode::new("decide", "if_else").with_data(json!({
            "cases": [
                {"case_id": "true", "conditions": [
                    {"variable_selector": ["start", "tier"], "comparison_operator": "is", "value": "silver"}
                ]},
                {"case_id": "case_gold", "conditions": [
                    {"variable_selector": ["start", "tier"], "comparison_operator": "in", "value": ["gold", "platinum"]}
                ]}
            ]
        }));
        let r = run(node, &mut ctx).await;
        assert_eq!(r.selected_handle, "case_gold");
        assert_eq!(r.outputs["result"], json!(true));
    }

    #[tokio::test]
    async fn test_unknown_operator_is_config_error() {
        let mut ctx = ExecutionContext::new();
        let node = GraphNode::new("decide", "if_else").with_data(json!({
            "conditions": [{"variable_selector": ["x"], "comparison_operator": "resembles", "value": 1}]
        }));
        let err = IfElseHandler.execute(&node, &mut ctx).await.unwrap_err();
        assert!(matches!(err, WeftError::InvalidNodeConfig { .. }));
    }
}
