use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::variables::resolve_value;

/// Writes a value to a named context variable.
pub struct VariableAssignerHandler;

#[derive(Deserialize, Default, Clone, Copy, PartialEq, Debug)]
#[serde(rename_all = "snake_case")]
enum WriteMode {
    #[default]
    #[serde(alias = "over-write")]
    Overwrite,
    Append,
    Clear,
}

#[derive(Deserialize)]
struct AssignerConfig {
    target_variable: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    write_mode: WriteMode,
}

/// Append semantics: arrays grow, strings concatenate, anything else
/// becomes a two-element array.
fn append(current: Option<&Value>, value: Value) -> Value {
    match current {
        None | Some(Value::Null) => match value {
            Value::Array(_) => value,
            other => Value::Array(vec![other]),
        },
        Some(Value::Array(items)) => {
            let mut items = items.clone();
            match value {
                Value::Array(more) => items.extend(more),
                other => items.push(other),
            }
            Value::Array(items)
        }
        Some(Value::String(s)) => {
            Value::String(format!("{}{}", s, crate::variables::value_to_text(&value)))
        }
        Some(other) => Value::Array(vec![other.clone(), value]),
    }
}

impl NodeHandler for VariableAssignerHandler {
    fn node_type(&self) -> &str {
        "variable_assigner"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: AssignerConfig = parse_config(node)?;
            let target = config.target_variable.trim().to_string();
            if target.is_empty() {
                return Err(WeftError::InvalidNodeConfig {
                    node: node.id.clone(),
                    message: "`target_variable` is empty".to_string(),
                });
            }

            let resolved = resolve_value(&config.value, ctx);
            let new_value = match config.write_mode {
                WriteMode::Overwrite => resolved,
                WriteMode::Append => append(ctx.get(&target), resolved),
                WriteMode::Clear => Value::Null,
            };

            let mut outputs = Map::new();
            outputs.insert("assigned_variable".to_string(), Value::String(target.clone()));
            outputs.insert("value".to_string(), new_value.clone());
            outputs.insert(target, new_value);
            Ok(NodeExecutionResult::success(outputs))
        })
    }
}
