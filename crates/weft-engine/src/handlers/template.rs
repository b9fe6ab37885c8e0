use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::graph::GraphNode;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::handlers::single_output;
use crate::variables::{render_template_with, resolve_bindings, resolve_path, VariableBinding};

/// Renders `template` into output `output`. Names bound by `variables`
/// shadow context keys of the same name.
pub struct TemplateTransformHandler;

#[derive(Deserialize, Default)]
struct TemplateConfig {
    #[serde(default)]
    template: String,
    #[serde(default)]
    variables: Vec<VariableBinding>,
}

impl NodeHandler for TemplateTransformHandler {
    fn node_type(&self) -> &str {
        "template_transform"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: TemplateConfig = parse_config(node)?;
            let bound = resolve_bindings(&config.variables, ctx);
            let ctx: &ExecutionContext = ctx;

            let rendered = render_template_with(&config.template, &|path| {
                let mut parts = path.splitn(2, '.');
                let head = parts.next().unwrap_or_default();
                match (bound.get(head), parts.next()) {
                    (Some(v), None) => Some(v.clone()),
                    (Some(v), Some(rest)) => rest
                        .split('.')
                        .try_fold(v, |cur, seg| match cur {
                            Value::Object(m) => m.get(seg),
                            Value::Array(a) => seg.parse::<usize>().ok().and_then(|i| a.get(i)),
                            _ => None,
                        })
                        .cloned(),
                    (None, _) => resolve_path(ctx, path),
                }
            });

            Ok(NodeExecutionResult::success(single_output(
                "output",
                Value::String(rendered),
            )))
        })
    }
}
