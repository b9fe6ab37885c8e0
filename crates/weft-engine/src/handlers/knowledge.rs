use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::graph::GraphNode;
use weft_core::traits::KnowledgeRetriever;
use weft_core::types::RetrievedChunk;

use crate::context::ExecutionContext;
use crate::handler::{parse_config, NodeExecutionResult, NodeHandler};
use crate::variables::{render_template, resolve_input, resolve_input_str, resolve_selector, value_to_text};

const DEFAULT_TOP_K: usize = 4;

/// Queries one or more knowledge bases and ranks the merged hits.
pub struct KnowledgeRetrievalHandler {
    retriever: Arc<dyn KnowledgeRetriever>,
}

impl KnowledgeRetrievalHandler {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self { retriever }
    }
}

#[derive(Deserialize, Default)]
struct KnowledgeConfig {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    query_variable_selector: Vec<String>,
    #[serde(default)]
    dataset_ids: Option<Value>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    multiple_retrieval_config: Option<MultipleRetrievalConfig>,
}

#[derive(Deserialize, Default)]
struct MultipleRetrievalConfig {
    #[serde(default)]
    top_k: Option<usize>,
}

/// Accepts `["a", "b"]` or `"a, b"`.
fn parse_ids(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn resolve_query(node: &GraphNode, config: &KnowledgeConfig, ctx: &ExecutionContext) -> Option<String> {
    if let Some(q) = &config.query {
        let rendered = render_template(q, ctx);
        if !rendered.trim().is_empty() {
            return Some(rendered);
        }
    }
    if !config.query_variable_selector.is_empty() {
        if let Some(v) = resolve_selector(ctx, &config.query_variable_selector) {
            let text = value_to_text(&v);
            if !text.trim().is_empty() {
                return Some(text);
            }
        }
    }
    resolve_input_str(node, ctx, "query")
}

fn chunk_to_json(chunk: &RetrievedChunk) -> Value {
    json!({
        "content": chunk.content,
        "score": chunk.score,
        "metadata": chunk.metadata,
    })
}

impl NodeHandler for KnowledgeRetrievalHandler {
    fn node_type(&self) -> &str {
        "knowledge_retrieval"
    }

    fn execute<'a>(
        &'a self,
        node: &'a GraphNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeExecutionResult>> {
        Box::pin(async move {
            let config: KnowledgeConfig = parse_config(node)?;

            let query = resolve_query(node, &config, ctx).ok_or_else(|| WeftError::MissingInput {
                node: node.id.clone(),
                input: "query".to_string(),
            })?;

            let ids = config
                .dataset_ids
                .as_ref()
                .map(parse_ids)
                .filter(|ids| !ids.is_empty())
                .or_else(|| {
                    resolve_input(node, ctx, "dataset_ids")
                        .map(|v| parse_ids(&v))
                        .filter(|ids| !ids.is_empty())
                })
                .ok_or_else(|| WeftError::MissingInput {
                    node: node.id.clone(),
                    input: "dataset_ids".to_string(),
                })?;

            let top_k = config
                .top_k
                .or_else(|| config.multiple_retrieval_config.as_ref().and_then(|m| m.top_k))
                .unwrap_or(DEFAULT_TOP_K);

            let mut hits: Vec<RetrievedChunk> = Vec::new();
            for kb_id in &ids {
                match self.retriever.search(kb_id, &query, top_k).await {
                    Ok(mut found) => {
                        debug!(node_id = %node.id, kb_id = %kb_id, hits = found.len(), "Knowledge base searched");
                        hits.append(&mut found);
                    }
                    Err(e) => {
                        warn!(node_id = %node.id, kb_id = %kb_id, error = %e, "Knowledge retrieval failed");
                        return Ok(NodeExecutionResult::failure(e.to_string()));
                    }
                }
            }

            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(top_k);

            let joined = hits
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            let mut outputs = Map::new();
            outputs.insert(
                "result".to_string(),
                Value::Array(hits.iter().map(chunk_to_json).collect()),
            );
            outputs.insert("output".to_string(), Value::String(joined));
            Ok(NodeExecutionResult::success(outputs))
        })
    }
}
