use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::{EngineConfig, RetryConfig};
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::graph::{Graph, GraphNode};
use weft_core::traits::TraceSink;
use weft_core::types::{InstanceId, SpanHandle, SpanStart, WorkflowEvent};

use crate::context::ExecutionContext;
use crate::handler::{HandlerRegistry, NodeExecutionResult, NodeHandler};
use crate::lifecycle::error_stack;
use crate::variables::resolve_value;

/// Per-run wiring: identity, observers, and stop conditions.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub instance_id: Option<InstanceId>,
    pub trace_id: Option<String>,
    pub trace: Option<Arc<dyn TraceSink>>,
    pub events: Option<Arc<EventBus>>,
    pub cancel: CancellationToken,
    /// Wall-clock budget for the whole run.
    pub time_budget: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, instance_id: InstanceId, trace_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id);
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    fn publish(&self, event: impl FnOnce(InstanceId) -> WorkflowEvent) {
        if let (Some(bus), Some(id)) = (&self.events, &self.instance_id) {
            bus.publish(event(id.clone()));
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The queue drained.
    Completed,
    /// A node failed with no error edge to follow.
    Failed { node: String, error: String },
    /// The cancellation token fired between node visits.
    Cancelled,
    /// The wall-clock budget ran out.
    TimedOut,
}

/// Result of executing a single node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub node_type: String,
    pub success: bool,
    pub handle: String,
    pub elapsed_ms: u64,
    /// Invocations including retries.
    pub attempts: u32,
}

/// Result of executing an entire graph.
#[derive(Debug, Clone)]
pub struct GraphRunResult {
    pub outcome: RunOutcome,
    /// The context as it stood when the run stopped.
    pub context: ExecutionContext,
    /// Node ids in visit order, notes included.
    pub visited: Vec<String>,
    /// Per-node results in execution order.
    pub records: Vec<NodeRecord>,
    /// Outputs of the end node, if one ran.
    pub end_outputs: Option<Map<String, Value>>,
    pub elapsed_ms: u64,
}

impl GraphRunResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// The run's output: the end node's outputs, else the public context.
    pub fn output_data(&self) -> Value {
        Value::Object(
            self.end_outputs
                .clone()
                .unwrap_or_else(|| self.context.snapshot()),
        )
    }
}

/// Walks a workflow graph, dispatching each reachable node to its handler.
///
/// Traversal is breadth-first from the start node(s). Every node runs at
/// most once per run, so cycles terminate. A node with several incoming
/// edges waits while any of its unvisited predecessors can still be
/// reached from the queue.
#[derive(Clone)]
pub struct GraphExecutor {
    registry: Arc<HandlerRegistry>,
    max_steps: usize,
    node_timeout: Duration,
    retry: RetryConfig,
}

impl GraphExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            registry,
            max_steps: defaults.max_steps,
            node_timeout: Duration::from_secs(defaults.node_timeout_secs),
            retry: defaults.retry,
        }
    }

    pub fn from_config(registry: Arc<HandlerRegistry>, config: &EngineConfig) -> Self {
        Self::new(registry)
            .with_limits(config.max_steps, Duration::from_secs(config.node_timeout_secs))
            .with_retry(config.retry.clone())
    }

    pub fn with_limits(mut self, max_steps: usize, node_timeout: Duration) -> Self {
        self.max_steps = max_steps;
        self.node_timeout = node_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Structural validation plus a handler lookup for every dispatchable
    /// node.
    pub fn validate(&self, graph: &Graph) -> Result<()> {
        graph.validate()?;
        for node in graph.nodes.iter().filter(|n| !n.is_note()) {
            self.registry.resolve(node)?;
        }
        Ok(())
    }

    /// Execute with default options.
    pub async fn execute(&self, graph: &Graph, ctx: ExecutionContext) -> Result<GraphRunResult> {
        self.execute_with(graph, ctx, RunOptions::default()).await
    }

    /// Execute the graph from its start node(s).
    ///
    /// Handler failures without an error edge end the run with
    /// [`RunOutcome::Failed`]. Definition errors, step-budget overruns, and
    /// raised errors with no error edge to absorb them are returned as
    /// `Err`.
    pub async fn execute_with(
        &self,
        graph: &Graph,
        mut ctx: ExecutionContext,
        opts: RunOptions,
    ) -> Result<GraphRunResult> {
        self.validate(graph)?;

        let started = Instant::now();
        let deadline = opts.time_budget.map(|b| started + b);

        let mut queue: VecDeque<String> = VecDeque::new();
        let mut queued: HashSet<String> = HashSet::new();
        for node in graph.start_nodes() {
            if queued.insert(node.id.clone()) {
                queue.push_back(node.id.clone());
            }
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut visit_order = Vec::new();
        let mut records = Vec::new();
        let mut end_outputs = None;
        let mut steps = 0usize;
        let mut deferrals = 0usize;
        let mut outcome = RunOutcome::Completed;

        while let Some(node_id) = queue.pop_front() {
            if opts.cancel.is_cancelled() {
                info!(node_id = %node_id, "Run cancelled");
                outcome = RunOutcome::Cancelled;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(node_id = %node_id, "Run time budget exhausted");
                outcome = RunOutcome::TimedOut;
                break;
            }

            // Join: wait for predecessors still reachable from the queue,
            // unless every queued node has been deferred once already
            if deferrals <= queue.len() && has_pending_predecessor(graph, &node_id, &visited, &queue) {
                debug!(node_id = %node_id, "Deferring join node");
                queue.push_back(node_id);
                deferrals += 1;
                continue;
            }
            deferrals = 0;
            queued.remove(&node_id);

            let Some(node) = graph.node(&node_id) else {
                continue;
            };
            visited.insert(node_id.clone());
            visit_order.push(node_id.clone());
            if node.is_note() {
                continue;
            }

            steps += 1;
            if steps > self.max_steps {
                error!(max_steps = self.max_steps, "Step budget exceeded");
                return Err(WeftError::StepBudgetExceeded(self.max_steps));
            }

            let handler = self.registry.resolve(node)?;
            let span = self.open_span(node, &ctx, &opts).await;
            opts.publish(|instance_id| WorkflowEvent::NodeStarted {
                instance_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });

            info!(node_id = %node.id, node_type = %node.node_type, "Executing node");
            let node_start = Instant::now();
            let (dispatched, attempts) = self
                .dispatch(node, handler.as_ref(), &mut ctx, &opts, deadline)
                .await;
            let elapsed_ms = node_start.elapsed().as_millis() as u64;

            let result = match dispatched {
                Ok(result) => result,
                Err(e) => {
                    error!(node_id = %node.id, error = %e, "Node raised an error");
                    let details = json!({"stack": error_stack(&e), "attempts": attempts});
                    self.fail_span(&opts, span.as_ref(), e.code(), &e.to_string(), Some(details))
                        .await;
                    opts.publish(|instance_id| WorkflowEvent::NodeFailed {
                        instance_id,
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        error: e.to_string(),
                    });
                    records.push(NodeRecord {
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        success: false,
                        handle: String::new(),
                        elapsed_ms,
                        attempts,
                    });

                    let timed_out = matches!(e, WeftError::NodeTimeout { .. })
                        && deadline.is_some_and(|d| Instant::now() >= d);
                    if timed_out {
                        outcome = RunOutcome::TimedOut;
                        break;
                    }
                    if e.is_definition() || !has_error_edge(graph, &node.id) {
                        return Err(e);
                    }
                    let failure = NodeExecutionResult::failure(e.to_string());
                    ctx.merge_outputs(&node.id, &failure.outputs);
                    enqueue_error_targets(graph, &node.id, &visited, &mut queued, &mut queue);
                    continue;
                }
            };

            ctx.merge_outputs(&node.id, &result.outputs);
            records.push(NodeRecord {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                success: result.success,
                handle: result.selected_handle.clone(),
                elapsed_ms,
                attempts,
            });

            if result.success {
                debug!(node_id = %node.id, handle = %result.selected_handle, elapsed_ms, "Node completed");
                self.complete_span(&opts, span.as_ref(), &result.outputs).await;
                opts.publish(|instance_id| WorkflowEvent::NodeCompleted {
                    instance_id,
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    handle: result.selected_handle.clone(),
                    success: true,
                    elapsed_ms,
                });
                if node.node_type == "end" {
                    end_outputs = Some(result.outputs.clone());
                }

                for edge in graph.outgoing(&node.id) {
                    let follow = match &edge.condition {
                        None => true,
                        Some(_) => !edge.is_error_branch() && edge.matches_handle(&result.selected_handle),
                    };
                    if follow {
                        enqueue(&edge.target, &visited, &mut queued, &mut queue);
                    }
                }
                continue;
            }

            let message = result.error_message().unwrap_or("node failed").to_string();
            warn!(node_id = %node.id, error = %message, elapsed_ms, "Node failed");
            let details = json!({"attempts": attempts});
            self.fail_span(&opts, span.as_ref(), "NODE_FAILED", &message, Some(details))
                .await;
            opts.publish(|instance_id| WorkflowEvent::NodeFailed {
                instance_id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                error: message.clone(),
            });

            if !has_error_edge(graph, &node.id) {
                outcome = RunOutcome::Failed {
                    node: node.id.clone(),
                    error: message,
                };
                break;
            }
            enqueue_error_targets(graph, &node.id, &visited, &mut queued, &mut queue);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            outcome = ?outcome,
            nodes = records.len(),
            elapsed_ms,
            "Graph execution finished"
        );

        Ok(GraphRunResult {
            outcome,
            context: ctx,
            visited: visit_order,
            records,
            end_outputs,
            elapsed_ms,
        })
    }

    /// Invoke a handler under the node timeout, re-invoking on retryable
    /// errors and failure results while the retry policy allows.
    async fn dispatch(
        &self,
        node: &GraphNode,
        handler: &dyn NodeHandler,
        ctx: &mut ExecutionContext,
        opts: &RunOptions,
        deadline: Option<Instant>,
    ) -> (Result<NodeExecutionResult>, u32) {
        let mut attempt: u32 = 0;
        loop {
            let timeout = match deadline {
                Some(d) => self.node_timeout.min(d.saturating_duration_since(Instant::now())),
                None => self.node_timeout,
            };

            let result = match tokio::time::timeout(timeout, handler.execute(node, ctx)).await {
                Ok(r) => r,
                Err(_) => Err(WeftError::NodeTimeout {
                    node: node.id.clone(),
                    timeout_secs: timeout.as_secs(),
                }),
            };

            let retryable = match &result {
                Ok(r) => !r.success,
                Err(e) => e.is_retryable(),
            };
            let out_of_time = deadline.is_some_and(|d| Instant::now() >= d);
            if !retryable || attempt >= self.retry.max_retries || out_of_time || opts.cancel.is_cancelled() {
                return (result, attempt + 1);
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                node_id = %node.id,
                attempt = attempt + 1,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying node"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = opts.cancel.cancelled() => return (result, attempt + 1),
            }
            attempt += 1;
        }
    }

    async fn open_span(
        &self,
        node: &GraphNode,
        ctx: &ExecutionContext,
        opts: &RunOptions,
    ) -> Option<SpanHandle> {
        let (sink, instance_id, trace_id) = match (&opts.trace, &opts.instance_id, &opts.trace_id) {
            (Some(s), Some(i), Some(t)) => (s, i, t),
            _ => return None,
        };
        let span = SpanStart {
            trace_id: trace_id.clone(),
            instance_id: instance_id.clone(),
            step_id: node.id.clone(),
            step_name: node.title().to_string(),
            node_type: node.node_type.clone(),
            metadata: json!({
                "type": node.node_type,
                "config": resolve_value(&node.data, ctx),
            }),
        };
        match sink.start_span(span).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "Failed to open trace span");
                None
            }
        }
    }

    async fn complete_span(
        &self,
        opts: &RunOptions,
        span: Option<&SpanHandle>,
        outputs: &Map<String, Value>,
    ) {
        if let (Some(sink), Some(handle)) = (&opts.trace, span) {
            if let Err(e) = sink
                .complete_span(handle, Value::Object(outputs.clone()))
                .await
            {
                warn!(span = %handle.0, error = %e, "Failed to complete trace span");
            }
        }
    }

    async fn fail_span(
        &self,
        opts: &RunOptions,
        span: Option<&SpanHandle>,
        code: &str,
        message: &str,
        details: Option<Value>,
    ) {
        if let (Some(sink), Some(handle)) = (&opts.trace, span) {
            if let Err(e) = sink.fail_span(handle, code, message, details).await {
                warn!(span = %handle.0, error = %e, "Failed to record trace span failure");
            }
        }
    }
}

fn enqueue(
    target: &str,
    visited: &HashSet<String>,
    queued: &mut HashSet<String>,
    queue: &mut VecDeque<String>,
) {
    if !visited.contains(target) && queued.insert(target.to_string()) {
        queue.push_back(target.to_string());
    }
}

fn has_error_edge(graph: &Graph, node_id: &str) -> bool {
    graph.outgoing(node_id).any(|e| e.is_error_branch())
}

fn enqueue_error_targets(
    graph: &Graph,
    node_id: &str,
    visited: &HashSet<String>,
    queued: &mut HashSet<String>,
    queue: &mut VecDeque<String>,
) {
    for edge in graph.outgoing(node_id).filter(|e| e.is_error_branch()) {
        enqueue(&edge.target, visited, queued, queue);
    }
}

/// Whether some unvisited predecessor of `node_id` can still be reached
/// from the other queued nodes without passing through `node_id`.
fn has_pending_predecessor(
    graph: &Graph,
    node_id: &str,
    visited: &HashSet<String>,
    queue: &VecDeque<String>,
) -> bool {
    let pending: HashSet<&str> = graph
        .incoming(node_id)
        .map(|e| e.source.as_str())
        .filter(|s| *s != node_id && !visited.contains(*s))
        .collect();
    if pending.is_empty() {
        return false;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut frontier: Vec<&str> = queue
        .iter()
        .map(|s| s.as_str())
        .filter(|s| *s != node_id)
        .collect();
    while let Some(current) = frontier.pop() {
        if !seen.insert(current) || visited.contains(current) {
            continue;
        }
        if pending.contains(current) {
            return true;
        }
        for edge in graph.outgoing(current) {
            if edge.target != node_id {
                frontier.push(edge.target.as_str());
            }
        }
    }
    false
}
