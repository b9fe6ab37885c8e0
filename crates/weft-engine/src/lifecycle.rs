use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{InstanceStore, TraceSink, WorkflowStore};
use weft_core::types::{
    InstanceCompletion, InstanceId, InstanceStatus, WorkflowDefinition, WorkflowEvent, WorkflowId,
    WorkflowInstance,
};

use crate::context::{ExecutionContext, INSTANCE_ID_KEY, TRACE_ID_KEY, WORKFLOW_ID_KEY};
use crate::dsl;
use crate::executor::{GraphExecutor, GraphRunResult, RunOptions, RunOutcome};
use crate::handler::HandlerRegistry;

/// Trigger source recorded when the caller names none.
pub const MANUAL_TRIGGER: &str = "manual";

/// Owns workflow definitions and instance records, and drives each
/// instance from RUNNING to exactly one terminal status.
pub struct WorkflowEngine {
    workflows: Arc<dyn WorkflowStore>,
    instances: Arc<dyn InstanceStore>,
    trace: Option<Arc<dyn TraceSink>>,
    events: Arc<EventBus>,
    executor: GraphExecutor,
    config: EngineConfig,
    running: Mutex<HashMap<InstanceId, CancellationToken>>,
}

impl WorkflowEngine {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        instances: Arc<dyn InstanceStore>,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        let executor = GraphExecutor::from_config(Arc::new(registry), &config);
        Self {
            workflows,
            instances,
            trace: None,
            events: Arc::new(EventBus::new(config.event_capacity)),
            executor,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(sink);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    fn running(&self) -> MutexGuard<'_, HashMap<InstanceId, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Workflow definitions ────────────────────────────────────

    /// Normalize a workflow document and store it as a new definition.
    pub async fn import(
        &self,
        document: &Value,
        name: impl Into<String>,
        created_by: Option<String>,
    ) -> Result<WorkflowDefinition> {
        let graph = dsl::normalize(document)?;
        let mut workflow = WorkflowDefinition::new(name, graph);
        workflow.created_by = created_by;
        self.save_workflow(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            nodes = workflow.graph.nodes.len(),
            "Workflow imported"
        );
        Ok(workflow)
    }

    /// Store a definition after structural validation. Handler coverage
    /// is checked when an instance runs.
    pub async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        workflow.graph.validate()?;
        self.workflows.save_workflow(workflow).await
    }

    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<WorkflowDefinition> {
        self.workflows
            .get_workflow(id)
            .await?
            .ok_or_else(|| WeftError::WorkflowNotFound(id.to_string()))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.workflows.list_workflows().await
    }

    // ── Instances ───────────────────────────────────────────────

    /// Create a RUNNING instance record without executing it.
    pub async fn create_instance(
        &self,
        workflow_id: &WorkflowId,
        inputs: Value,
        triggered_by: Option<String>,
        trigger_source: Option<String>,
    ) -> Result<WorkflowInstance> {
        self.get_workflow(workflow_id).await?;
        let instance = WorkflowInstance::start(
            workflow_id.clone(),
            inputs,
            triggered_by,
            trigger_source.unwrap_or_else(|| MANUAL_TRIGGER.to_string()),
        );
        self.instances.create_instance(&instance).await?;
        debug!(instance_id = %instance.id, workflow_id = %workflow_id, "Instance created");
        Ok(instance)
    }

    /// Create an instance and run it to completion on the current task.
    pub async fn trigger(
        &self,
        workflow_id: &WorkflowId,
        inputs: Value,
        triggered_by: Option<String>,
        trigger_source: Option<String>,
    ) -> Result<InstanceId> {
        let instance = self
            .create_instance(workflow_id, inputs, triggered_by, trigger_source)
            .await?;
        self.execute_instance(&instance.id).await?;
        Ok(instance.id)
    }

    /// Create an instance and run it on a background task. The instance is
    /// retrievable and cancellable as soon as this returns.
    pub async fn spawn(
        self: &Arc<Self>,
        workflow_id: &WorkflowId,
        inputs: Value,
        triggered_by: Option<String>,
        trigger_source: Option<String>,
    ) -> Result<InstanceId> {
        let instance = self
            .create_instance(workflow_id, inputs, triggered_by, trigger_source)
            .await?;
        self.running()
            .insert(instance.id.clone(), CancellationToken::new());

        let engine = Arc::clone(self);
        let id = instance.id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.execute_instance(&id).await {
                error!(instance_id = %id, error = %e, "Background instance failed to finish");
            }
        });
        Ok(instance.id)
    }

    /// Run a RUNNING instance and record its terminal status.
    ///
    /// Every error or panic from the executor is caught and recorded on the
    /// instance, so an `Err` here means the store itself failed.
    pub async fn execute_instance(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        let instance = self
            .instances
            .get_instance(id)
            .await?
            .ok_or_else(|| WeftError::InstanceNotFound(id.to_string()))?;
        if instance.status.is_terminal() {
            debug!(instance_id = %id, status = %instance.status, "Instance already finished");
            // A spawned run that was finished elsewhere before it started
            if self.running().remove(id).is_some() {
                self.publish_terminal(id, &recorded_completion(&instance));
            }
            return Ok(instance);
        }

        let cancel = self
            .running()
            .entry(id.clone())
            .or_insert_with(CancellationToken::new)
            .clone();

        let completion = self.run(&instance, cancel).await;
        let applied = self.instances.complete_instance(id, completion.clone()).await;
        self.running().remove(id);

        // Every exit publishes a terminal event
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                error!(instance_id = %id, error = %e, "Failed to record instance completion");
                self.publish_terminal(id, &completion);
                return Err(e);
            }
        };

        let stored = self
            .instances
            .get_instance(id)
            .await?
            .ok_or_else(|| WeftError::InstanceNotFound(id.to_string()))?;

        if applied {
            self.publish_terminal(id, &completion);
            info!(
                instance_id = %id,
                status = %completion.status,
                duration_ms = completion.duration_ms,
                "Instance finished"
            );
        } else {
            debug!(instance_id = %id, status = %stored.status, "Instance reached a terminal status elsewhere");
            self.publish_terminal(id, &recorded_completion(&stored));
        }
        Ok(stored)
    }

    async fn run(&self, instance: &WorkflowInstance, cancel: CancellationToken) -> InstanceCompletion {
        let started_at = instance.started_at;
        let workflow = match self.workflows.get_workflow(&instance.workflow_id).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                let e = WeftError::WorkflowNotFound(instance.workflow_id.to_string());
                return failed_completion(started_at, None, &e);
            }
            Err(e) => return failed_completion(started_at, None, &e),
        };

        self.events.publish(WorkflowEvent::WorkflowStarted {
            instance_id: instance.id.clone(),
            workflow_id: workflow.id.clone(),
            trace_id: instance.trace_id.clone(),
        });

        let mut ctx = ExecutionContext::from_inputs(&instance.input_data);
        ctx.set_str(TRACE_ID_KEY, instance.trace_id.clone());
        ctx.set_str(INSTANCE_ID_KEY, instance.id.to_string());
        ctx.set_str(WORKFLOW_ID_KEY, workflow.id.to_string());

        let budget_secs = workflow
            .timeout_secs
            .unwrap_or(self.config.instance_timeout_secs);
        let retry = workflow
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let executor = self.executor.clone().with_retry(retry);

        let mut opts = RunOptions::new()
            .with_instance(instance.id.clone(), instance.trace_id.clone())
            .with_events(self.events.clone())
            .with_cancel(cancel)
            .with_time_budget(Duration::from_secs(budget_secs));
        if let Some(sink) = &self.trace {
            opts = opts.with_trace_sink(sink.clone());
        }

        info!(
            instance_id = %instance.id,
            workflow_id = %workflow.id,
            trace_id = %instance.trace_id,
            "Executing instance"
        );

        // Run on its own task so a panicking handler surfaces as a JoinError
        let graph = workflow.graph;
        let joined = tokio::spawn(async move { executor.execute_with(&graph, ctx, opts).await }).await;

        match joined {
            Ok(Ok(run)) => completion_for(started_at, run, budget_secs),
            Ok(Err(e)) => {
                error!(instance_id = %instance.id, error = %e, "Instance execution failed");
                failed_completion(started_at, None, &e)
            }
            Err(join_error) => {
                let message = panic_message(join_error);
                error!(instance_id = %instance.id, error = %message, "Instance execution panicked");
                InstanceCompletion::finish(started_at, InstanceStatus::Failed, None)
                    .with_error(message.clone(), Some(format!("PANIC: {}", message)))
            }
        }
    }

    /// Cancel an instance. A run on this engine is signalled and stops
    /// before its next node; a RUNNING record with no live run here is
    /// marked CANCELLED directly. Returns whether anything changed.
    pub async fn cancel(&self, id: &InstanceId) -> Result<bool> {
        let token = self.running().get(id).cloned();
        if let Some(token) = token {
            info!(instance_id = %id, "Cancelling running instance");
            token.cancel();
            return Ok(true);
        }

        let instance = self
            .instances
            .get_instance(id)
            .await?
            .ok_or_else(|| WeftError::InstanceNotFound(id.to_string()))?;
        if instance.status.is_terminal() {
            return Ok(false);
        }

        let completion = InstanceCompletion::finish(
            instance.started_at,
            InstanceStatus::Cancelled,
            None,
        )
        .with_error(WeftError::Cancelled.to_string(), None);
        let changed = self.instances.complete_instance(id, completion.clone()).await?;
        if changed {
            warn!(instance_id = %id, "Marked orphaned instance CANCELLED");
            self.publish_terminal(id, &completion);
        }
        Ok(changed)
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Result<WorkflowInstance> {
        self.instances
            .get_instance(id)
            .await?
            .ok_or_else(|| WeftError::InstanceNotFound(id.to_string()))
    }

    pub async fn list_instances(
        &self,
        workflow_id: Option<&WorkflowId>,
        limit: usize,
    ) -> Result<Vec<WorkflowInstance>> {
        self.instances.list_instances(workflow_id, limit).await
    }

    fn publish_terminal(&self, id: &InstanceId, completion: &InstanceCompletion) {
        let event = match (&completion.status, &completion.error_message) {
            (InstanceStatus::Success, _) | (_, None) => WorkflowEvent::WorkflowCompleted {
                instance_id: id.clone(),
                status: completion.status,
                duration_ms: completion.duration_ms,
            },
            (status, Some(error)) => WorkflowEvent::WorkflowFailed {
                instance_id: id.clone(),
                status: *status,
                error: error.clone(),
            },
        };
        self.events.publish(event);
    }
}

fn completion_for(
    started_at: chrono::DateTime<chrono::Utc>,
    run: GraphRunResult,
    budget_secs: u64,
) -> InstanceCompletion {
    let partial = Some(run.output_data());
    match run.outcome {
        RunOutcome::Completed => InstanceCompletion::finish(started_at, InstanceStatus::Success, partial),
        RunOutcome::Failed { node, error } => {
            InstanceCompletion::finish(started_at, InstanceStatus::Failed, partial).with_error(
                format!("Node {} failed: {}", node, error),
                Some(format!("NODE_FAILED: {}: {}", node, error)),
            )
        }
        RunOutcome::Cancelled => InstanceCompletion::finish(started_at, InstanceStatus::Cancelled, partial)
            .with_error(WeftError::Cancelled.to_string(), None),
        RunOutcome::TimedOut => InstanceCompletion::finish(started_at, InstanceStatus::Timeout, partial)
            .with_error(WeftError::InstanceTimeout(budget_secs).to_string(), None),
    }
}

/// The completion already recorded on a terminal instance.
fn recorded_completion(instance: &WorkflowInstance) -> InstanceCompletion {
    let completed_at = instance.completed_at.unwrap_or_else(chrono::Utc::now);
    InstanceCompletion {
        status: instance.status,
        output_data: instance.output_data.clone(),
        completed_at,
        duration_ms: instance
            .duration_ms
            .unwrap_or_else(|| (completed_at - instance.started_at).num_milliseconds()),
        error_message: instance.error_message.clone(),
        error_stack: instance.error_stack.clone(),
    }
}

fn failed_completion(
    started_at: chrono::DateTime<chrono::Utc>,
    output: Option<Value>,
    e: &WeftError,
) -> InstanceCompletion {
    InstanceCompletion::finish(started_at, InstanceStatus::Failed, output)
        .with_error(e.to_string(), Some(error_stack(e)))
}

/// The error's code and message followed by its source chain.
pub fn error_stack(e: &WeftError) -> String {
    let mut lines = vec![format!("{}: {}", e.code(), e)];
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}

fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return format!("execution task aborted: {}", join_error);
    }
    let payload = join_error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
