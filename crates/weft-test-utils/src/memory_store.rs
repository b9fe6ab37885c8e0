use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use weft_core::error::Result;
use weft_core::traits::{InstanceStore, WorkflowStore};
use weft_core::types::{
    InstanceCompletion, InstanceId, InstanceStatus, WorkflowDefinition, WorkflowId,
    WorkflowInstance,
};

/// Workflow and instance store backed by hash maps.
#[derive(Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<WorkflowId, WorkflowDefinition>>,
    instances: Mutex<HashMap<InstanceId, WorkflowInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for MemoryStore {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        self.workflows
            .lock()
            .unwrap()
            .insert(workflow.id.clone(), workflow.clone());
        Box::pin(async { Ok(()) })
    }

    fn get_workflow(&self, id: &WorkflowId) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>> {
        let found = self.workflows.lock().unwrap().get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>> {
        let mut all: Vec<_> = self.workflows.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Box::pin(async move { Ok(all) })
    }
}

impl InstanceStore for MemoryStore {
    fn create_instance(&self, instance: &WorkflowInstance) -> BoxFuture<'_, Result<()>> {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        Box::pin(async { Ok(()) })
    }

    fn complete_instance(
        &self,
        id: &InstanceId,
        completion: InstanceCompletion,
    ) -> BoxFuture<'_, Result<bool>> {
        let changed = {
            let mut instances = self.instances.lock().unwrap();
            match instances.get_mut(id) {
                Some(inst) if inst.status == InstanceStatus::Running => {
                    inst.status = completion.status;
                    inst.output_data = completion.output_data;
                    inst.completed_at = Some(completion.completed_at);
                    inst.duration_ms = Some(completion.duration_ms);
                    inst.error_message = completion.error_message;
                    inst.error_stack = completion.error_stack;
                    true
                }
                _ => false,
            }
        };
        Box::pin(async move { Ok(changed) })
    }

    fn get_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<WorkflowInstance>>> {
        let found = self.instances.lock().unwrap().get(id).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn list_instances(
        &self,
        workflow_id: Option<&WorkflowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<WorkflowInstance>>> {
        let mut all: Vec<_> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| workflow_id.map_or(true, |w| &i.workflow_id == w))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Box::pin(async move { Ok(all) })
    }
}
