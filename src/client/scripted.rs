//! Test client that answers state proposals from a script.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    ClientError, FlowRun, FlowRunCreate, InMemoryOrchestrator, OrchestrationClient,
    OrchestrationResult, TaskRun, TaskRunCreate,
};
use crate::state::State;

/// Answers proposals from a script, then accepts everything through an
/// in-memory orchestrator.
pub(crate) struct ScriptedClient {
    inner: InMemoryOrchestrator,
    script: Mutex<VecDeque<OrchestrationResult>>,
}

impl ScriptedClient {
    pub(crate) fn new(script: Vec<OrchestrationResult>) -> Self {
        Self {
            inner: InMemoryOrchestrator::new(),
            script: Mutex::new(script.into()),
        }
    }

    pub(crate) fn orchestrator(&self) -> &InMemoryOrchestrator {
        &self.inner
    }
}

#[async_trait]
impl OrchestrationClient for ScriptedClient {
    async fn connect(&self) -> Result<(), ClientError> {
        self.inner.connect().await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    async fn create_flow_run(&self, request: FlowRunCreate) -> Result<FlowRun, ClientError> {
        self.inner.create_flow_run(request).await
    }

    async fn read_flow_run(&self, id: Uuid) -> Result<FlowRun, ClientError> {
        self.inner.read_flow_run(id).await
    }

    async fn set_flow_run_state(
        &self,
        id: Uuid,
        state: State,
    ) -> Result<OrchestrationResult, ClientError> {
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => Ok(result),
            None => self.inner.set_flow_run_state(id, state).await,
        }
    }

    async fn create_task_run(&self, request: TaskRunCreate) -> Result<TaskRun, ClientError> {
        self.inner.create_task_run(request).await
    }
}
