//! In-process orchestrator.
//!
//! Applies a small set of orchestration rules so runs behave as they would
//! against a real API: terminal states are sticky, admission to RUNNING can be
//! held back, and failed attempts of a running run are turned into retries
//! while the run's retry policy allows it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::error::ClientError;
use super::types::{
    FlowRun, FlowRunCreate, OrchestrationResult, RetryPolicy, TaskRun, TaskRunCreate,
};
use super::OrchestrationClient;
use crate::state::{State, StateType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestrationRules {
    /// How many RUNNING proposals per run are answered with PENDING before
    /// the run is admitted.
    pub hold_pending: u32,
}

#[derive(Default)]
struct Store {
    flow_runs: HashMap<Uuid, FlowRun>,
    policies: HashMap<Uuid, RetryPolicy>,
    held: HashMap<Uuid, u32>,
    task_runs: Vec<TaskRun>,
    proposals: Vec<(Uuid, StateType)>,
}

#[derive(Default)]
pub struct InMemoryOrchestrator {
    rules: OrchestrationRules,
    unreachable: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
    store: Mutex<Store>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: OrchestrationRules) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Make every subsequent `connect` fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Every state proposed for `id`, in order.
    pub fn proposals(&self, id: Uuid) -> Vec<StateType> {
        self.lock()
            .proposals
            .iter()
            .filter(|(run, _)| *run == id)
            .map(|(_, state_type)| *state_type)
            .collect()
    }

    pub fn proposal_count(&self) -> usize {
        self.lock().proposals.len()
    }

    pub fn flow_run(&self, id: Uuid) -> Option<FlowRun> {
        self.lock().flow_runs.get(&id).cloned()
    }

    pub fn flow_runs(&self) -> Vec<FlowRun> {
        let mut runs: Vec<_> = self.lock().flow_runs.values().cloned().collect();
        runs.sort_by_key(|run| run.created());
        runs
    }

    pub fn task_runs(&self) -> Vec<TaskRun> {
        self.lock().task_runs.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn orchestrate(&self, store: &mut Store, id: Uuid, proposed: State) -> OrchestrationResult {
        let Some(run) = store.flow_runs.get(&id) else {
            return OrchestrationResult::Abort {
                reason: format!("flow run {id} does not exist"),
            };
        };
        let current = run.state().clone();
        let run_count = run.run_count();

        if current.is_final() {
            return OrchestrationResult::Reject {
                reason: format!("run is already in terminal state {}", current.state_type()),
                state: current,
            };
        }

        match proposed.state_type() {
            StateType::Running => {
                let held = store.held.entry(id).or_insert(0);
                if *held < self.rules.hold_pending {
                    *held += 1;
                    let state = State::pending().with_message("waiting for admission");
                    self.record(store, id, state.clone(), run_count);
                    return OrchestrationResult::Reject {
                        state,
                        reason: "run is not yet admitted".to_string(),
                    };
                }
                let run_count = if current.is_running() { run_count } else { run_count + 1 };
                self.record(store, id, proposed.clone(), run_count);
                OrchestrationResult::Accept { state: proposed }
            }
            StateType::Failed => {
                let retries = store.policies.get(&id).map_or(0, |p| p.retries);
                if current.is_running() && run_count <= retries {
                    let state = State::retrying()
                        .with_message(format!("Retry {run_count}/{retries}"));
                    self.record(store, id, state.clone(), run_count + 1);
                    return OrchestrationResult::Reject {
                        state,
                        reason: format!("retrying after failed attempt {run_count}"),
                    };
                }
                self.record(store, id, proposed.clone(), run_count);
                OrchestrationResult::Accept { state: proposed }
            }
            _ => {
                self.record(store, id, proposed.clone(), run_count);
                OrchestrationResult::Accept { state: proposed }
            }
        }
    }

    fn record(&self, store: &mut Store, id: Uuid, state: State, run_count: u32) {
        if let Some(run) = store.flow_runs.get_mut(&id) {
            run.apply_state(state);
            run.set_run_count(run_count);
        }
    }
}

#[async_trait]
impl OrchestrationClient for InMemoryOrchestrator {
    async fn connect(&self) -> Result<(), ClientError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ClientError::Unreachable(
                "in-memory orchestrator is offline".to_string(),
            ));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn create_flow_run(&self, request: FlowRunCreate) -> Result<FlowRun, ClientError> {
        let id = Uuid::new_v4();
        let run = FlowRun::from_request(id, &request);
        let mut store = self.lock();
        store.policies.insert(id, request.empirical_policy);
        store.flow_runs.insert(id, run.clone());
        debug!(flow_run_id = %id, flow_name = %run.flow_name(), "stored flow run");
        Ok(run)
    }

    async fn read_flow_run(&self, id: Uuid) -> Result<FlowRun, ClientError> {
        self.flow_run(id)
            .ok_or(ClientError::NotFound { kind: "flow run", id })
    }

    async fn set_flow_run_state(
        &self,
        id: Uuid,
        state: State,
    ) -> Result<OrchestrationResult, ClientError> {
        let mut store = self.lock();
        store.proposals.push((id, state.state_type()));
        Ok(self.orchestrate(&mut store, id, state))
    }

    async fn create_task_run(&self, request: TaskRunCreate) -> Result<TaskRun, ClientError> {
        let mut store = self.lock();
        if !store.flow_runs.contains_key(&request.flow_run_id) {
            return Err(ClientError::NotFound {
                kind: "flow run",
                id: request.flow_run_id,
            });
        }
        let task_run = TaskRun::from_request(Uuid::new_v4(), request);
        store.task_runs.push(task_run.clone());
        Ok(task_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Parameters;
    use crate::state::ErrorPayload;

    fn request(retries: u32) -> FlowRunCreate {
        FlowRunCreate {
            flow_name: "foo".into(),
            flow_version: None,
            name: None,
            parameters: Parameters::new(),
            state: State::pending(),
            parent_task_run_id: None,
            tags: vec![],
            empirical_policy: RetryPolicy { retries },
        }
    }

    fn failed() -> State {
        State::failed(
            "boom",
            ErrorPayload {
                kind: "Error".into(),
                message: "xyz".into(),
                causes: vec![],
            },
        )
    }

    #[tokio::test]
    async fn accepts_running_and_counts_attempt() {
        let orch = InMemoryOrchestrator::new();
        let run = orch.create_flow_run(request(0)).await.unwrap();

        let result = orch.set_flow_run_state(run.id(), State::running()).await.unwrap();
        assert!(matches!(result, OrchestrationResult::Accept { .. }));
        assert_eq!(orch.flow_run(run.id()).unwrap().run_count(), 1);
    }

    #[tokio::test]
    async fn holds_running_proposals_in_pending() {
        let orch = InMemoryOrchestrator::with_rules(OrchestrationRules { hold_pending: 2 });
        let run = orch.create_flow_run(request(0)).await.unwrap();

        for _ in 0..2 {
            match orch.set_flow_run_state(run.id(), State::running()).await.unwrap() {
                OrchestrationResult::Reject { state, .. } => assert!(state.is_pending()),
                other => panic!("expected reject, got {other:?}"),
            }
        }
        let third = orch.set_flow_run_state(run.id(), State::running()).await.unwrap();
        assert!(matches!(third, OrchestrationResult::Accept { .. }));
    }

    #[tokio::test]
    async fn failed_attempt_is_retried_within_policy() {
        let orch = InMemoryOrchestrator::new();
        let run = orch.create_flow_run(request(1)).await.unwrap();
        orch.set_flow_run_state(run.id(), State::running()).await.unwrap();

        match orch.set_flow_run_state(run.id(), failed()).await.unwrap() {
            OrchestrationResult::Reject { state, .. } => {
                assert_eq!(state.state_type(), StateType::Retrying)
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(orch.flow_run(run.id()).unwrap().run_count(), 2);

        let second = orch.set_flow_run_state(run.id(), failed()).await.unwrap();
        assert!(matches!(second, OrchestrationResult::Accept { .. }));
        assert_eq!(
            orch.flow_run(run.id()).unwrap().state_type(),
            StateType::Failed
        );
    }

    #[tokio::test]
    async fn failure_before_running_is_not_retried() {
        let orch = InMemoryOrchestrator::new();
        let run = orch.create_flow_run(request(3)).await.unwrap();

        let result = orch.set_flow_run_state(run.id(), failed()).await.unwrap();
        assert!(matches!(result, OrchestrationResult::Accept { .. }));
        assert_eq!(orch.flow_run(run.id()).unwrap().run_count(), 0);
    }

    #[tokio::test]
    async fn terminal_state_rejects_transitions() {
        let orch = InMemoryOrchestrator::new();
        let run = orch.create_flow_run(request(0)).await.unwrap();
        orch.set_flow_run_state(run.id(), State::completed()).await.unwrap();

        match orch.set_flow_run_state(run.id(), State::running()).await.unwrap() {
            OrchestrationResult::Reject { state, .. } => assert!(state.is_completed()),
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(
            orch.proposals(run.id()),
            vec![StateType::Completed, StateType::Running]
        );
    }

    #[tokio::test]
    async fn unknown_run_is_aborted() {
        let orch = InMemoryOrchestrator::new();
        let result = orch
            .set_flow_run_state(Uuid::new_v4(), State::running())
            .await
            .unwrap();
        assert!(matches!(result, OrchestrationResult::Abort { .. }));
    }

    #[tokio::test]
    async fn unreachable_connect_fails() {
        let orch = InMemoryOrchestrator::new();
        orch.set_unreachable(true);
        assert!(orch.connect().await.unwrap_err().is_unreachable());
        assert_eq!(orch.connect_count(), 0);
    }

    #[tokio::test]
    async fn task_run_requires_parent_flow_run() {
        let orch = InMemoryOrchestrator::new();
        let err = orch
            .create_task_run(TaskRunCreate {
                flow_run_id: Uuid::new_v4(),
                name: "inner-0".into(),
                task_key: "inner".into(),
                dynamic_key: "0".into(),
                task_inputs: Default::default(),
                state: State::pending(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound { .. }));
    }
}
