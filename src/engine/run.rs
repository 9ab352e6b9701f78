use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{
    FlowRun, FlowRunCreate, OrchestrationClient, OrchestrationResult, RetryPolicy, TaskRunCreate,
};
use crate::context::{ExecutionMode, FlowRunContext};
use crate::error::EngineError;
use crate::flow::{Flow, Parameters};
use crate::results::ResultFactory;
use crate::state::{State, StateData};
use crate::task_group::TaskGroup;

const DEFAULT_FAILURE_MESSAGE: &str = "Flow run encountered an exception:";
const VALIDATION_FAILURE_MESSAGE: &str = "Validation of flow parameters failed with error";

/// Whether proposals still reach the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMode {
    Active,
    /// The run reached a final state before it ever ran. Every further
    /// transition returns this state unchanged.
    ShortCircuited(State),
}

/// Drives one flow run through its states against an orchestrator.
pub struct FlowRunEngine {
    flow: Flow,
    parameters: Parameters,
    flow_run: Option<FlowRun>,
    client: Arc<dyn OrchestrationClient>,
    parent: Option<Arc<FlowRunContext>>,
    execution_mode: ExecutionMode,
    task_group: Option<TaskGroup>,
    mode: EngineMode,
    connected: bool,
    state_tx: Option<watch::Sender<State>>,
    context: Option<Arc<FlowRunContext>>,
}

impl FlowRunEngine {
    pub fn new(flow: Flow, client: Arc<dyn OrchestrationClient>) -> Self {
        Self {
            flow,
            parameters: Parameters::new(),
            flow_run: None,
            client,
            parent: None,
            execution_mode: ExecutionMode::default(),
            task_group: None,
            mode: EngineMode::Active,
            connected: false,
            state_tx: None,
            context: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Attach to an existing run record instead of creating one.
    pub fn with_flow_run(mut self, flow_run: Option<FlowRun>) -> Self {
        self.flow_run = flow_run;
        self
    }

    /// Context of the enclosing run; the new run is created as its child.
    pub fn with_parent(mut self, parent: Option<Arc<FlowRunContext>>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Use `group` for background work instead of building one in `start`.
    pub fn with_task_group(mut self, group: TaskGroup) -> Self {
        self.task_group = Some(group);
        self
    }

    pub fn client(&self) -> Result<&Arc<dyn OrchestrationClient>, EngineError> {
        if self.connected {
            Ok(&self.client)
        } else {
            Err(EngineError::NotStarted)
        }
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn flow_run(&self) -> Option<&FlowRun> {
        self.flow_run.as_ref()
    }

    pub fn state(&self) -> Option<&State> {
        self.flow_run.as_ref().map(FlowRun::state)
    }

    pub fn mode(&self) -> &EngineMode {
        &self.mode
    }

    pub fn is_short_circuited(&self) -> bool {
        matches!(self.mode, EngineMode::ShortCircuited(_))
    }

    pub fn context(&self) -> Option<&Arc<FlowRunContext>> {
        self.context.as_ref()
    }

    /// False once short-circuited, whatever state the orchestrator recorded.
    pub fn is_pending(&self) -> bool {
        !self.is_short_circuited() && self.state().is_some_and(State::is_pending)
    }

    /// True while the run is RUNNING or has been granted a retry. A
    /// short-circuited run never runs.
    pub fn is_running(&self) -> bool {
        !self.is_short_circuited() && self.state().is_some_and(State::is_running)
    }

    /// Resolve the payload of the current state.
    pub fn result(&self, raise_on_failure: bool) -> Result<Option<StateData>, EngineError> {
        let state = self.state().ok_or(EngineError::MissingFlowRun)?;
        Ok(state.result(raise_on_failure)?)
    }

    /// Connect, create or attach the run record, validate parameters and build the
    /// run's context.
    ///
    /// Calling `start` on a started engine does nothing.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.connected {
            return Ok(());
        }
        self.client.connect().await.map_err(EngineError::Connection)?;
        self.connected = true;

        if let Err(err) = self.setup().await {
            self.client.close().await;
            self.connected = false;
            return Err(err);
        }
        Ok(())
    }

    async fn setup(&mut self) -> Result<(), EngineError> {
        if self.flow_run.is_none() {
            let flow_run = self.create_flow_run().await?;
            self.flow_run = Some(flow_run);
        }
        let flow_run = self.flow_run.as_ref().ok_or(EngineError::MissingFlowRun)?;
        let (state_tx, state_rx) = watch::channel(flow_run.state().clone());
        self.state_tx = Some(state_tx);

        if self.flow.should_validate_parameters() {
            match self.flow.validate_parameters(&self.parameters) {
                Ok(validated) => self.parameters = validated,
                Err(err) => {
                    let err = anyhow::Error::new(err);
                    let factory = ResultFactory::from_flow(&self.flow);
                    let state = self
                        .handle_exception(&err, Some(VALIDATION_FAILURE_MESSAGE), Some(&factory))
                        .await?;
                    info!(state_type = %state.state_type(), "parameter validation failed, run is short-circuited");
                    self.mode = EngineMode::ShortCircuited(state);
                }
            }
        }

        let task_group = match self.task_group.take() {
            Some(group) => group,
            None => TaskGroup::new()?,
        };
        let flow_run = self.flow_run.as_ref().ok_or(EngineError::MissingFlowRun)?;
        let context = FlowRunContext::new(
            self.flow.clone(),
            flow_run,
            state_rx,
            Arc::clone(&self.client),
            task_group,
        )
        .with_parameters(self.parameters.clone())
        .with_mode(self.execution_mode)
        .with_parent(self.parent.clone());
        self.context = Some(Arc::new(context));
        Ok(())
    }

    async fn create_flow_run(&self) -> Result<FlowRun, EngineError> {
        let parent_task_run_id = match &self.parent {
            Some(parent) => {
                let dynamic_key = parent.next_dynamic_key(&self.flow.task_key());
                let task_inputs: BTreeMap<String, Vec<_>> = self
                    .parameters
                    .keys()
                    .map(|name| (name.clone(), Vec::new()))
                    .collect();
                let task_run = self
                    .client
                    .create_task_run(TaskRunCreate {
                        flow_run_id: parent.flow_run_id(),
                        name: format!("{}-{dynamic_key}", self.flow.name()),
                        task_key: self.flow.task_key(),
                        dynamic_key,
                        task_inputs,
                        state: State::pending(),
                    })
                    .await?;
                debug!(task_run_id = %task_run.id, parent_flow_run_id = %parent.flow_run_id(), "registered child task run");
                Some(task_run.id)
            }
            None => None,
        };

        let name = match self.flow.resolve_run_name(&self.parameters) {
            Ok(name) => name,
            Err(err) => {
                warn!(flow_name = %self.flow.name(), error = %err, "could not resolve custom run name");
                None
            }
        };

        let flow_run = self
            .client
            .create_flow_run(FlowRunCreate {
                flow_name: self.flow.name().to_string(),
                flow_version: self.flow.version().map(str::to_string),
                name,
                parameters: self.parameters.clone(),
                state: State::pending(),
                parent_task_run_id,
                tags: self.flow.tags().to_vec(),
                empirical_policy: RetryPolicy {
                    retries: self.flow.retries(),
                },
            })
            .await?;
        info!(
            flow_run_id = %flow_run.id(),
            flow_name = %flow_run.flow_name(),
            flow_run_name = flow_run.name().unwrap_or_default(),
            "created flow run"
        );
        Ok(flow_run)
    }

    /// Propose RUNNING.
    pub async fn begin_run(&mut self) -> Result<State, EngineError> {
        self.set_state(State::running()).await
    }

    /// Propose `state` and apply whatever the orchestrator records.
    ///
    /// Returns the accepted state, which may differ from the proposal. While
    /// short-circuited no proposal is made.
    pub async fn set_state(&mut self, state: State) -> Result<State, EngineError> {
        if let EngineMode::ShortCircuited(state) = &self.mode {
            return Ok(state.clone());
        }
        let client = Arc::clone(self.client()?);
        let id = self
            .flow_run
            .as_ref()
            .map(FlowRun::id)
            .ok_or(EngineError::MissingFlowRun)?;

        loop {
            debug!(flow_run_id = %id, state_type = %state.state_type(), "proposing state");
            match client.set_flow_run_state(id, state.clone()).await? {
                OrchestrationResult::Accept { state } => {
                    return Ok(self.apply(state));
                }
                OrchestrationResult::Reject { state: recorded, reason } => {
                    info!(
                        flow_run_id = %id,
                        proposed = %state.state_type(),
                        state_type = %recorded.state_type(),
                        %reason,
                        "orchestrator recorded a different state"
                    );
                    return Ok(self.apply(recorded));
                }
                OrchestrationResult::Wait {
                    delay_seconds,
                    reason,
                } => {
                    debug!(flow_run_id = %id, delay_seconds, %reason, "orchestrator asked to wait");
                    let delay = Duration::try_from_secs_f64(delay_seconds).unwrap_or(Duration::ZERO);
                    tokio::time::sleep(delay).await;
                }
                OrchestrationResult::Abort { reason } => {
                    warn!(flow_run_id = %id, %reason, "orchestrator aborted the run");
                    return Err(EngineError::Aborted(reason));
                }
            }
        }
    }

    fn apply(&mut self, state: State) -> State {
        if let Some(flow_run) = self.flow_run.as_mut() {
            flow_run.apply_state(state.clone());
        }
        if let Some(tx) = &self.state_tx {
            tx.send_replace(state.clone());
        }
        state
    }

    /// Propose COMPLETED carrying `result` and hand the result back.
    pub async fn handle_success(&mut self, result: Value) -> Result<Value, EngineError> {
        let factory = self.result_factory();
        let state = State::completed().with_data(factory.create_result(result.clone()));
        self.set_state(state).await?;
        Ok(result)
    }

    /// Turn `err` into a FAILED proposal and return the accepted state.
    pub async fn handle_exception(
        &mut self,
        err: &anyhow::Error,
        message: Option<&str>,
        result_factory: Option<&ResultFactory>,
    ) -> Result<State, EngineError> {
        let factory = result_factory.copied().unwrap_or_else(|| self.result_factory());
        let state = factory.failed_state(err, message.unwrap_or(DEFAULT_FAILURE_MESSAGE));
        let accepted = self.set_state(state).await?;
        if accepted.is_running() {
            info!(state = %accepted, "flow run will be retried");
        } else {
            warn!(state = %accepted, "flow run failed");
        }
        Ok(accepted)
    }

    fn result_factory(&self) -> ResultFactory {
        match &self.context {
            Some(ctx) => *ctx.result_factory(),
            None => ResultFactory::from_flow(&self.flow),
        }
    }

    /// Tear the run scope down: wait for background work, report the final
    /// state to the enclosing run and release the client.
    ///
    /// Does nothing unless the engine is started.
    pub async fn finish(&mut self) {
        if !self.connected {
            return;
        }
        if let Some(ctx) = self.context.take() {
            ctx.background_tasks().close().await;
        }
        if let (Some(parent), Some(state)) = (&self.parent, self.state()) {
            parent.record_child_state(state.clone());
        }
        self.client.close().await;
        self.connected = false;
        debug!(flow_name = %self.flow.name(), "engine finished");
    }
}
