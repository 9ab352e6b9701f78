//! The execution context of the active flow run.
//!
//! Each run scope installs its [`FlowRunContext`] in a task-local slot. Scopes
//! nest: entering a nested run shadows the outer context and leaving it
//! restores the outer one. Code running inside a flow body reaches its run
//! through [`FlowRunContext::current`] or [`get_run_logger`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::client::{FlowRun, OrchestrationClient};
use crate::error::ContextError;
use crate::flow::{Flow, Parameters, TaskRunner};
use crate::results::ResultFactory;
use crate::state::State;
use crate::task_group::TaskGroup;

tokio::task_local! {
    static FLOW_RUN_CONTEXT: Arc<FlowRunContext>;
}

/// How the driving engine waits on its work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Awaited on the caller's runtime.
    #[default]
    Cooperative,
    /// Driven to completion on a private runtime by a blocked thread.
    Blocking,
}

/// Logger bound to one flow run. Events are emitted inside the run's span.
#[derive(Debug, Clone)]
pub struct RunLogger {
    span: Span,
    flow_run_id: Uuid,
}

impl RunLogger {
    pub fn new(flow: &Flow, flow_run: &FlowRun) -> Self {
        let span = info_span!(
            "flow_run",
            flow_name = %flow.name(),
            flow_run_id = %flow_run.id(),
            flow_run_name = flow_run.name().unwrap_or_default(),
        );
        Self {
            span,
            flow_run_id: flow_run.id(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn flow_run_id(&self) -> Uuid {
        self.flow_run_id
    }

    pub fn debug(&self, message: &str) {
        self.span.in_scope(|| debug!("{message}"));
    }

    pub fn info(&self, message: &str) {
        self.span.in_scope(|| info!("{message}"));
    }

    pub fn warn(&self, message: &str) {
        self.span.in_scope(|| warn!("{message}"));
    }

    pub fn error(&self, message: &str) {
        self.span.in_scope(|| error!("{message}"));
    }
}

pub struct FlowRunContext {
    flow: Flow,
    flow_run_id: Uuid,
    flow_run_name: Option<String>,
    state: watch::Receiver<State>,
    parameters: Parameters,
    client: Arc<dyn OrchestrationClient>,
    logger: RunLogger,
    log_prints: bool,
    result_factory: ResultFactory,
    task_runner: TaskRunner,
    background_tasks: TaskGroup,
    mode: ExecutionMode,
    parent: Option<Arc<FlowRunContext>>,
    start_time: DateTime<Utc>,
    dynamic_keys: Mutex<HashMap<String, u32>>,
    child_flow_run_states: Mutex<Vec<State>>,
}

impl fmt::Debug for FlowRunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRunContext")
            .field("flow", &self.flow.name())
            .field("flow_run_id", &self.flow_run_id)
            .field("flow_run_name", &self.flow_run_name)
            .field("mode", &self.mode)
            .field("parent", &self.parent.as_ref().map(|p| p.flow_run_id))
            .finish_non_exhaustive()
    }
}

impl FlowRunContext {
    pub(crate) fn new(
        flow: Flow,
        flow_run: &FlowRun,
        state: watch::Receiver<State>,
        client: Arc<dyn OrchestrationClient>,
        background_tasks: TaskGroup,
    ) -> Self {
        let logger = RunLogger::new(&flow, flow_run);
        Self {
            flow_run_id: flow_run.id(),
            flow_run_name: flow_run.name().map(str::to_string),
            state,
            parameters: flow_run.parameters().clone(),
            client,
            logger,
            log_prints: flow.log_prints(),
            result_factory: ResultFactory::from_flow(&flow),
            task_runner: flow.task_runner(),
            background_tasks,
            mode: ExecutionMode::default(),
            parent: None,
            start_time: Utc::now(),
            dynamic_keys: Mutex::new(HashMap::new()),
            child_flow_run_states: Mutex::new(Vec::new()),
            flow,
        }
    }

    pub(crate) fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub(crate) fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn with_parent(mut self, parent: Option<Arc<FlowRunContext>>) -> Self {
        self.parent = parent;
        self
    }

    /// The innermost active context, if any.
    pub fn current() -> Option<Arc<FlowRunContext>> {
        FLOW_RUN_CONTEXT.try_with(Arc::clone).ok()
    }

    pub fn get() -> Result<Arc<FlowRunContext>, ContextError> {
        Self::current().ok_or(ContextError::Missing)
    }

    /// Run `fut` with `ctx` as the current context.
    pub(crate) async fn scope<F>(ctx: Arc<FlowRunContext>, fut: F) -> F::Output
    where
        F: Future,
    {
        FLOW_RUN_CONTEXT.scope(ctx, fut).await
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn flow_run_id(&self) -> Uuid {
        self.flow_run_id
    }

    pub fn flow_run_name(&self) -> Option<&str> {
        self.flow_run_name.as_deref()
    }

    /// Latest state applied by the engine.
    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state the engine applies.
    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn client(&self) -> &Arc<dyn OrchestrationClient> {
        &self.client
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    pub fn log_prints(&self) -> bool {
        self.log_prints
    }

    pub fn result_factory(&self) -> &ResultFactory {
        &self.result_factory
    }

    pub fn task_runner(&self) -> TaskRunner {
        self.task_runner
    }

    pub fn background_tasks(&self) -> &TaskGroup {
        &self.background_tasks
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn parent(&self) -> Option<&Arc<FlowRunContext>> {
        self.parent.as_ref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Next dynamic key for `task_key`, counting from 0 within this run.
    pub fn next_dynamic_key(&self, task_key: &str) -> String {
        let mut keys = lock(&self.dynamic_keys);
        let next = keys.entry(task_key.to_string()).or_insert(0);
        let key = next.to_string();
        *next += 1;
        key
    }

    /// Print a line from user code, through the run logger when `log_prints` is on.
    pub fn print(&self, message: &str) {
        if self.log_prints {
            self.logger.info(message);
        } else {
            println!("{message}");
        }
    }

    pub(crate) fn record_child_state(&self, state: State) {
        lock(&self.child_flow_run_states).push(state);
    }

    /// Final states of the nested flow runs that finished inside this run.
    pub fn child_flow_run_states(&self) -> Vec<State> {
        lock(&self.child_flow_run_states).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Logger of the current flow run.
pub fn get_run_logger() -> Result<RunLogger, ContextError> {
    FLOW_RUN_CONTEXT
        .try_with(|ctx| ctx.logger.clone())
        .map_err(|_| ContextError::Missing)
}
