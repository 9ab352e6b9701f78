//! Entry points that run a flow to a final state.
//!
//! [`run_flow`] is awaited on the caller's runtime. [`run_flow_sync`] blocks the
//! calling thread. Both drive the same core.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Builder, Handle};
use tracing::{Instrument, debug};

use super::run::FlowRunEngine;
use crate::client::{FlowRun, OrchestrationClient, get_client};
use crate::config::Settings;
use crate::context::{ExecutionMode, FlowRunContext};
use crate::error::EngineError;
use crate::flow::{Flow, Parameters};
use crate::state::{ErrorPayload, State, StateData};
use crate::task_group::TaskGroup;

/// What a driver hands back once the run is final.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnType {
    /// The final state.
    State,
    /// The value resolved from the final state.
    #[default]
    Result,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutput {
    State(State),
    Value(Option<Value>),
    /// Error payload of a failed run resolved without raising.
    Error(ErrorPayload),
}

impl RunOutput {
    pub fn into_state(self) -> Option<State> {
        match self {
            RunOutput::State(state) => Some(state),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            RunOutput::Value(value) => value,
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct RunOptions {
    /// Orchestrator to use. Defaults to the enclosing run's client, then to settings.
    pub client: Option<Arc<dyn OrchestrationClient>>,
    /// Existing run record to drive instead of creating a new one.
    pub flow_run: Option<FlowRun>,
    pub return_type: ReturnType,
    pub raise_on_failure: bool,
    /// Delay between RUNNING proposals while the run is held in PENDING.
    pub pending_backoff: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            client: None,
            flow_run: None,
            return_type: ReturnType::default(),
            raise_on_failure: true,
            pending_backoff: Duration::from_secs(1),
        }
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pending_backoff: settings.pending_poll_interval(),
            ..Self::default()
        }
    }

    pub fn with_client(mut self, client: Arc<dyn OrchestrationClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_flow_run(mut self, flow_run: FlowRun) -> Self {
        self.flow_run = Some(flow_run);
        self
    }

    pub fn returning(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }

    pub fn raise_on_failure(mut self, raise: bool) -> Self {
        self.raise_on_failure = raise;
        self
    }

    pub fn with_pending_backoff(mut self, backoff: Duration) -> Self {
        self.pending_backoff = backoff;
        self
    }
}

/// Run `flow` on the current runtime.
///
/// Inside another flow run the new run becomes its child.
pub async fn run_flow(
    flow: &Flow,
    parameters: Parameters,
    options: RunOptions,
) -> Result<RunOutput, EngineError> {
    let parent = FlowRunContext::current();
    execute(
        flow,
        parameters,
        options,
        parent,
        ExecutionMode::Cooperative,
        None,
    )
    .await
}

/// Run `flow` to completion, blocking the calling thread.
///
/// Called from a runtime thread, the run is driven on a dedicated thread so the
/// caller's runtime is never re-entered. That thread runs its own runtime, so the
/// client is forked when it holds connections bound to the caller's runtime.
pub fn run_flow_sync(
    flow: &Flow,
    parameters: Parameters,
    options: RunOptions,
) -> Result<RunOutput, EngineError> {
    let parent = FlowRunContext::current();
    if Handle::try_current().is_err() {
        return run_blocking(flow, parameters, options, parent);
    }

    let client = resolve_client(&options, parent.as_ref())?;
    let client = client.fork()?.unwrap_or(client);
    let options = options.with_client(client);

    debug!(flow_name = %flow.name(), "inside a runtime, driving blocking run on its own thread");
    std::thread::scope(|scope| {
        let worker = scope.spawn(move || run_blocking(flow, parameters, options, parent));
        match worker.join() {
            Ok(output) => output,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}

fn run_blocking(
    flow: &Flow,
    parameters: Parameters,
    options: RunOptions,
    parent: Option<Arc<FlowRunContext>>,
) -> Result<RunOutput, EngineError> {
    // Built before the driving runtime exists so background work gets its own runtime.
    let task_group = TaskGroup::new()?;
    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(execute(
        flow,
        parameters,
        options,
        parent,
        ExecutionMode::Blocking,
        Some(task_group),
    ))
}

fn resolve_client(
    options: &RunOptions,
    parent: Option<&Arc<FlowRunContext>>,
) -> Result<Arc<dyn OrchestrationClient>, EngineError> {
    if let Some(client) = &options.client {
        return Ok(Arc::clone(client));
    }
    if let Some(parent) = parent {
        return Ok(Arc::clone(parent.client()));
    }
    let settings = Settings::load().map_err(|err| EngineError::Config(err.to_string()))?;
    Ok(get_client(&settings)?)
}

async fn execute(
    flow: &Flow,
    parameters: Parameters,
    options: RunOptions,
    parent: Option<Arc<FlowRunContext>>,
    mode: ExecutionMode,
    task_group: Option<TaskGroup>,
) -> Result<RunOutput, EngineError> {
    let client = resolve_client(&options, parent.as_ref())?;
    let mut engine = FlowRunEngine::new(flow.clone(), client)
        .with_parameters(parameters)
        .with_flow_run(options.flow_run.clone())
        .with_parent(parent)
        .with_execution_mode(mode);
    if let Some(group) = task_group {
        engine = engine.with_task_group(group);
    }

    engine.start().await?;
    let context = engine.context().cloned();
    let outcome = match context {
        Some(ctx) => {
            let span = ctx.logger().span().clone();
            FlowRunContext::scope(ctx, drive(&mut engine, &options))
                .instrument(span)
                .await
        }
        None => Err(EngineError::NotStarted),
    };
    engine.finish().await;
    outcome
}

async fn drive(engine: &mut FlowRunEngine, options: &RunOptions) -> Result<RunOutput, EngineError> {
    engine.begin_run().await?;
    while engine.is_pending() {
        tokio::time::sleep(options.pending_backoff).await;
        engine.begin_run().await?;
    }

    while engine.is_running() {
        let flow = engine.flow().clone();
        let parameters = engine.parameters().clone();
        match flow.invoke(parameters).await {
            Ok(value) => {
                let value = engine.handle_success(value).await?;
                if options.return_type == ReturnType::Result {
                    return Ok(RunOutput::Value(Some(value)));
                }
            }
            Err(err) => {
                engine.handle_exception(&err, None, None).await?;
            }
        }
    }

    let state = engine.state().cloned().ok_or(EngineError::MissingFlowRun)?;
    match options.return_type {
        ReturnType::State => Ok(RunOutput::State(state)),
        ReturnType::Result => match state.result(options.raise_on_failure)? {
            Some(StateData::Result(value)) => Ok(RunOutput::Value(Some(value))),
            Some(StateData::Error(payload)) => Ok(RunOutput::Error(payload)),
            None => Ok(RunOutput::Value(None)),
        },
    }
}
