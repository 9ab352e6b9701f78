//! Run engine for flows.
//!
//! A [`Flow`] is a named unit of work. [`run_flow`] and [`run_flow_sync`]
//! create a run for it through an [`OrchestrationClient`], propose state
//! transitions, invoke the flow body and apply whatever states the
//! orchestrator accepts, until the run is final.

pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod flow;
pub mod results;
pub mod state;
pub mod task_group;

pub use client::{OrchestrationClient, OrchestrationResult};
pub use context::{FlowRunContext, get_run_logger};
pub use engine::{FlowRunEngine, ReturnType, RunOptions, RunOutput, run_flow, run_flow_sync};
pub use error::EngineError;
pub use flow::{Flow, Parameters};
pub use state::{State, StateType};
