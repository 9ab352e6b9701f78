//! The run engine and the entry points that drive it.

mod driver;
mod run;

pub use driver::{ReturnType, RunOptions, RunOutput, run_flow, run_flow_sync};
pub use run::{EngineMode, FlowRunEngine};
