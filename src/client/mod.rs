//! Boundary to the orchestration API.
//!
//! The engine only talks to the orchestrator through [`OrchestrationClient`].
//! [`HttpClient`] speaks to a remote JSON API; [`InMemoryOrchestrator`] keeps
//! everything in process and is used when no API is configured.

pub mod error;
pub mod http;
pub mod memory;
#[cfg(test)]
pub(crate) mod scripted;
pub mod types;

pub use error::ClientError;
pub use http::HttpClient;
pub use memory::{InMemoryOrchestrator, OrchestrationRules};
pub use types::{
    FlowRun, FlowRunCreate, OrchestrationResult, RetryPolicy, TaskRun, TaskRunCreate,
};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::config::Settings;
use crate::state::State;

#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Open the connection; fails with [`ClientError::Unreachable`] when the API is down.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Release the connection opened by [`connect`](Self::connect).
    async fn close(&self) {}

    /// A client with its own connections, for a run driven on another runtime.
    ///
    /// `None` when this client holds nothing bound to the runtime it was used on
    /// and can be shared as is.
    fn fork(&self) -> Result<Option<Arc<dyn OrchestrationClient>>, ClientError> {
        Ok(None)
    }

    async fn create_flow_run(&self, request: FlowRunCreate) -> Result<FlowRun, ClientError>;

    async fn read_flow_run(&self, id: Uuid) -> Result<FlowRun, ClientError>;

    /// Propose `state` for a run. The answer says what was actually recorded.
    async fn set_flow_run_state(
        &self,
        id: Uuid,
        state: State,
    ) -> Result<OrchestrationResult, ClientError>;

    async fn create_task_run(&self, request: TaskRunCreate) -> Result<TaskRun, ClientError>;
}

/// Build the client described by `settings`.
///
/// With an `api_url` this is an [`HttpClient`]; otherwise an ephemeral
/// [`InMemoryOrchestrator`] private to the caller.
pub fn get_client(settings: &Settings) -> Result<Arc<dyn OrchestrationClient>, ClientError> {
    match &settings.api_url {
        Some(url) => {
            let client = HttpClient::from_settings(url, settings)?;
            Ok(Arc::new(client))
        }
        None => {
            debug!("no api_url configured, using ephemeral in-memory orchestrator");
            Ok(Arc::new(InMemoryOrchestrator::new()))
        }
    }
}
