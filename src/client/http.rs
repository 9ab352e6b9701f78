use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use super::error::ClientError;
use super::types::{
    FlowRun, FlowRunCreate, OrchestrationResult, SetStateRequest, TaskRun, TaskRunCreate,
};
use super::OrchestrationClient;
use crate::config::Settings;
use crate::state::State;

/// Client for a JSON orchestration API.
///
/// Pooled connections are tied to the runtime that opened them. A run driven
/// on another runtime gets its own pool through [`OrchestrationClient::fork`].
pub struct HttpClient {
    base_url: String,
    api_key: Option<String>,
    connect_timeout: Duration,
    timeout: Duration,
    client: Client,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_timeouts(base_url, None, Duration::from_secs(10), Duration::from_secs(30))
    }

    pub fn from_settings(base_url: &str, settings: &Settings) -> Result<Self, ClientError> {
        Self::with_timeouts(
            base_url,
            settings.api_key.clone(),
            Duration::from_secs(settings.connect_timeout_secs),
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            connect_timeout,
            timeout,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = self.authorize(request).send().await.map_err(map_send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

fn map_send_error(err: reqwest::Error) -> ClientError {
    if err.is_connect() || err.is_timeout() {
        ClientError::Unreachable(err.to_string())
    } else {
        ClientError::Network(err)
    }
}

#[async_trait]
impl OrchestrationClient for HttpClient {
    async fn connect(&self) -> Result<(), ClientError> {
        match self.send(self.client.get(self.url("/health"))).await {
            Ok(_) => Ok(()),
            Err(ClientError::Api { status, message }) => Err(ClientError::Unreachable(format!(
                "health check returned {status}: {message}"
            ))),
            Err(err) => Err(err),
        }
    }

    fn fork(&self) -> Result<Option<Arc<dyn OrchestrationClient>>, ClientError> {
        let client = Self::with_timeouts(
            self.base_url.clone(),
            self.api_key.clone(),
            self.connect_timeout,
            self.timeout,
        )?;
        debug!(base_url = %self.base_url, "forked http client with a fresh connection pool");
        Ok(Some(Arc::new(client)))
    }

    async fn create_flow_run(&self, request: FlowRunCreate) -> Result<FlowRun, ClientError> {
        let response = self
            .send(self.client.post(self.url("/flow_runs/")).json(&request))
            .await?;
        let run: FlowRun = Self::decode(response).await?;
        debug!(flow_run_id = %run.id(), flow_name = %run.flow_name(), "created flow run");
        Ok(run)
    }

    async fn read_flow_run(&self, id: Uuid) -> Result<FlowRun, ClientError> {
        let url = self.url(&format!("/flow_runs/{id}"));
        match self.send(self.client.get(url)).await {
            Ok(response) => Self::decode(response).await,
            Err(ClientError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ClientError::NotFound {
                    kind: "flow run",
                    id,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn set_flow_run_state(
        &self,
        id: Uuid,
        state: State,
    ) -> Result<OrchestrationResult, ClientError> {
        let url = self.url(&format!("/flow_runs/{id}/set_state"));
        let response = self
            .send(self.client.post(url).json(&SetStateRequest { state }))
            .await?;
        Self::decode(response).await
    }

    async fn create_task_run(&self, request: TaskRunCreate) -> Result<TaskRun, ClientError> {
        let response = self
            .send(self.client.post(self.url("/task_runs/")).json(&request))
            .await?;
        Self::decode(response).await
    }
}
