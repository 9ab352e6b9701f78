//! Records exchanged with the orchestration API.
//!
//! All types serialize to the JSON shapes used by the HTTP client.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::Parameters;
use crate::state::{State, StateType};

/// Durable record of one execution of a flow.
///
/// The id is always assigned by the orchestrator. The state is written only by the
/// run engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    id: Uuid,
    #[serde(default)]
    name: Option<String>,
    flow_name: String,
    #[serde(default)]
    flow_version: Option<String>,
    #[serde(default)]
    parameters: Parameters,
    state: State,
    #[serde(default)]
    parent_task_run_id: Option<Uuid>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    run_count: u32,
    created: DateTime<Utc>,
}

impl FlowRun {
    /// Build the record an orchestrator stores for `request` under `id`.
    pub fn from_request(id: Uuid, request: &FlowRunCreate) -> Self {
        Self {
            id,
            name: request.name.clone(),
            flow_name: request.flow_name.clone(),
            flow_version: request.flow_version.clone(),
            parameters: request.parameters.clone(),
            state: request.state.clone(),
            parent_task_run_id: request.parent_task_run_id,
            tags: request.tags.clone(),
            run_count: 0,
            created: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn flow_version(&self) -> Option<&str> {
        self.flow_version.as_deref()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_type(&self) -> StateType {
        self.state.state_type()
    }

    pub fn state_name(&self) -> &str {
        self.state.name()
    }

    pub fn parent_task_run_id(&self) -> Option<Uuid> {
        self.parent_task_run_id
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub(crate) fn apply_state(&mut self, state: State) {
        self.state = state;
    }

    pub(crate) fn set_run_count(&mut self, run_count: u32) {
        self.run_count = run_count;
    }
}

/// Retry settings the orchestrator consults when a run proposes FAILED.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunCreate {
    pub flow_name: String,
    #[serde(default)]
    pub flow_version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
    pub state: State,
    #[serde(default)]
    pub parent_task_run_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub empirical_policy: RetryPolicy,
}

/// Child work record that ties a nested flow run to its parent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub flow_run_id: Uuid,
    pub name: String,
    pub task_key: String,
    pub dynamic_key: String,
    /// Upstream run ids per input name.
    #[serde(default)]
    pub task_inputs: BTreeMap<String, Vec<Uuid>>,
    pub state: State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunCreate {
    pub flow_run_id: Uuid,
    pub name: String,
    pub task_key: String,
    pub dynamic_key: String,
    #[serde(default)]
    pub task_inputs: BTreeMap<String, Vec<Uuid>>,
    pub state: State,
}

impl TaskRun {
    pub fn from_request(id: Uuid, request: TaskRunCreate) -> Self {
        Self {
            id,
            flow_run_id: request.flow_run_id,
            name: request.name,
            task_key: request.task_key,
            dynamic_key: request.dynamic_key,
            task_inputs: request.task_inputs,
            state: request.state,
        }
    }
}

/// Orchestrator's answer to a proposed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrchestrationResult {
    /// The proposal was recorded as `state`.
    Accept { state: State },
    /// The proposal was refused; `state` is what the orchestrator recorded instead.
    Reject { state: State, reason: String },
    /// Propose again after the delay.
    Wait { delay_seconds: f64, reason: String },
    /// The run must stop.
    Abort { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SetStateRequest {
    pub state: State,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> FlowRunCreate {
        FlowRunCreate {
            flow_name: "foo".into(),
            flow_version: None,
            name: Some("name is blue".into()),
            parameters: Parameters::new(),
            state: State::pending(),
            parent_task_run_id: None,
            tags: vec!["etl".into()],
            empirical_policy: RetryPolicy { retries: 2 },
        }
    }

    #[test]
    fn flow_run_from_request_copies_fields() {
        let id = Uuid::new_v4();
        let run = FlowRun::from_request(id, &request());
        assert_eq!(run.id(), id);
        assert_eq!(run.name(), Some("name is blue"));
        assert_eq!(run.state_type(), StateType::Pending);
        assert_eq!(run.tags(), ["etl".to_string()]);
        assert_eq!(run.run_count(), 0);
    }

    #[test]
    fn orchestration_result_is_tagged_by_status() {
        let wait: OrchestrationResult = serde_json::from_value(json!({
            "status": "wait",
            "delay_seconds": 0.5,
            "reason": "concurrency limit"
        }))
        .unwrap();
        assert_eq!(
            wait,
            OrchestrationResult::Wait {
                delay_seconds: 0.5,
                reason: "concurrency limit".into()
            }
        );

        let json = serde_json::to_value(OrchestrationResult::Abort {
            reason: "deleted".into(),
        })
        .unwrap();
        assert_eq!(json, json!({"status": "abort", "reason": "deleted"}));
    }

    #[test]
    fn flow_run_deserializes_with_missing_optional_fields() {
        let run: FlowRun = serde_json::from_value(json!({
            "id": Uuid::nil(),
            "flow_name": "foo",
            "state": State::running(),
            "created": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(run.flow_name(), "foo");
        assert!(run.parameters().is_empty());
        assert_eq!(run.parent_task_run_id(), None);
    }
}
