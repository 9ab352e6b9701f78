//! Run states.
//!
//! A [`State`] is never mutated once built. The engine builds states locally as
//! proposals; the orchestrator answers with the state that is actually recorded.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Pending,
    Running,
    Completed,
    Failed,
    Crashed,
    Retrying,
}

impl StateType {
    /// COMPLETED, FAILED and CRASHED end an attempt.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            StateType::Completed | StateType::Failed | StateType::Crashed
        )
    }

    /// A granted retry is a running attempt.
    pub fn is_running(self) -> bool {
        matches!(self, StateType::Running | StateType::Retrying)
    }

    fn default_name(self) -> &'static str {
        match self {
            StateType::Pending => "Pending",
            StateType::Running => "Running",
            StateType::Completed => "Completed",
            StateType::Failed => "Failed",
            StateType::Crashed => "Crashed",
            StateType::Retrying => "Retrying",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateType::Pending => write!(f, "PENDING"),
            StateType::Running => write!(f, "RUNNING"),
            StateType::Completed => write!(f, "COMPLETED"),
            StateType::Failed => write!(f, "FAILED"),
            StateType::Crashed => write!(f, "CRASHED"),
            StateType::Retrying => write!(f, "RETRYING"),
        }
    }
}

/// Serialized representation of an error captured from a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub causes: Vec<String>,
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Payload attached to a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateData {
    Result(Value),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "type")]
    state_type: StateType,
    name: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<StateData>,
    timestamp: DateTime<Utc>,
}

impl State {
    pub fn new(state_type: StateType) -> Self {
        Self {
            state_type,
            name: state_type.default_name().to_string(),
            message: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn pending() -> Self {
        Self::new(StateType::Pending)
    }

    pub fn running() -> Self {
        Self::new(StateType::Running)
    }

    pub fn retrying() -> Self {
        Self::new(StateType::Retrying)
    }

    pub fn completed() -> Self {
        Self::new(StateType::Completed)
    }

    pub fn completed_with(result: Value) -> Self {
        Self::completed().with_data(StateData::Result(result))
    }

    pub fn failed(message: impl Into<String>, error: ErrorPayload) -> Self {
        Self::new(StateType::Failed)
            .with_message(message)
            .with_data(StateData::Error(error))
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(StateType::Crashed).with_message(message)
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }

    pub fn with_data(self, data: StateData) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn state_type(&self) -> StateType {
        self.state_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn data(&self) -> Option<&StateData> {
        self.data.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_pending(&self) -> bool {
        self.state_type == StateType::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state_type.is_running()
    }

    pub fn is_completed(&self) -> bool {
        self.state_type == StateType::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state_type == StateType::Failed
    }

    pub fn is_crashed(&self) -> bool {
        self.state_type == StateType::Crashed
    }

    pub fn is_final(&self) -> bool {
        self.state_type.is_final()
    }

    /// Resolve the payload of this state.
    ///
    /// With `raise_on_failure`, FAILED/CRASHED states become [`RunError::Failed`] and
    /// unfinished states become [`RunError::Unfinished`]. Without it, the payload is
    /// returned as data whatever the state type.
    pub fn result(&self, raise_on_failure: bool) -> Result<Option<StateData>, RunError> {
        if raise_on_failure {
            if self.is_failed() || self.is_crashed() {
                let cause = match &self.data {
                    Some(StateData::Error(payload)) => Some(payload.clone()),
                    _ => None,
                };
                let message = self
                    .message
                    .clone()
                    .or_else(|| cause.as_ref().map(ToString::to_string))
                    .unwrap_or_else(|| self.name.clone());
                return Err(RunError::Failed {
                    state_type: self.state_type,
                    message,
                    cause,
                });
            }
            if !self.is_final() {
                return Err(RunError::Unfinished(self.state_type));
            }
        }
        Ok(self.data.clone())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}({}): {message}", self.name, self.state_type),
            None => write!(f, "{}({})", self.name, self.state_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> ErrorPayload {
        ErrorPayload {
            kind: "Error".into(),
            message: "xyz".into(),
            causes: vec![],
        }
    }

    #[test]
    fn constructors_set_type_and_default_name() {
        assert_eq!(State::pending().state_type(), StateType::Pending);
        assert_eq!(State::running().name(), "Running");
        assert_eq!(State::retrying().name(), "Retrying");
        assert_eq!(State::crashed("boom").message(), Some("boom"));
    }

    #[test]
    fn retrying_counts_as_running() {
        assert!(State::retrying().is_running());
        assert!(State::running().is_running());
        assert!(!State::pending().is_running());
        assert!(!State::retrying().is_final());
    }

    #[test]
    fn final_states() {
        assert!(State::completed().is_final());
        assert!(State::failed("x", payload()).is_final());
        assert!(State::crashed("x").is_final());
        assert!(!State::pending().is_final());
    }

    #[test]
    fn builders_produce_new_values() {
        let original = State::completed();
        let renamed = original.clone().with_name("Cached");
        assert_eq!(original.name(), "Completed");
        assert_eq!(renamed.name(), "Cached");
        assert_eq!(renamed.state_type(), StateType::Completed);
    }

    #[test]
    fn completed_result_resolves_value() {
        let state = State::completed_with(json!(42));
        assert_eq!(
            state.result(true).unwrap(),
            Some(StateData::Result(json!(42)))
        );
    }

    #[test]
    fn failed_result_raises_with_cause() {
        let state = State::failed("Flow run encountered an exception: Error: xyz", payload());
        let err = state.result(true).unwrap_err();
        assert!(err.to_string().contains("xyz"));
        assert_eq!(err.cause(), Some(&payload()));
    }

    #[test]
    fn failed_result_without_raise_returns_error_data() {
        let state = State::failed("boom", payload());
        assert_eq!(
            state.result(false).unwrap(),
            Some(StateData::Error(payload()))
        );
    }

    #[test]
    fn unfinished_state_raises() {
        let err = State::running().result(true).unwrap_err();
        assert_eq!(err, RunError::Unfinished(StateType::Running));
    }

    #[test]
    fn state_type_serializes_screaming_case() {
        let json = serde_json::to_value(State::completed_with(json!("ok"))).unwrap();
        assert_eq!(json["type"], "COMPLETED");
        assert_eq!(json["data"]["kind"], "result");
        assert_eq!(json["data"]["value"], "ok");
    }

    #[test]
    fn state_display() {
        assert_eq!(State::running().to_string(), "Running(RUNNING)");
        assert_eq!(
            State::crashed("lost worker").to_string(),
            "Crashed(CRASHED): lost worker"
        );
    }
}
