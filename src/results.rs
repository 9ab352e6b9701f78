use serde_json::Value;

use crate::error::{RunError, ValidationError};
use crate::flow::Flow;
use crate::state::{ErrorPayload, State, StateData};

/// Decides how results and errors are stored on states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultFactory {
    capture_causes: bool,
}

impl Default for ResultFactory {
    fn default() -> Self {
        Self {
            capture_causes: true,
        }
    }
}

impl ResultFactory {
    pub fn from_flow(flow: &Flow) -> Self {
        Self {
            capture_causes: flow.captures_error_causes(),
        }
    }

    pub fn captures_causes(&self) -> bool {
        self.capture_causes
    }

    pub fn create_result(&self, value: Value) -> StateData {
        StateData::Result(value)
    }

    pub fn serialize_error(&self, err: &anyhow::Error) -> ErrorPayload {
        let causes = if self.capture_causes {
            err.chain().skip(1).map(ToString::to_string).collect()
        } else {
            Vec::new()
        };
        ErrorPayload {
            kind: classify(err).to_string(),
            message: err.to_string(),
            causes,
        }
    }

    /// FAILED state describing `err`, prefixed with `message`.
    pub fn failed_state(&self, err: &anyhow::Error, message: &str) -> State {
        let payload = self.serialize_error(err);
        let full = format!("{message} {}: {}", payload.kind, payload.message);
        State::failed(full, payload)
    }
}

fn classify(err: &anyhow::Error) -> &'static str {
    if err.is::<ValidationError>() {
        "ParameterValidationError"
    } else if err.is::<RunError>() {
        "FlowRunError"
    } else {
        "Error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParameterIssue;
    use crate::state::StateType;
    use anyhow::Context;

    #[test]
    fn failed_state_carries_payload() {
        let err = anyhow::anyhow!("xyz");
        let state = ResultFactory::default()
            .failed_state(&err, "Flow run encountered an exception:");
        assert_eq!(state.state_type(), StateType::Failed);
        assert_eq!(
            state.message(),
            Some("Flow run encountered an exception: Error: xyz")
        );
        match state.data() {
            Some(StateData::Error(payload)) => assert_eq!(payload.message, "xyz"),
            other => panic!("expected error payload, got {other:?}"),
        }
    }

    #[test]
    fn validation_errors_are_classified() {
        let err = anyhow::Error::new(ValidationError {
            issues: vec![ParameterIssue::Missing("x".into())],
        });
        let payload = ResultFactory::default().serialize_error(&err);
        assert_eq!(payload.kind, "ParameterValidationError");
    }

    #[test]
    fn cause_chain_is_recorded() {
        let err = Err::<(), _>(anyhow::anyhow!("disk full"))
            .context("writing report")
            .unwrap_err();
        let payload = ResultFactory::default().serialize_error(&err);
        assert_eq!(payload.message, "writing report");
        assert_eq!(payload.causes, vec!["disk full".to_string()]);
    }

    #[test]
    fn cause_capture_can_be_disabled() {
        let flow = Flow::from_blocking("quiet", |_| Ok(())).with_error_causes(false);
        let err = Err::<(), _>(anyhow::anyhow!("inner"))
            .context("outer")
            .unwrap_err();
        let payload = ResultFactory::from_flow(&flow).serialize_error(&err);
        assert!(payload.causes.is_empty());
    }
}
