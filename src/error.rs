use thiserror::Error;

use crate::client::ClientError;
use crate::state::{ErrorPayload, StateType};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to orchestration API: {0}")]
    Connection(#[source] ClientError),

    #[error("orchestration API error: {0}")]
    Client(#[from] ClientError),

    #[error("Engine has not started.")]
    NotStarted,

    #[error("engine has no flow run")]
    MissingFlowRun,

    #[error("orchestration aborted the run: {0}")]
    Aborted(String),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("failed to build runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// True for errors caused by the orchestration API being unreachable.
    pub fn is_connection(&self) -> bool {
        match self {
            EngineError::Connection(_) => true,
            EngineError::Client(err) => err.is_unreachable(),
            _ => false,
        }
    }
}

/// Raised when a run's final state is resolved into a value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    /// The run finished FAILED or CRASHED.
    #[error("flow run {state_type}: {message}")]
    Failed {
        state_type: StateType,
        message: String,
        cause: Option<ErrorPayload>,
    },

    #[error("flow run is not finished, current state is {0}")]
    Unfinished(StateType),
}

impl RunError {
    /// The captured error of the failed run, if any.
    pub fn cause(&self) -> Option<&ErrorPayload> {
        match self {
            RunError::Failed { cause, .. } => cause.as_ref(),
            RunError::Unfinished(_) => None,
        }
    }
}

/// A single problem found while validating flow parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterIssue {
    #[error("missing required parameter `{0}`")]
    Missing(String),

    #[error("unexpected parameter `{0}`")]
    Unexpected(String),

    #[error("parameter `{name}` expected {expected}, got {found}")]
    WrongType {
        name: String,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} parameter validation error(s): {}", .issues.len(), render_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ParameterIssue>,
}

fn render_issues(issues: &[ParameterIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunNameError {
    #[error("run name template references unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("run name template is malformed: {0}")]
    Malformed(String),

    #[error("run name resolver failed: {0}")]
    Resolver(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("no flow run context is active")]
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display_lists_issues() {
        let err = ValidationError {
            issues: vec![
                ParameterIssue::Missing("x".into()),
                ParameterIssue::Unexpected("z".into()),
            ],
        };
        assert_eq!(
            err.to_string(),
            "2 parameter validation error(s): missing required parameter `x`; unexpected parameter `z`"
        );
    }

    #[test]
    fn run_error_display_includes_message() {
        let err = RunError::Failed {
            state_type: StateType::Failed,
            message: "Flow run encountered an exception: Error: xyz".into(),
            cause: None,
        };
        assert_eq!(
            err.to_string(),
            "flow run FAILED: Flow run encountered an exception: Error: xyz"
        );
    }

    #[test]
    fn connection_errors_are_classified() {
        let err = EngineError::Connection(ClientError::Unreachable("refused".into()));
        assert!(err.is_connection());
        assert!(!EngineError::NotStarted.is_connection());
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
        assert_send_sync::<RunError>();
    }
}
