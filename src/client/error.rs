//! Errors returned by orchestration clients.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The orchestration API could not be reached (refused, DNS, timeout, unhealthy).
    #[error("orchestration API unreachable: {0}")]
    Unreachable(String),

    /// The API answered with a non-success status.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to decode API response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_unreachable(&self) -> bool {
        match self {
            ClientError::Unreachable(_) => true,
            ClientError::Network(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}
