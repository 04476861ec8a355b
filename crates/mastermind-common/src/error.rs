//! Error types for the mastermind client
//!
//! This module defines the error types used throughout the client: the
//! transport-level `RpcError` and the crate-wide `Error`.

use crate::types::DatasetKind;
use std::time::Duration;
use thiserror::Error;

/// Common result type for mastermind client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single RPC attempt or connection attempt
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("no response to '{event}' within {timeout:?}")]
    Timeout { event: String, timeout: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("no remote endpoints reachable")]
    NoEndpoints,
}

impl RpcError {
    /// Check if a reconnect and a second attempt may help
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::Transport(_)
        )
    }
}

/// Common error type for the mastermind client
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rpc '{event}' failed: {source}")]
    Rpc {
        event: String,
        #[source]
        source: RpcError,
    },

    #[error("cannot decode {dataset}: {reason}")]
    Decode { dataset: DatasetKind, reason: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a decode error scoped to one dataset
    pub fn decode(dataset: DatasetKind, reason: impl ToString) -> Self {
        Self::Decode {
            dataset,
            reason: reason.to_string(),
        }
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Wrap a failed call into the RpcFailure signal
    pub fn rpc(event: impl Into<String>, source: RpcError) -> Self {
        Self::Rpc {
            event: event.into(),
            source,
        }
    }

    /// Check if this is the RpcFailure signal
    #[must_use]
    pub fn is_rpc_failure(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }

    /// Check if this is a configuration error
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_retryable() {
        assert!(RpcError::Connection("refused".into()).is_retryable());
        assert!(
            RpcError::Timeout {
                event: "fetch-bad-groups".into(),
                timeout: Duration::from_millis(10),
            }
            .is_retryable()
        );
        assert!(!RpcError::Remote("unknown event".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::decode(DatasetKind::BadGroups, "expected array");
        assert_eq!(err.to_string(), "cannot decode bad-groups: expected array");

        let err = Error::rpc("fetch-cached-keys", RpcError::NoEndpoints);
        assert!(err.is_rpc_failure());
        assert!(err.to_string().contains("fetch-cached-keys"));
    }
}
