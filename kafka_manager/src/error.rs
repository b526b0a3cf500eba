//! Error types for the producer manager
//!
//! Every failure surfaced by [`BrokerProducerManager`](crate::manager::BrokerProducerManager)
//! is a [`ManagerError`] tagged with the operation it came from, so callers can
//! branch on the kind of failure instead of matching on message text.

use std::fmt;
use thiserror::Error;

/// The manager operation an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    Health,
    Produce,
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Health => "health",
            Operation::Produce => "produce",
            Operation::Close => "close",
        };
        f.write_str(name)
    }
}

/// Rejected caller configuration, detected before any network I/O
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("clientId must not be empty")]
    MissingClientId,

    #[error("brokers must contain at least one address")]
    NoBrokers,

    #[error("invalid broker address '{0}', expected host:port")]
    InvalidBroker(String),

    #[error("topic must not be empty")]
    MissingTopic,

    #[error("invalid topic name '{name}': {reason}")]
    InvalidTopic { name: String, reason: &'static str },
}

/// Cause of a failed `init`
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error(transparent)]
    Client(anyhow::Error),
}

/// Error returned by the manager operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Kafka initializing failed with error: {source}")]
    Initialization { source: InitError },

    #[error("Kafka health check failed with error: {source}")]
    HealthCheck { source: anyhow::Error },

    /// Carries the publish failure as-is; its text is the cause's text.
    #[error("{source}")]
    Produce { source: anyhow::Error },

    #[error("Kafka client is not initialized, call init before {operation}")]
    NotInitialized { operation: Operation },
}

impl ManagerError {
    /// Operation that produced this error
    pub fn operation(&self) -> Operation {
        match self {
            ManagerError::Initialization { .. } => Operation::Init,
            ManagerError::HealthCheck { .. } => Operation::Health,
            ManagerError::Produce { .. } => Operation::Produce,
            ManagerError::NotInitialized { operation } => *operation,
        }
    }

    /// Whether `init` failed because the configuration was rejected
    pub fn is_config_validation(&self) -> bool {
        matches!(
            self,
            ManagerError::Initialization {
                source: InitError::InvalidConfig(_)
            }
        )
    }
}
