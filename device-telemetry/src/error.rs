//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Variants fall into four groups: startup failures (`Broker`, `Topology`,
/// `Configuration`) that abort the pipeline, per-message failures
/// (`Serialization`, `Decode`, `Publish`) whose handling depends on the
/// configured policy, store failures (`Store`) that are always contained to
/// a single write, and the remaining bookkeeping errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Broker connection error: {0}")]
    Broker(String),

    #[error("Broker topology error: {stage} failed: {message}")]
    Topology { stage: &'static str, message: String },

    #[error("Publish error for routing key {routing_key}: {message}")]
    Publish { routing_key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to decode delivery: {0}")]
    Decode(String),

    #[error("Time-series store error: {0}")]
    Store(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0} has already been started")]
    AlreadyStarted(&'static str),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn topology(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Topology {
            stage,
            message: err.to_string(),
        }
    }

    pub fn publish(routing_key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Publish {
            routing_key: routing_key.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error means the pipeline cannot be brought up at all.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::Broker(_) | Self::Topology { .. } | Self::Configuration(_)
        )
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Store(err.to_string())
    }
}
