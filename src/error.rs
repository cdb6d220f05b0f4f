//! Error types for Agora
//!
//! Defines the crate-wide error enum. Subsystems keep their own error types
//! (bus, decisions, engine) and convert into [`AgoraError`] at the edges.
//! Uses thiserror for ergonomic error handling.

use crate::bus::BusError;
use crate::engine::EngineError;
use crate::swarm::DecisionError;
use thiserror::Error;

/// Result type alias for Agora operations
pub type Result<T> = std::result::Result<T, AgoraError>;

/// Comprehensive error type for Agora operations
#[derive(Error, Debug)]
pub enum AgoraError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parsing errors (JSONL records, config values)
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Message bus errors (rate limiting, delivery)
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Agent-local decision errors
    #[error("Decision error: {0}")]
    Decision(#[from] DecisionError),

    /// Scheduler errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// External oracle errors
    #[error("Oracle error: {0}")]
    Oracle(#[from] oracles::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl AgoraError {
    /// Whether the caller may retry the failed operation later
    ///
    /// Only rate limiting is recoverable; nothing in the runtime retries on
    /// its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AgoraError::Bus(BusError::RateLimitExceeded { .. }))
    }
}
