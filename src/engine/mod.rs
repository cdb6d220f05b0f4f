//! Round scheduler
//!
//! The [`Engine`] drives a simulation in discrete rounds. Each round runs in
//! strictly sequenced phases:
//!
//! 1. advance the environment (round counter, timestamp, driver)
//! 2. elect a leader
//! 3. flush pending bus messages into every agent's inbox, concurrently
//! 4. run every swarm's coordination concurrently
//! 5. step agents tier by tier in descending priority; a tier runs
//!    concurrently and must finish before the next one starts
//! 6. detect consensus
//! 7. update metrics
//!
//! Metrics are only touched in the last phase, so a failed round leaves them
//! exactly as they were.

mod environment;
mod handle;
mod metrics;
mod scheduler;

pub use environment::{
    Environment, EnvironmentDriver, MarketDriver, StaticDriver, PRICE_KEY, RISK_KEY,
};
pub use handle::EngineHandle;
pub use metrics::{EngineMetrics, EngineTelemetry};
pub use scheduler::{elect_leader, Engine};

use crate::bus::AgentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Scheduler errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// A round could not be completed; metrics were left untouched
    #[error("scheduler failure in round {round}: {reason}")]
    SchedulerFailure { round: u64, reason: String },

    #[error("engine has been stopped")]
    Stopped,

    #[error("duplicate agent id: {0}")]
    DuplicateAgent(AgentId),

    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("agent id {0} is reserved for the system")]
    ReservedAgentId(AgentId),

    #[error("invalid swarm {swarm}: {reason}")]
    InvalidSwarm { swarm: String, reason: String },

    #[error("invalid tick interval: {0:?}")]
    InvalidInterval(Duration),

    #[error("telemetry error: {0}")]
    Telemetry(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    /// `stop()` was honored; the engine will not run again
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A batch run (`Some(steps)`) or real-time run started
    Started { steps: Option<u64> },

    RoundCompleted {
        round: u64,
        duration: Duration,
        decisions: usize,
        failures: usize,
    },

    /// An agent's decision function failed or panicked
    AgentFailed {
        round: u64,
        agent: AgentId,
        reason: String,
    },

    ConsensusReached {
        round: u64,
        approvals: usize,
        voters: usize,
    },

    LeaderElected {
        round: u64,
        leader: AgentId,
        previous: Option<AgentId>,
    },

    /// The engine honored a stop request
    Stopped { rounds: u64 },
}

/// Result of a batch or real-time run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Rounds executed by this call
    pub rounds_executed: u64,
    /// Whether the run ended because of a stop request
    pub stopped: bool,
    /// Rounds completed over the engine's lifetime
    pub steps_completed: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_consensus_threshold() -> f64 {
    0.66
}

fn default_min_consensus_quorum() -> usize {
    2
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Real-time tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Approval ratio at or above which a round counts as consensus
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,

    /// Minimum number of approving or rejecting agents for consensus
    #[serde(default = "default_min_consensus_quorum")]
    pub min_consensus_quorum: usize,

    /// Event broadcast channel capacity
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Broadcast every agent's decision after its step
    #[serde(default = "default_true")]
    pub share_decisions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            consensus_threshold: default_consensus_threshold(),
            min_consensus_quorum: default_min_consensus_quorum(),
            event_channel_capacity: default_event_channel_capacity(),
            share_decisions: true,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Set the real-time tick interval
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the consensus threshold and quorum
    pub fn with_consensus(mut self, threshold: f64, quorum: usize) -> Self {
        self.consensus_threshold = threshold;
        self.min_consensus_quorum = quorum;
        self
    }

    /// Enable or disable decision sharing
    pub fn with_share_decisions(mut self, share: bool) -> Self {
        self.share_decisions = share;
        self
    }
}
