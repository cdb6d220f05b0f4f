//! Agora - coordination runtime for autonomous agents
//!
//! Agents with typed roles exchange sealed messages over a rate-limited bus,
//! take one decision per round in priority tiers, and are grouped into swarms
//! whose emergent behavior is measured and fed back to their members.
//!
//! # Architecture
//!
//! - **bus**: Message envelope, sliding-window rate limiter, message bus with
//!   broadcast, listeners and gossip
//! - **swarm**: Agents, roles, bounded action history, decision functions,
//!   plugins and the swarm coordinator
//! - **engine**: Environment, priority-tier scheduler, metrics and telemetry,
//!   batch and real-time modes
//! - **context**: Explicit construction of a whole simulation from config
//! - **config**: YAML configuration and validation
//! - **storage**: Versioned agent-state records (JSONL)

pub mod bus;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logging;
pub mod storage;
pub mod swarm;

// Re-exports
pub use context::SimulationContext;
pub use error::{AgoraError, Result};
