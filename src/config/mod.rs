//! Configuration system
//!
//! Loads ~/.config/agora/config.yaml with support for:
//! - Bus rate limits and gossip fanout
//! - Engine tick interval and consensus rules
//! - Oracle and ledger selection
//! - Agent and swarm definitions

mod simulation_config;
pub mod validation;

pub use simulation_config::{
    AgentConfig, EnvironmentConfig, GovernanceConfig, LedgerKind, OracleConfig, SealerKind,
    SimulationConfig, SwarmConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
