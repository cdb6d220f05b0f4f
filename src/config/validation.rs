//! Configuration validation
//!
//! Validates a simulation configuration for correctness:
//! - Agent ids are unique and not reserved
//! - Swarm references resolve and no swarm is empty
//! - Limits, windows and fanout are non-zero
//! - Consensus threshold lies in (0, 1]

use super::simulation_config::{EnvironmentConfig, LedgerKind, SimulationConfig};
use crate::AgoraError;
use std::collections::HashSet;

/// Highest accepted agent priority
pub const MAX_AGENT_PRIORITY: u32 = 1000;

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub context: Option<String>,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: None,
            field: field.into(),
            message: message.into(),
        }
    }

    fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref ctx) = self.context {
            write!(f, "[{}] {}: {}", ctx, self.field, self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a simulation configuration, reporting every problem found
pub fn validate_config(config: &SimulationConfig) -> ValidationResult {
    let mut errors = Vec::new();

    validate_bus(config, &mut errors);
    validate_engine(config, &mut errors);
    validate_oracles(config, &mut errors);
    validate_environment(config, &mut errors);

    if config.agents.is_empty() {
        errors.push(ValidationError::new(
            "agents",
            "At least one agent must be defined",
        ));
    }

    let swarm_ids: HashSet<&str> = config.swarms.iter().map(|s| s.id.as_str()).collect();

    let mut seen_ids = HashSet::new();
    for agent in &config.agents {
        let context = format!("agent {}", agent.id);

        if agent.id == 0 {
            errors.push(
                ValidationError::new("id", "Agent id 0 is reserved for the system")
                    .with_context(&context),
            );
        }
        if !seen_ids.insert(agent.id) {
            errors.push(ValidationError::new(
                "agents",
                format!("Duplicate agent id: {}", agent.id),
            ));
        }
        if agent.priority > MAX_AGENT_PRIORITY {
            errors.push(
                ValidationError::new(
                    "priority",
                    format!(
                        "Priority {} exceeds the maximum of {}",
                        agent.priority, MAX_AGENT_PRIORITY
                    ),
                )
                .with_context(&context),
            );
        }
        if let Some(ref swarm) = agent.swarm {
            if !swarm_ids.contains(swarm.as_str()) {
                errors.push(
                    ValidationError::new("swarm", format!("Unknown swarm: {}", swarm))
                        .with_context(&context),
                );
            }
        }
        if let Some(ref chain) = agent.chain {
            if config.oracles.ledger == LedgerKind::Memory && !config.oracles.chains.contains(chain)
            {
                errors.push(
                    ValidationError::new(
                        "chain",
                        format!("Chain '{}' is not in oracles.chains", chain),
                    )
                    .with_context(&context),
                );
            }
        }
        if let crate::swarm::Strategy::Random {
            approve_probability,
            ..
        } = agent.strategy
        {
            if !(0.0..=1.0).contains(&approve_probability) {
                errors.push(
                    ValidationError::new(
                        "strategy.approve_probability",
                        "Probability must lie in [0, 1]",
                    )
                    .with_context(&context),
                );
            }
        }
    }

    let mut seen_swarms = HashSet::new();
    for swarm in &config.swarms {
        if swarm.id.is_empty() {
            errors.push(ValidationError::new("swarms", "Swarm id cannot be empty"));
            continue;
        }
        if !seen_swarms.insert(swarm.id.as_str()) {
            errors.push(ValidationError::new(
                "swarms",
                format!("Duplicate swarm id: {}", swarm.id),
            ));
        }
        if config.swarm_members(&swarm.id).is_empty() {
            errors.push(
                ValidationError::new("members", "Swarm has no member agents")
                    .with_context(format!("swarm {}", swarm.id)),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_bus(config: &SimulationConfig, errors: &mut Vec<ValidationError>) {
    let bus = &config.bus;
    let checks = [
        ("bus.agent_message_limit", bus.agent_message_limit as u64),
        ("bus.agent_message_window_ms", bus.agent_message_window_ms),
        ("bus.history_query_limit", bus.history_query_limit as u64),
        ("bus.history_query_window_ms", bus.history_query_window_ms),
        ("bus.gossip_fanout", bus.gossip_fanout as u64),
    ];
    for (field, value) in checks {
        if value == 0 {
            errors.push(ValidationError::new(field, "Must be greater than 0"));
        }
    }
}

fn validate_engine(config: &SimulationConfig, errors: &mut Vec<ValidationError>) {
    let engine = &config.engine;
    if engine.tick_interval_ms == 0 {
        errors.push(ValidationError::new(
            "engine.tick_interval_ms",
            "Must be greater than 0",
        ));
    }
    if !(engine.consensus_threshold > 0.0 && engine.consensus_threshold <= 1.0) {
        errors.push(ValidationError::new(
            "engine.consensus_threshold",
            format!(
                "Threshold {} must lie in (0, 1]",
                engine.consensus_threshold
            ),
        ));
    }
    if engine.event_channel_capacity == 0 {
        errors.push(ValidationError::new(
            "engine.event_channel_capacity",
            "Must be greater than 0",
        ));
    }
}

fn validate_oracles(config: &SimulationConfig, errors: &mut Vec<ValidationError>) {
    if config.oracles.ledger == LedgerKind::Memory && config.oracles.chains.is_empty() {
        errors.push(ValidationError::new(
            "oracles.chains",
            "The memory ledger needs at least one chain",
        ));
    }
    if config.oracles.chains.iter().any(String::is_empty) {
        errors.push(ValidationError::new(
            "oracles.chains",
            "Chain names cannot be empty",
        ));
    }
}

fn validate_environment(config: &SimulationConfig, errors: &mut Vec<ValidationError>) {
    if let EnvironmentConfig::Market {
        initial_price,
        volatility,
        ..
    } = config.environment
    {
        if !(initial_price.is_finite() && initial_price > 0.0) {
            errors.push(ValidationError::new(
                "environment.initial_price",
                "Price must be positive",
            ));
        }
        if !(0.0..1.0).contains(&volatility) {
            errors.push(ValidationError::new(
                "environment.volatility",
                "Volatility must lie in [0, 1)",
            ));
        }
    }
}

/// Validate configuration and return a Result
pub fn validate_config_result(config: &SimulationConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        AgoraError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, SwarmConfig};
    use crate::swarm::{Role, Strategy};

    fn has_error(errors: &[ValidationError], needle: &str) -> bool {
        errors.iter().any(|e| e.to_string().contains(needle))
    }

    #[test]
    fn test_sample_is_valid() {
        assert!(validate_config(&SimulationConfig::sample()).is_ok());
    }

    #[test]
    fn test_empty_agents() {
        let errors = validate_config(&SimulationConfig::new()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("At least one agent"));
    }

    #[test]
    fn test_reserved_and_duplicate_ids() {
        let config = SimulationConfig::new()
            .with_agent(AgentConfig::new(0, Role::Voter))
            .with_agent(AgentConfig::new(2, Role::Voter))
            .with_agent(AgentConfig::new(2, Role::Trader));

        let errors = validate_config(&config).unwrap_err();
        assert!(has_error(&errors, "reserved"));
        assert!(has_error(&errors, "Duplicate agent id: 2"));
    }

    #[test]
    fn test_unknown_and_empty_swarms() {
        let config = SimulationConfig::new()
            .with_swarm(SwarmConfig::new("empty"))
            .with_agent(AgentConfig::new(1, Role::Voter).with_swarm("missing"));

        let errors = validate_config(&config).unwrap_err();
        assert!(has_error(&errors, "[agent 1] swarm: Unknown swarm: missing"));
        assert!(has_error(&errors, "[swarm empty] members"));
    }

    #[test]
    fn test_reports_all_errors_at_once() {
        let mut config = SimulationConfig::new().with_agent(
            AgentConfig::new(1, Role::Voter).with_priority(MAX_AGENT_PRIORITY + 1),
        );
        config.bus.gossip_fanout = 0;
        config.bus.agent_message_window_ms = 0;
        config.engine.consensus_threshold = 1.5;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(has_error(&errors, "bus.gossip_fanout"));
        assert!(has_error(&errors, "bus.agent_message_window_ms"));
        assert!(has_error(&errors, "engine.consensus_threshold"));
        assert!(has_error(&errors, "priority"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = SimulationConfig::sample();
        config.engine.consensus_threshold = 0.0;
        assert!(validate_config(&config).is_err());

        config.engine.consensus_threshold = 1.0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_chain_must_be_known() {
        let config = SimulationConfig::new()
            .with_agent(AgentConfig::new(1, Role::Trader).with_chain("testnet"));
        let errors = validate_config(&config).unwrap_err();
        assert!(has_error(&errors, "testnet"));
    }

    #[test]
    fn test_random_probability_range() {
        let config = SimulationConfig::new().with_agent(
            AgentConfig::new(1, Role::Voter).with_strategy(Strategy::Random {
                seed: 1,
                approve_probability: 1.5,
            }),
        );
        let errors = validate_config(&config).unwrap_err();
        assert!(has_error(&errors, "approve_probability"));
    }

    #[test]
    fn test_validate_config_result_message() {
        let err = validate_config_result(&SimulationConfig::new()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Configuration validation failed"));
        assert!(message.contains("agents"));
    }
}
