//! Simulation configuration file handling
//!
//! Loads and manages the ~/.config/agora/config.yaml file.

use crate::bus::{AgentId, BusConfig};
use crate::engine::EngineConfig;
use crate::swarm::{Role, Strategy};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which secure oracle seals bus traffic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealerKind {
    /// Enclave-style sealing with SHA-256 proofs
    #[default]
    Enclave,
    /// No sealing (tests, local runs)
    Passthrough,
}

/// Which ledger receives agent actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// In-memory ledger accepting the configured chains
    #[default]
    Memory,
    /// No ledger; agents never submit
    None,
}

/// External collaborator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub sealer: SealerKind,

    #[serde(default)]
    pub ledger: LedgerKind,

    /// Chains accepted by the memory ledger; the first one is the default
    #[serde(default = "default_chains")]
    pub chains: Vec<String>,
}

fn default_chains() -> Vec<String> {
    vec!["mainnet".to_string()]
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            sealer: SealerKind::default(),
            ledger: LedgerKind::default(),
            chains: default_chains(),
        }
    }
}

impl OracleConfig {
    /// Chain used by agents that do not name one
    pub fn default_chain(&self) -> Option<&str> {
        self.chains.first().map(String::as_str)
    }
}

/// How the environment evolves between rounds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum EnvironmentConfig {
    /// Only the round counter and timestamp change
    #[default]
    Static,
    /// Seeded random-walk market price
    Market {
        #[serde(default)]
        seed: u64,
        #[serde(default = "default_initial_price")]
        initial_price: f64,
        #[serde(default = "default_volatility")]
        volatility: f64,
    },
}

fn default_initial_price() -> f64 {
    100.0
}

fn default_volatility() -> f64 {
    0.05
}

/// Governance demotion plugin settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Attach the demotion plugin to governance agents
    #[serde(default = "default_true")]
    pub demotion: bool,

    /// Alignment below which a round counts against the agent
    #[serde(default = "default_alignment_threshold")]
    pub alignment_threshold: f64,

    /// Consecutive low-alignment rounds before demotion
    #[serde(default = "default_patience")]
    pub patience: u32,
}

fn default_true() -> bool {
    true
}

fn default_alignment_threshold() -> f64 {
    0.5
}

fn default_patience() -> u32 {
    3
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            demotion: true,
            alignment_threshold: default_alignment_threshold(),
            patience: default_patience(),
        }
    }
}

/// One agent definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: u64,

    pub role: Role,

    /// Scheduling priority (higher runs first)
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub strategy: Strategy,

    /// Swarm this agent belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<String>,

    /// Ledger chain override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

fn default_priority() -> u32 {
    1
}

impl AgentConfig {
    pub fn new(id: u64, role: Role) -> Self {
        Self {
            id,
            role,
            priority: default_priority(),
            strategy: Strategy::default(),
            swarm: None,
            chain: None,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId::new(self.id)
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_swarm(mut self, swarm: impl Into<String>) -> Self {
        self.swarm = Some(swarm.into());
        self
    }

    pub fn with_chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }
}

/// One swarm definition; members come from the agents' `swarm` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub id: String,
}

impl SwarmConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Agora simulation configuration
///
/// Represents the complete ~/.config/agora/config.yaml file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub oracles: OracleConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub governance: GovernanceConfig,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    #[serde(default)]
    pub swarms: Vec<SwarmConfig>,
}

impl SimulationConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// A small runnable simulation: one agent per role in a single swarm
    pub fn sample() -> Self {
        Self::new()
            .with_environment(EnvironmentConfig::Market {
                seed: 42,
                initial_price: default_initial_price(),
                volatility: default_volatility(),
            })
            .with_swarm(SwarmConfig::new("council"))
            .with_agent(
                AgentConfig::new(1, Role::Governance)
                    .with_priority(10)
                    .with_swarm("council"),
            )
            .with_agent(
                AgentConfig::new(2, Role::Validator)
                    .with_priority(5)
                    .with_swarm("council"),
            )
            .with_agent(AgentConfig::new(3, Role::Trader).with_priority(3))
            .with_agent(
                AgentConfig::new(4, Role::Voter)
                    .with_priority(1)
                    .with_strategy(Strategy::FollowHigherTier {
                        fallback: crate::swarm::Decision::Skip,
                    })
                    .with_swarm("council"),
            )
    }

    /// Load configuration from the default path (~/.config/agora/config.yaml)
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::AgoraError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading simulation configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            agents = config.agents.len(),
            swarms = config.swarms.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving simulation configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/agora/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("agora");
        path.push("config.yaml");
        path
    }

    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_oracles(mut self, oracles: OracleConfig) -> Self {
        self.oracles = oracles;
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_governance(mut self, governance: GovernanceConfig) -> Self {
        self.governance = governance;
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_swarm(mut self, swarm: SwarmConfig) -> Self {
        self.swarms.push(swarm);
        self
    }

    /// Get an agent definition by id
    pub fn get_agent(&self, id: u64) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Agent ids belonging to `swarm`, in declaration order
    pub fn swarm_members(&self, swarm: &str) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|a| a.swarm.as_deref() == Some(swarm))
            .map(AgentConfig::agent_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::Decision;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = SimulationConfig::new();
        assert!(config.agents.is_empty());
        assert_eq!(config.bus.agent_message_limit, 1000);
        assert_eq!(config.bus.history_query_limit, 100);
        assert_eq!(config.engine.tick_interval_ms, 1000);
        assert_eq!(config.oracles.default_chain(), Some("mainnet"));
        assert_eq!(config.environment, EnvironmentConfig::Static);
    }

    #[test]
    fn test_sample_swarm_members() {
        let config = SimulationConfig::sample();
        assert_eq!(config.agents.len(), 4);
        assert_eq!(
            config.swarm_members("council"),
            vec![AgentId::new(1), AgentId::new(2), AgentId::new(4)]
        );
        assert!(config.get_agent(3).is_some());
        assert!(config.get_agent(9).is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = SimulationConfig::sample();

        config.save(temp_file.path()).unwrap();
        let loaded = SimulationConfig::load(temp_file.path()).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let result = SimulationConfig::load("/nonexistent/agora/config.yaml");
        assert!(matches!(result, Err(crate::AgoraError::Config(_))));
    }

    #[test]
    fn test_default_path() {
        assert!(SimulationConfig::default_path().ends_with("agora/config.yaml"));
    }

    #[test]
    fn test_minimal_yaml() {
        let yaml = r#"
agents:
  - id: 1
    role: governance
    priority: 10
  - id: 2
    role: voter
    strategy:
      kind: constant
      decision: approve
swarms: []
"#;
        let config: SimulationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[1].priority, 1);
        assert_eq!(
            config.agents[1].strategy,
            Strategy::Constant {
                decision: Decision::Approve
            }
        );
        assert_eq!(config.bus.gossip_fanout, 3);
        assert!(config.governance.demotion);
    }

    #[test]
    fn test_market_environment_yaml() {
        let yaml = "environment:\n  driver: market\n  seed: 7\n";
        let config: SimulationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.environment,
            EnvironmentConfig::Market {
                seed: 7,
                initial_price: 100.0,
                volatility: 0.05,
            }
        );
    }
}
