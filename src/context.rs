//! Simulation context
//!
//! Wires a [`SimulationConfig`] into a running object graph: the secure
//! oracle, the ledger, the message bus, the engine and its agents and swarms.
//! Everything is constructed explicitly and owned by the context, so several
//! simulations can coexist in one process.

use crate::bus::MessageBus;
use crate::config::{
    validate_config_result, AgentConfig, EnvironmentConfig, LedgerKind, SealerKind,
    SimulationConfig,
};
use crate::engine::{Engine, EnvironmentDriver, MarketDriver, StaticDriver};
use crate::storage::StateStore;
use crate::swarm::{Agent, GovernanceDemotion, Role, Swarm};
use crate::Result;
use oracles::{EnclaveOracle, Ledger, MemoryLedger, PassthroughOracle, SecureOracle};
use std::sync::Arc;

/// Fully wired simulation
pub struct SimulationContext {
    config: SimulationConfig,
    oracle: Arc<dyn SecureOracle>,
    ledger: Option<Arc<dyn Ledger>>,
    bus: Arc<MessageBus>,
    engine: Engine,
}

impl std::fmt::Debug for SimulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationContext")
            .field("oracle", &self.oracle.name())
            .field("ledger", &self.ledger.as_ref().map(|l| l.name().to_string()))
            .field("agents", &self.engine.agent_count())
            .field("swarms", &self.engine.swarms().len())
            .finish()
    }
}

impl SimulationContext {
    /// Validate `config` and build the simulation it describes
    pub async fn from_config(config: SimulationConfig) -> Result<Self> {
        validate_config_result(&config)?;

        let oracle: Arc<dyn SecureOracle> = match config.oracles.sealer {
            SealerKind::Enclave => Arc::new(EnclaveOracle::new()),
            SealerKind::Passthrough => Arc::new(PassthroughOracle),
        };
        let ledger: Option<Arc<dyn Ledger>> = match config.oracles.ledger {
            LedgerKind::Memory => Some(
                Arc::new(MemoryLedger::new(config.oracles.chains.iter().cloned())) as Arc<dyn Ledger>,
            ),
            LedgerKind::None => None,
        };

        let bus = Arc::new(MessageBus::new(config.bus.clone(), oracle.clone()));
        let mut engine = Engine::new(config.engine.clone(), bus.clone())?
            .with_driver(build_driver(&config.environment));

        for definition in &config.agents {
            let agent = build_agent(&config, definition, &oracle, ledger.as_ref());
            engine.add_agent(agent).await?;
        }
        for swarm in &config.swarms {
            engine.add_swarm(Swarm::new(swarm.id.clone(), config.swarm_members(&swarm.id)))?;
        }

        tracing::info!(
            agents = config.agents.len(),
            swarms = config.swarms.len(),
            sealer = oracle.name(),
            "Simulation context built"
        );

        Ok(Self {
            config,
            oracle,
            ledger,
            bus,
            engine,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn oracle(&self) -> &Arc<dyn SecureOracle> {
        &self.oracle
    }

    pub fn ledger(&self) -> Option<&Arc<dyn Ledger>> {
        self.ledger.as_ref()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Save every agent's state to `store`
    pub fn save_state(&self, store: &impl StateStore) -> Result<usize> {
        let records = self.engine.snapshot_records();
        store.save_all(&records)?;
        Ok(records.len())
    }

    /// Restore agent state from `store`; returns the number of agents restored
    pub fn load_state(&mut self, store: &impl StateStore) -> Result<usize> {
        let records = store.load_all()?;
        Ok(self.engine.restore_records(records)?)
    }
}

fn build_driver(environment: &EnvironmentConfig) -> Box<dyn EnvironmentDriver> {
    match *environment {
        EnvironmentConfig::Static => Box::new(StaticDriver),
        EnvironmentConfig::Market {
            seed,
            initial_price,
            volatility,
        } => Box::new(
            MarketDriver::new(seed)
                .with_price(initial_price)
                .with_volatility(volatility),
        ),
    }
}

fn build_agent(
    config: &SimulationConfig,
    definition: &AgentConfig,
    oracle: &Arc<dyn SecureOracle>,
    ledger: Option<&Arc<dyn Ledger>>,
) -> Agent {
    let id = definition.agent_id();
    let mut agent = Agent::new(
        id,
        definition.role,
        definition.priority,
        definition.strategy.build(id),
    )
    .with_oracle(oracle.clone());

    if let Some(ledger) = ledger {
        let chain = definition
            .chain
            .as_deref()
            .or_else(|| config.oracles.default_chain());
        if let Some(chain) = chain {
            agent = agent.with_ledger(ledger.clone(), chain);
        }
    }

    if definition.role == Role::Governance && config.governance.demotion {
        agent = agent.with_plugin(Arc::new(GovernanceDemotion::new(
            config.governance.alignment_threshold,
            config.governance.patience,
        )));
    }

    agent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, SwarmConfig};
    use crate::storage::JsonlStore;
    use crate::swarm::{Decision, Strategy};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sample_context() {
        let context = SimulationContext::from_config(SimulationConfig::sample())
            .await
            .unwrap();

        assert_eq!(context.engine().agent_count(), 4);
        assert_eq!(context.engine().swarms().len(), 1);
        assert_eq!(context.oracle().name(), "enclave");
        assert_eq!(context.ledger().map(|l| l.name()), Some("memory"));
        assert_eq!(context.bus().receivers().await.len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = SimulationContext::from_config(SimulationConfig::new()).await;
        assert!(matches!(result, Err(crate::AgoraError::Config(_))));
    }

    #[tokio::test]
    async fn test_without_ledger() {
        let mut config = SimulationConfig::new()
            .with_agent(AgentConfig::new(1, Role::Voter).with_strategy(Strategy::Constant {
                decision: Decision::Approve,
            }));
        config.oracles.ledger = LedgerKind::None;
        config.oracles.sealer = SealerKind::Passthrough;

        let mut context = SimulationContext::from_config(config).await.unwrap();
        assert!(context.ledger().is_none());

        let summary = context.engine_mut().run(2).await.unwrap();
        assert_eq!(summary.rounds_executed, 2);
    }

    #[tokio::test]
    async fn test_save_and_load_state() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::new(dir.path().join("agents.jsonl"));
        let config = SimulationConfig::new()
            .with_swarm(SwarmConfig::new("pair"))
            .with_agent(AgentConfig::new(1, Role::Validator).with_swarm("pair"))
            .with_agent(AgentConfig::new(2, Role::Voter).with_swarm("pair"));

        let mut context = SimulationContext::from_config(config.clone()).await.unwrap();
        context.engine_mut().run(3).await.unwrap();
        assert_eq!(context.save_state(&store).unwrap(), 2);

        let mut fresh = SimulationContext::from_config(config).await.unwrap();
        assert_eq!(fresh.load_state(&store).unwrap(), 2);

        let before = context.engine().snapshot_records();
        let after = fresh.engine().snapshot_records();
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.history, b.history);
        }
    }
}
