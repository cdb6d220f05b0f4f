//! Agent representation and step execution
//!
//! An [`Agent`] owns its [`AgentCore`] (role, priority, state bag, bounded
//! action history) together with the capabilities injected at construction:
//! a decision function, plugins, and optionally a ledger and a secure oracle.
//!
//! Peers are only ever visible as read-only [`AgentSnapshot`]s.

use super::decision::{Decision, DecisionError, DecisionFunction, StepInput};
use super::history::{ActionCategory, ActionHistory, ActionRecord, Outcome, HISTORY_CAPACITY};
use super::plugin::AgentPlugin;
use super::role::{Role, RoleState};
use crate::bus::{AgentId, AgentMessage, MessageKind};
use crate::engine::Environment;
use crate::storage::{AgentRecord, RECORD_VERSION};
use chrono::Utc;
use futures::FutureExt;
use oracles::{Ledger, SecureOracle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Mutable part of an agent, handed to its decision function and plugins
#[derive(Debug, Clone)]
pub struct AgentCore {
    id: AgentId,
    role: RoleState,
    priority: u32,
    state: BTreeMap<String, serde_json::Value>,
    history: ActionHistory,
    last_decision: Option<Decision>,
    decisions_made: u64,
    decision_failures: u64,
    failed_messages: u64,
    messages_received: BTreeMap<MessageKind, u64>,
}

impl AgentCore {
    pub fn new(id: AgentId, role: RoleState, priority: u32) -> Self {
        Self {
            id,
            role,
            priority,
            state: BTreeMap::new(),
            history: ActionHistory::new(HISTORY_CAPACITY),
            last_decision: None,
            decisions_made: 0,
            decision_failures: 0,
            failed_messages: 0,
            messages_received: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role.role()
    }

    pub fn role_state(&self) -> &RoleState {
        &self.role
    }

    pub fn role_state_mut(&mut self) -> &mut RoleState {
        &mut self.role
    }

    /// Replace the role and its state
    pub fn set_role(&mut self, role: RoleState) {
        self.role = role;
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Opaque key/value state owned by the decision function
    pub fn state(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        &mut self.state
    }

    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    /// Append to a category's bounded history
    pub fn record_action(
        &mut self,
        step: u64,
        action: impl Into<String>,
        outcome: Outcome,
        metadata: serde_json::Value,
        category: ActionCategory,
    ) {
        self.history.record(
            category,
            ActionRecord::new(step, action, outcome).with_metadata(metadata),
        );
    }

    /// Past actions of one category, oldest first
    pub fn historical_actions(&self, category: ActionCategory) -> &VecDeque<ActionRecord> {
        self.history.get(category)
    }

    pub fn last_decision(&self) -> Option<&Decision> {
        self.last_decision.as_ref()
    }

    pub(crate) fn note_failed_message(&mut self) {
        self.failed_messages += 1;
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            role: self.role(),
            priority: self.priority,
            last_decision: self.last_decision.clone(),
            history: self.history.clone(),
            messages_received: self.messages_received.clone(),
        }
    }
}

/// Read-only view of an agent taken between phases of a round
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub role: Role,
    pub priority: u32,
    pub last_decision: Option<Decision>,
    pub history: ActionHistory,
    pub messages_received: BTreeMap<MessageKind, u64>,
}

impl AgentSnapshot {
    pub fn historical_actions(&self, category: ActionCategory) -> &VecDeque<ActionRecord> {
        self.history.get(category)
    }

    /// Messages received across all kinds
    pub fn total_received(&self) -> u64 {
        self.messages_received.values().sum()
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.messages_received.get(&kind).copied().unwrap_or(0)
    }
}

/// Snapshots of every agent, as seen by a decision function
#[derive(Debug, Clone, Default)]
pub struct Peers {
    agents: BTreeMap<AgentId, Arc<AgentSnapshot>>,
}

impl Peers {
    pub fn new(snapshots: impl IntoIterator<Item = Arc<AgentSnapshot>>) -> Self {
        Self {
            agents: snapshots.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn get(&self, id: AgentId) -> Option<&Arc<AgentSnapshot>> {
        self.agents.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentSnapshot>> {
        self.agents.values()
    }

    /// Every peer except `id`
    pub fn others(&self, id: AgentId) -> impl Iterator<Item = &Arc<AgentSnapshot>> {
        self.agents.values().filter(move |s| s.id != id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Activity summary of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub id: AgentId,
    pub role: Role,
    pub priority: u32,
    pub history_lengths: BTreeMap<ActionCategory, usize>,
    pub decisions_made: u64,
    pub decision_failures: u64,
    pub failed_messages: u64,
    pub messages_received: BTreeMap<MessageKind, u64>,
    pub last_decision: Option<Decision>,
}

/// Result of one [`Agent::step`]
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub agent: AgentId,
    pub round: u64,
    pub decision: Decision,
    pub outcome: Outcome,
    /// Messages available to the decision function
    pub inbox_len: usize,
    pub latency: Duration,
    /// Set when the decision function failed or panicked
    pub error: Option<String>,
    /// Ledger transaction hash, when the decision was submitted
    pub tx_hash: Option<String>,
}

impl StepReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone)]
struct LedgerBinding {
    ledger: Arc<dyn Ledger>,
    chain: String,
}

/// An autonomous agent
pub struct Agent {
    core: AgentCore,
    inbox: Vec<AgentMessage>,
    decision_fn: Arc<dyn DecisionFunction>,
    plugins: Vec<Arc<dyn AgentPlugin>>,
    ledger: Option<LedgerBinding>,
    oracle: Option<Arc<dyn SecureOracle>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("core", &self.core)
            .field("inbox", &self.inbox.len())
            .field("decision_fn", &self.decision_fn.name())
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

impl Agent {
    /// Create an agent
    pub fn new(
        id: AgentId,
        role: impl Into<RoleState>,
        priority: u32,
        decision_fn: Arc<dyn DecisionFunction>,
    ) -> Self {
        Self::from_core(AgentCore::new(id, role.into(), priority), decision_fn)
    }

    fn from_core(core: AgentCore, decision_fn: Arc<dyn DecisionFunction>) -> Self {
        Self {
            core,
            inbox: Vec::new(),
            decision_fn,
            plugins: Vec::new(),
            ledger: None,
            oracle: None,
        }
    }

    /// Add a plugin; hooks run in the order plugins were added
    pub fn with_plugin(mut self, plugin: Arc<dyn AgentPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Submit actionable decisions to `ledger` on `chain`
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>, chain: impl Into<String>) -> Self {
        self.ledger = Some(LedgerBinding {
            ledger,
            chain: chain.into(),
        });
        self
    }

    /// Attach proofs from `oracle` to ledger submissions
    pub fn with_oracle(mut self, oracle: Arc<dyn SecureOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn id(&self) -> AgentId {
        self.core.id
    }

    pub fn role(&self) -> Role {
        self.core.role()
    }

    pub fn priority(&self) -> u32 {
        self.core.priority
    }

    pub fn core(&self) -> &AgentCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut AgentCore {
        &mut self.core
    }

    pub fn decision_function(&self) -> &Arc<dyn DecisionFunction> {
        &self.decision_fn
    }

    pub fn record_action(
        &mut self,
        step: u64,
        action: impl Into<String>,
        outcome: Outcome,
        metadata: serde_json::Value,
        category: ActionCategory,
    ) {
        self.core
            .record_action(step, action, outcome, metadata, category);
    }

    pub fn historical_actions(&self, category: ActionCategory) -> &VecDeque<ActionRecord> {
        self.core.historical_actions(category)
    }

    /// Messages waiting for the next step
    pub fn inbox(&self) -> &[AgentMessage] {
        &self.inbox
    }

    /// Hand received messages to the agent
    pub fn deliver(&mut self, messages: Vec<AgentMessage>) {
        for message in messages {
            *self
                .core
                .messages_received
                .entry(message.kind)
                .or_insert(0) += 1;

            for plugin in &self.plugins {
                guarded(self.core.id, plugin.name(), "on_message", || {
                    plugin.on_message(&mut self.core, &message)
                });
            }
            self.inbox.push(message);
        }
    }

    pub(crate) fn note_failed_message(&mut self) {
        self.core.note_failed_message();
    }

    /// Read-only view for peers and swarms
    pub fn snapshot(&self) -> AgentSnapshot {
        self.core.snapshot()
    }

    /// Run one decision cycle
    ///
    /// Consumes the inbox, calls the decision function and records the
    /// result. A failing or panicking decision function yields a skipped
    /// decision with a `Failure` outcome; it never propagates.
    pub async fn step(&mut self, environment: &Environment, peers: &Peers) -> StepReport {
        let started = Instant::now();
        let round = environment.round();
        let agent_id = self.core.id;
        let role_before = self.core.role();
        let inbox = std::mem::take(&mut self.inbox);
        let decision_fn = self.decision_fn.clone();

        for plugin in &self.plugins {
            guarded(agent_id, plugin.name(), "on_step", || {
                plugin.on_step(&mut self.core, environment)
            });
        }

        let input = StepInput {
            environment,
            peers,
            inbox: &inbox,
        };

        let result = AssertUnwindSafe(decision_fn.decide(&mut self.core, &input))
            .catch_unwind()
            .await;

        let (decision, outcome, error) = match result {
            Ok(Ok(decision)) => {
                self.core.decisions_made += 1;
                let outcome = if decision == Decision::Skip {
                    Outcome::Skipped
                } else {
                    Outcome::Success
                };
                (decision, outcome, None)
            }
            Ok(Err(e)) => (Decision::Skip, Outcome::Failure, Some(e)),
            Err(panic) => (
                Decision::Skip,
                Outcome::Failure,
                Some(DecisionError::Panicked(panic_message(panic.as_ref()))),
            ),
        };

        if let Some(e) = &error {
            self.core.decision_failures += 1;
            warn!(
                agent_id = %agent_id,
                round,
                strategy = decision_fn.name(),
                error = %e,
                "Decision failed, agent skips this round"
            );
        }

        self.core.record_action(
            round,
            decision.as_action(),
            outcome,
            json!({
                "strategy": decision_fn.name(),
                "inbox": inbox.len(),
                "error": error.as_ref().map(ToString::to_string),
            }),
            ActionCategory::Decision,
        );
        self.core.last_decision = Some(decision.clone());

        for plugin in &self.plugins {
            guarded(agent_id, plugin.name(), "on_decision", || {
                plugin.on_decision(&mut self.core, &decision, &input)
            });
        }

        let role_after = self.core.role();
        if role_after != role_before {
            self.core.record_action(
                round,
                format!("role:{}", role_after),
                Outcome::Success,
                json!({ "from": role_before, "to": role_after }),
                ActionCategory::Governance,
            );
        }

        let tx_hash = if error.is_none() && decision.is_actionable() {
            self.submit_to_ledger(round, &decision).await
        } else {
            None
        };

        StepReport {
            agent: agent_id,
            round,
            decision,
            outcome,
            inbox_len: inbox.len(),
            latency: started.elapsed(),
            error: error.map(|e| e.to_string()),
            tx_hash,
        }
    }

    async fn submit_to_ledger(&mut self, round: u64, decision: &Decision) -> Option<String> {
        let binding = self.ledger.clone()?;
        let action = decision.as_action().to_string();

        let proof = match &self.oracle {
            Some(oracle) => match AssertUnwindSafe(oracle.prove(&action)).catch_unwind().await {
                Ok(Ok(proof)) => proof,
                Ok(Err(e)) => {
                    debug!(agent_id = %self.core.id, error = %e, "Proof failed, using raw action");
                    action.clone()
                }
                Err(panic) => {
                    warn!(
                        agent_id = %self.core.id,
                        oracle = oracle.name(),
                        panic = %panic_message(panic.as_ref()),
                        "Oracle panicked while proving, using raw action"
                    );
                    action.clone()
                }
            },
            None => action.clone(),
        };

        // A panicking ledger counts as a failed submission
        let tx_hash = match AssertUnwindSafe(binding.ledger.submit(&action, &binding.chain))
            .catch_unwind()
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(panic) => {
                warn!(
                    agent_id = %self.core.id,
                    round,
                    ledger = binding.ledger.name(),
                    panic = %panic_message(panic.as_ref()),
                    "Ledger panicked during submission"
                );
                oracles::FAILED_TX_HASH.to_string()
            }
        };
        let outcome = if oracles::is_failed_tx(&tx_hash) {
            warn!(
                agent_id = %self.core.id,
                round,
                ledger = binding.ledger.name(),
                chain = %binding.chain,
                "Ledger rejected submission"
            );
            Outcome::Failure
        } else {
            Outcome::Success
        };

        self.core.record_action(
            round,
            action,
            outcome,
            json!({ "chain": binding.chain, "tx": tx_hash, "proof": proof }),
            ActionCategory::Ledger,
        );

        Some(tx_hash)
    }

    /// Activity summary
    pub fn stats(&self) -> AgentStats {
        AgentStats {
            id: self.core.id,
            role: self.core.role(),
            priority: self.core.priority,
            history_lengths: self.core.history.counts(),
            decisions_made: self.core.decisions_made,
            decision_failures: self.core.decision_failures,
            failed_messages: self.core.failed_messages,
            messages_received: self.core.messages_received.clone(),
            last_decision: self.core.last_decision.clone(),
        }
    }

    /// Persistable state of this agent
    pub fn to_record(&self) -> AgentRecord {
        AgentRecord {
            version: RECORD_VERSION,
            id: self.core.id,
            role_state: self.core.role.clone(),
            priority: self.core.priority,
            state: self.core.state.clone(),
            history: self.core.history.to_map(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild an agent from a persisted record
    pub fn from_record(record: AgentRecord, decision_fn: Arc<dyn DecisionFunction>) -> Self {
        Self::from_core(core_from_record(record), decision_fn)
    }

    /// Replace role, priority, state and history with a persisted record
    ///
    /// Capabilities (decision function, plugins, ledger) are kept.
    pub fn restore(&mut self, record: AgentRecord) {
        self.core = core_from_record(record);
        self.inbox.clear();
    }
}

fn core_from_record(record: AgentRecord) -> AgentCore {
    let mut core = AgentCore::new(record.id, record.role_state, record.priority);
    core.state = record.state;
    core.history = ActionHistory::from_map(HISTORY_CAPACITY, record.history);
    core.last_decision = core
        .history
        .latest(ActionCategory::Decision)
        .map(|r| Decision::from_action(&r.action));
    core
}

/// Run a plugin hook, containing panics
fn guarded(agent_id: AgentId, plugin: &str, hook: &str, f: impl FnOnce()) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(f)) {
        warn!(
            agent_id = %agent_id,
            plugin,
            hook,
            panic = %panic_message(panic.as_ref()),
            "Plugin hook panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::decision::{ConstantDecision, Scripted};
    use async_trait::async_trait;
    use oracles::{EnclaveOracle, MemoryLedger, NullLedger};

    struct Failing;

    #[async_trait]
    impl DecisionFunction for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn decide(
            &self,
            _agent: &mut AgentCore,
            _input: &StepInput<'_>,
        ) -> Result<Decision, DecisionError> {
            Err(DecisionError::Failed("model unavailable".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl DecisionFunction for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn decide(
            &self,
            _agent: &mut AgentCore,
            _input: &StepInput<'_>,
        ) -> Result<Decision, DecisionError> {
            panic!("decision exploded")
        }
    }

    struct Exploding;

    impl AgentPlugin for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn on_step(&self, _agent: &mut AgentCore, _environment: &Environment) {
            panic!("plugin exploded")
        }
    }

    struct CrashingLedger;

    #[async_trait]
    impl Ledger for CrashingLedger {
        fn name(&self) -> &str {
            "crashing"
        }

        async fn submit(&self, _action: &str, _chain: &str) -> String {
            panic!("ledger rpc crashed")
        }
    }

    struct CrashingOracle;

    #[async_trait]
    impl SecureOracle for CrashingOracle {
        fn name(&self) -> &str {
            "crashing"
        }

        async fn seal(&self, plaintext: &str) -> oracles::Result<String> {
            Ok(plaintext.to_string())
        }

        async fn prove(&self, _data: &str) -> oracles::Result<String> {
            panic!("enclave crashed")
        }
    }

    fn env_at(round: u64) -> Environment {
        let mut env = Environment::new();
        for _ in 0..round {
            env.advance(env.timestamp());
        }
        env
    }

    fn agent(decision_fn: Arc<dyn DecisionFunction>) -> Agent {
        Agent::new(AgentId::new(1), Role::Voter, 1, decision_fn)
    }

    #[tokio::test]
    async fn test_step_records_decision() {
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Approve)));
        let report = agent.step(&env_at(1), &Peers::default()).await;

        assert_eq!(report.decision, Decision::Approve);
        assert_eq!(report.outcome, Outcome::Success);
        assert!(!report.failed());

        let latest = agent.core().history().latest(ActionCategory::Decision).unwrap();
        assert_eq!(latest.step, 1);
        assert_eq!(latest.action, "approve");
        assert_eq!(agent.stats().decisions_made, 1);
        assert_eq!(agent.core().last_decision(), Some(&Decision::Approve));
    }

    #[tokio::test]
    async fn test_decision_failure_becomes_skip() {
        let mut agent = agent(Arc::new(Failing));
        let report = agent.step(&env_at(1), &Peers::default()).await;

        assert_eq!(report.decision, Decision::Skip);
        assert_eq!(report.outcome, Outcome::Failure);
        assert!(report.error.as_deref().unwrap().contains("model unavailable"));
        assert_eq!(agent.stats().decision_failures, 1);
        assert_eq!(agent.stats().decisions_made, 0);
    }

    #[tokio::test]
    async fn test_panicking_decision_is_contained() {
        let mut agent = agent(Arc::new(Panicking));
        let report = agent.step(&env_at(1), &Peers::default()).await;

        assert_eq!(report.outcome, Outcome::Failure);
        assert!(report.error.unwrap().contains("decision exploded"));
    }

    #[tokio::test]
    async fn test_panicking_plugin_is_contained() {
        let mut agent =
            agent(Arc::new(ConstantDecision(Decision::Approve))).with_plugin(Arc::new(Exploding));
        let report = agent.step(&env_at(1), &Peers::default()).await;
        assert_eq!(report.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_deliver_fills_inbox_and_counters() {
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Skip)));
        agent.deliver(vec![
            AgentMessage::broadcast(MessageKind::Alert, AgentId::SYSTEM, json!(null)),
            AgentMessage::broadcast(MessageKind::SwarmFeedback, AgentId::SYSTEM, json!(null)),
            AgentMessage::broadcast(MessageKind::SwarmFeedback, AgentId::SYSTEM, json!(null)),
        ]);

        assert_eq!(agent.inbox().len(), 3);
        let snapshot = agent.snapshot();
        assert_eq!(snapshot.received(MessageKind::SwarmFeedback), 2);
        assert_eq!(snapshot.total_received(), 3);

        let report = agent.step(&env_at(1), &Peers::default()).await;
        assert_eq!(report.inbox_len, 3);
        assert_eq!(report.outcome, Outcome::Skipped);
        assert!(agent.inbox().is_empty());
    }

    #[tokio::test]
    async fn test_history_capacity_holds_over_many_steps() {
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Approve)));
        let peers = Peers::default();
        let mut env = Environment::new();

        for _ in 0..150 {
            env.advance(env.timestamp());
            agent.step(&env, &peers).await;
        }

        let decisions = agent.historical_actions(ActionCategory::Decision);
        assert_eq!(decisions.len(), HISTORY_CAPACITY);
        assert_eq!(decisions.front().unwrap().step, 51);
    }

    #[tokio::test]
    async fn test_ledger_submission_with_proof() {
        let ledger = Arc::new(MemoryLedger::new(["mainnet"]));
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Approve)))
            .with_ledger(ledger.clone(), "mainnet")
            .with_oracle(Arc::new(EnclaveOracle::new()));

        let report = agent.step(&env_at(1), &Peers::default()).await;
        let tx = report.tx_hash.unwrap();
        assert!(!oracles::is_failed_tx(&tx));
        assert_eq!(ledger.len().await, 1);

        let record = agent.core().history().latest(ActionCategory::Ledger).unwrap();
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.metadata["tx"], json!(tx));
        assert_eq!(record.metadata["proof"].as_str().map(str::len), Some(64));
    }

    #[tokio::test]
    async fn test_failed_ledger_sentinel_is_failure_outcome() {
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Approve)))
            .with_ledger(Arc::new(NullLedger), "mainnet");

        let report = agent.step(&env_at(1), &Peers::default()).await;
        assert_eq!(report.tx_hash.as_deref(), Some(oracles::FAILED_TX_HASH));
        // The decision itself still succeeded
        assert_eq!(report.outcome, Outcome::Success);

        let record = agent.core().history().latest(ActionCategory::Ledger).unwrap();
        assert_eq!(record.outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn test_panicking_ledger_is_failed_submission() {
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Approve)))
            .with_ledger(Arc::new(CrashingLedger), "mainnet");

        let report = agent.step(&env_at(1), &Peers::default()).await;
        assert_eq!(report.decision, Decision::Approve);
        assert_eq!(report.tx_hash.as_deref(), Some(oracles::FAILED_TX_HASH));

        let record = agent.core().history().latest(ActionCategory::Ledger).unwrap();
        assert_eq!(record.outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn test_panicking_proof_falls_back_to_raw_action() {
        let ledger = Arc::new(MemoryLedger::new(["mainnet"]));
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Approve)))
            .with_ledger(ledger.clone(), "mainnet")
            .with_oracle(Arc::new(CrashingOracle));

        let report = agent.step(&env_at(1), &Peers::default()).await;
        assert!(!oracles::is_failed_tx(report.tx_hash.as_deref().unwrap()));

        let record = agent.core().history().latest(ActionCategory::Ledger).unwrap();
        assert_eq!(record.metadata["proof"], json!("approve"));
    }

    #[tokio::test]
    async fn test_rejections_are_not_submitted() {
        let ledger = Arc::new(MemoryLedger::new(["mainnet"]));
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Reject)))
            .with_ledger(ledger.clone(), "mainnet");

        let report = agent.step(&env_at(1), &Peers::default()).await;
        assert!(report.tx_hash.is_none());
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_record_round_trip_keeps_history() {
        let mut agent = Agent::new(
            AgentId::new(4),
            Role::Governance,
            10,
            Arc::new(Scripted::new(vec![Decision::Approve, Decision::Reject])),
        );
        agent
            .core_mut()
            .state_mut()
            .insert("mood".to_string(), json!("calm"));
        agent.step(&env_at(1), &Peers::default()).await;
        agent.step(&env_at(2), &Peers::default()).await;

        let record = agent.to_record();
        assert_eq!(record.version, RECORD_VERSION);

        let restored = Agent::from_record(record, Arc::new(ConstantDecision(Decision::Skip)));
        assert_eq!(restored.id(), AgentId::new(4));
        assert_eq!(restored.role(), Role::Governance);
        assert_eq!(restored.priority(), 10);
        assert_eq!(restored.core().state()["mood"], json!("calm"));
        assert_eq!(restored.historical_actions(ActionCategory::Decision).len(), 2);
        assert_eq!(restored.core().last_decision(), Some(&Decision::Reject));
    }

    #[tokio::test]
    async fn test_restored_tag_is_not_mistaken_for_builtin() {
        let mut agent = agent(Arc::new(ConstantDecision(Decision::Tag("approve".into()))));
        agent.step(&env_at(1), &Peers::default()).await;

        let restored = Agent::from_record(
            agent.to_record(),
            Arc::new(ConstantDecision(Decision::Skip)),
        );
        let last = restored.core().last_decision().unwrap();
        assert_eq!(last, &Decision::Tag("approve".into()));
        assert!(!last.signals_agreement());
    }

    #[test]
    fn test_peers_view() {
        let a = Agent::new(AgentId::new(1), Role::Voter, 1, Arc::new(ConstantDecision(Decision::Skip)));
        let b = Agent::new(
            AgentId::new(2),
            Role::Governance,
            9,
            Arc::new(ConstantDecision(Decision::Skip)),
        );
        let peers = Peers::new([Arc::new(a.snapshot()), Arc::new(b.snapshot())]);

        assert_eq!(peers.len(), 2);
        assert_eq!(peers.get(AgentId::new(2)).unwrap().role, Role::Governance);
        let others: Vec<_> = peers.others(AgentId::new(1)).map(|s| s.id).collect();
        assert_eq!(others, vec![AgentId::new(2)]);
    }
}
