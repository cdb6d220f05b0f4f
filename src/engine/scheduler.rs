//! Engine implementation
//!
//! Owns agents, swarms, the environment and the metrics. Runs rounds either
//! as a fixed-size batch ([`Engine::run`]) or on a timer
//! ([`Engine::start_real_time_simulation`]) until stopped.

use super::environment::{Environment, EnvironmentDriver, StaticDriver};
use super::handle::EngineHandle;
use super::metrics::{EngineMetrics, EngineTelemetry};
use super::{EngineConfig, EngineError, EngineEvent, EngineState, Result, RunSummary};
use crate::bus::{AgentId, AgentMessage, MessageBus, MessageKind};
use crate::storage::AgentRecord;
use crate::swarm::{
    ActionCategory, Agent, AgentSnapshot, CoordinationReport, DecisionShare, Outcome, Peers,
    Role, StepReport, Swarm,
};
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Pick the round's leader
///
/// Highest-priority governance agent, ties broken by lowest id. Without a
/// governance agent the same rule applies to every agent.
pub fn elect_leader<'a>(agents: impl Iterator<Item = &'a Agent> + Clone) -> Option<AgentId> {
    let best = |governance_only: bool| {
        agents
            .clone()
            .filter(|a| !governance_only || a.role() == Role::Governance)
            .max_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then_with(|| b.id().cmp(&a.id()))
            })
            .map(Agent::id)
    };
    best(true).or_else(|| best(false))
}

/// What a round produced, applied to the metrics at the very end
struct RoundOutcome {
    reports: Vec<StepReport>,
    swarms: Vec<CoordinationReport>,
    consensus: Option<(usize, usize)>,
}

/// The simulation engine
pub struct Engine {
    config: EngineConfig,
    bus: Arc<MessageBus>,
    agents: BTreeMap<AgentId, Agent>,
    swarms: Vec<Swarm>,
    environment: Environment,
    driver: Box<dyn EnvironmentDriver>,
    leader: Option<AgentId>,
    metrics: EngineMetrics,
    metrics_tx: watch::Sender<EngineMetrics>,
    state_tx: watch::Sender<EngineState>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    events: broadcast::Sender<EngineEvent>,
    telemetry: EngineTelemetry,
}

impl Engine {
    /// Create an engine sending over `bus`
    pub fn new(config: EngineConfig, bus: Arc<MessageBus>) -> Result<Self> {
        let telemetry = EngineTelemetry::new().map_err(|e| EngineError::Telemetry(e.to_string()))?;
        let (metrics_tx, _) = watch::channel(EngineMetrics::default());
        let (state_tx, _) = watch::channel(EngineState::Idle);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Ok(Self {
            config,
            bus,
            agents: BTreeMap::new(),
            swarms: Vec::new(),
            environment: Environment::new(),
            driver: Box::new(StaticDriver),
            leader: None,
            metrics: EngineMetrics::default(),
            metrics_tx,
            state_tx,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            events,
            telemetry,
        })
    }

    /// Replace the environment driver
    pub fn with_driver(mut self, driver: Box<dyn EnvironmentDriver>) -> Self {
        self.driver = driver;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Mutable environment access between runs (seeding values)
    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    /// Add an agent and register it with the bus
    pub async fn add_agent(&mut self, agent: Agent) -> Result<()> {
        let id = agent.id();
        if id.is_system() {
            return Err(EngineError::ReservedAgentId(id));
        }
        if self.agents.contains_key(&id) {
            return Err(EngineError::DuplicateAgent(id));
        }

        self.bus.register_agent(id).await;
        debug!(agent_id = %id, role = %agent.role(), priority = agent.priority(), "Agent added");
        self.agents.insert(id, agent);
        Ok(())
    }

    /// Remove an agent and unregister it from the bus
    pub async fn remove_agent(&mut self, id: AgentId) -> Result<Agent> {
        let agent = self
            .agents
            .remove(&id)
            .ok_or(EngineError::UnknownAgent(id))?;
        self.bus.unregister_agent(id).await;
        Ok(agent)
    }

    /// Add a swarm; every member must already be an agent
    pub fn add_swarm(&mut self, swarm: Swarm) -> Result<()> {
        let invalid = |reason: String| EngineError::InvalidSwarm {
            swarm: swarm.id().to_string(),
            reason,
        };

        if self.swarms.iter().any(|s| s.id() == swarm.id()) {
            return Err(invalid("duplicate swarm id".to_string()));
        }
        if swarm.members().is_empty() {
            return Err(invalid("swarm has no members".to_string()));
        }
        if let Some(missing) = swarm
            .members()
            .iter()
            .find(|id| !self.agents.contains_key(*id))
        {
            return Err(invalid(format!("unknown member {}", missing)));
        }

        self.swarms.push(swarm);
        Ok(())
    }

    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(&id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn swarms(&self) -> &[Swarm] {
        &self.swarms
    }

    pub fn swarm(&self, id: &str) -> Option<&Swarm> {
        self.swarms.iter().find(|s| s.id() == id)
    }

    /// Leader of the last round
    pub fn leader(&self) -> Option<AgentId> {
        self.leader
    }

    /// Agents grouped by priority, highest first
    pub fn priority_tiers(&self) -> Vec<(u32, Vec<AgentId>)> {
        let mut tiers: BTreeMap<u32, Vec<AgentId>> = BTreeMap::new();
        for agent in self.agents.values() {
            tiers.entry(agent.priority()).or_default().push(agent.id());
        }
        tiers.into_iter().rev().collect()
    }

    /// Cloneable control handle
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(
            self.stop_tx.clone(),
            self.metrics_tx.subscribe(),
            self.state_tx.subscribe(),
        )
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    pub fn telemetry(&self) -> &EngineTelemetry {
        &self.telemetry
    }

    /// Request a stop; see [`EngineHandle::stop`]
    pub fn stop(&self) -> bool {
        self.handle().stop()
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            trace!("No engine event subscribers");
        }
    }

    /// Persistable records of every agent
    pub fn snapshot_records(&self) -> Vec<AgentRecord> {
        self.agents.values().map(Agent::to_record).collect()
    }

    /// Restore agents' state from records
    ///
    /// Every record must name a known agent; nothing is applied otherwise.
    /// Decision functions, plugins and ledgers stay as configured.
    pub fn restore_records(&mut self, records: Vec<AgentRecord>) -> Result<usize> {
        for record in &records {
            if record.id.is_system() {
                return Err(EngineError::ReservedAgentId(record.id));
            }
            if !self.agents.contains_key(&record.id) {
                return Err(EngineError::UnknownAgent(record.id));
            }
        }

        let count = records.len();
        for record in records {
            if let Some(agent) = self.agents.get_mut(&record.id) {
                agent.restore(record);
            }
        }
        info!(count, "Agent state restored");
        Ok(count)
    }

    fn begin(&mut self, steps: Option<u64>) -> Result<()> {
        if self.stop_requested() {
            self.set_state(EngineState::Stopped);
            return Err(EngineError::Stopped);
        }

        self.set_state(EngineState::Running);
        info!(
            agents = self.agents.len(),
            swarms = self.swarms.len(),
            steps = ?steps,
            "Engine started"
        );
        self.emit(EngineEvent::Started { steps });
        Ok(())
    }

    fn finish(&mut self, rounds_executed: u64, stopped: bool) -> RunSummary {
        let stopped = stopped || self.stop_requested();
        if stopped {
            self.set_state(EngineState::Stopped);
            info!(rounds = rounds_executed, "Engine stopped");
            self.emit(EngineEvent::Stopped {
                rounds: rounds_executed,
            });
        } else {
            self.set_state(EngineState::Idle);
        }

        RunSummary {
            rounds_executed,
            stopped,
            steps_completed: self.metrics.steps_completed,
        }
    }

    fn fail(&mut self, error: EngineError) -> EngineError {
        warn!(error = %error, "Round failed, engine back to idle");
        self.set_state(EngineState::Idle);
        error
    }

    /// Run `steps` rounds back to back
    ///
    /// A stop request is honored between rounds. Fails with
    /// [`EngineError::Stopped`] when called on a stopped engine and with
    /// [`EngineError::SchedulerFailure`] when a round cannot complete.
    pub async fn run(&mut self, steps: u64) -> Result<RunSummary> {
        self.begin(Some(steps))?;

        let mut executed = 0;
        let mut stopped = false;
        for _ in 0..steps {
            if self.stop_requested() {
                stopped = true;
                break;
            }
            if let Err(e) = self.run_round().await {
                return Err(self.fail(e));
            }
            executed += 1;
        }

        Ok(self.finish(executed, stopped))
    }

    /// Run one round per `interval` until stopped or `max_rounds` is reached
    pub async fn start_real_time_simulation(
        &mut self,
        interval: Duration,
        max_rounds: Option<u64>,
    ) -> Result<RunSummary> {
        if interval.is_zero() {
            return Err(EngineError::InvalidInterval(interval));
        }
        self.begin(max_rounds)?;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_rx = self.stop_rx.clone();

        let mut executed = 0;
        let mut stopped = false;
        loop {
            if max_rounds.is_some_and(|max| executed >= max) {
                break;
            }

            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => {
                    stopped = true;
                    break;
                }
                _ = ticker.tick() => {
                    if self.stop_requested() {
                        stopped = true;
                        break;
                    }
                    if let Err(e) = self.run_round().await {
                        return Err(self.fail(e));
                    }
                    executed += 1;
                }
            }
        }

        Ok(self.finish(executed, stopped))
    }

    /// Execute one round
    async fn run_round(&mut self) -> Result<()> {
        let started = Instant::now();
        let round = self.environment.round() + 1;

        let mut next = self.environment.clone();
        next.advance(Utc::now());
        self.driver
            .advance(&mut next)
            .map_err(|e| EngineError::SchedulerFailure {
                round,
                reason: format!("environment driver {} failed: {:#}", self.driver.name(), e),
            })?;
        self.environment = next;

        self.elect(round).await;

        let outcome = self.execute_phases(round).await;

        self.complete_round(round, started.elapsed(), outcome).await;
        Ok(())
    }

    async fn elect(&mut self, round: u64) {
        let leader = elect_leader(self.agents.values());
        self.environment.set_leader(leader);

        if leader == self.leader {
            return;
        }
        let previous = self.leader;
        self.leader = leader;

        let Some(leader) = leader else {
            return;
        };
        info!(round, leader = %leader, previous = ?previous, "Leader elected");

        let alert = AgentMessage::broadcast(
            MessageKind::Alert,
            AgentId::SYSTEM,
            json!({ "leader": leader, "previous": previous, "round": round }),
        )
        .with_priority(10);
        if let Err(e) = self.bus.send(alert).await {
            warn!(round, error = %e, "Leader announcement not delivered");
        }

        self.emit(EngineEvent::LeaderElected {
            round,
            leader,
            previous,
        });
    }

    /// Message flush, swarm coordination, tiered stepping and consensus
    async fn execute_phases(&mut self, round: u64) -> RoundOutcome {
        let tiers = self.priority_tiers();
        let share_decisions = self.config.share_decisions;
        let Self {
            agents,
            swarms,
            bus,
            environment,
            ..
        } = self;
        let bus: &MessageBus = bus;
        let environment: &Environment = environment;

        // Deliver everything queued since the previous round
        join_all(agents.iter_mut().map(|(id, agent)| async move {
            let messages = bus.process_messages(*id).await;
            agent.deliver(messages);
        }))
        .await;

        let snapshots: BTreeMap<AgentId, AgentSnapshot> = agents
            .iter()
            .map(|(id, agent)| (*id, agent.snapshot()))
            .collect();
        let swarm_reports: Vec<CoordinationReport> = join_all(swarms.iter_mut().map(|swarm| {
            let members: Vec<&AgentSnapshot> = swarm
                .members()
                .iter()
                .filter_map(|id| snapshots.get(id))
                .collect();
            async move {
                let swarm_id = swarm.id().to_string();
                let result = AssertUnwindSafe(swarm.coordinate(environment, &members, bus))
                    .catch_unwind()
                    .await;
                if result.is_err() {
                    warn!(swarm = %swarm_id, round, "Swarm coordination panicked");
                }
                result.ok()
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect();

        let mut reports = Vec::with_capacity(agents.len());
        for (priority, tier) in tiers {
            let members: HashSet<AgentId> = tier.into_iter().collect();

            // Pick up what higher tiers shared earlier in this round
            join_all(
                agents
                    .iter_mut()
                    .filter(|(id, _)| members.contains(*id))
                    .map(|(id, agent)| async move {
                        let messages = bus.process_messages(*id).await;
                        agent.deliver(messages);
                    }),
            )
            .await;

            let peers = Peers::new(agents.values().map(|a| Arc::new(a.snapshot())));
            let peers = &peers;

            let tier_reports = join_all(
                agents
                    .iter_mut()
                    .filter(|(id, _)| members.contains(*id))
                    .map(|(_, agent)| async move {
                        let report = agent.step(environment, peers).await;
                        if share_decisions {
                            share_decision(bus, agent, &report).await;
                        }
                        report
                    }),
            )
            .await;

            trace!(round, tier = priority, agents = tier_reports.len(), "Tier completed");
            reports.extend(tier_reports);
        }

        let consensus = self.detect_consensus(round, &reports).await;

        RoundOutcome {
            reports,
            swarms: swarm_reports,
            consensus,
        }
    }

    /// Returns `(approvals, voters)` when the round reached consensus
    async fn detect_consensus(
        &self,
        round: u64,
        reports: &[StepReport],
    ) -> Option<(usize, usize)> {
        let (approvals, rejections) = reports
            .iter()
            .filter(|r| !r.failed())
            .fold((0usize, 0usize), |(yes, no), r| {
                if r.decision.signals_agreement() {
                    (yes + 1, no)
                } else if r.decision.signals_rejection() {
                    (yes, no + 1)
                } else {
                    (yes, no)
                }
            });
        let voters = approvals + rejections;

        if voters == 0 || voters < self.config.min_consensus_quorum {
            return None;
        }
        let ratio = approvals as f64 / voters as f64;
        if ratio < self.config.consensus_threshold {
            return None;
        }

        debug!(round, approvals, voters, ratio, "Consensus reached");
        let message = AgentMessage::broadcast(
            MessageKind::ConsensusResponse,
            AgentId::SYSTEM,
            json!({ "round": round, "approvals": approvals, "voters": voters }),
        );
        if let Err(e) = self.bus.send(message).await {
            warn!(round, error = %e, "Consensus announcement not delivered");
        }
        self.emit(EngineEvent::ConsensusReached {
            round,
            approvals,
            voters,
        });

        Some((approvals, voters))
    }

    /// Fold a finished round into the metrics and publish them
    async fn complete_round(&mut self, round: u64, duration: Duration, outcome: RoundOutcome) {
        let bus_stats = self.bus.stats().await;
        let failures = outcome.reports.iter().filter(|r| r.failed()).count();

        for report in outcome.reports.iter().filter(|r| r.failed()) {
            self.emit(EngineEvent::AgentFailed {
                round,
                agent: report.agent,
                reason: report.error.clone().unwrap_or_default(),
            });
        }

        let metrics = &mut self.metrics;
        metrics.record_step(duration);
        for report in &outcome.reports {
            *metrics.agent_actions.entry(report.agent).or_insert(0) += 1;
        }
        metrics.decision_failures += failures as u64;
        for swarm in &outcome.swarms {
            metrics
                .swarm_success_rates
                .insert(swarm.swarm.clone(), swarm.behavior.success_rate);
        }
        let sent_this_round = bus_stats.sent.saturating_sub(metrics.messages_sent);
        metrics.messages_sent = bus_stats.sent;
        if outcome.consensus.is_some() {
            metrics.consensus_events += 1;
        }
        metrics.leader = self.leader;
        metrics.last_round_at = Some(self.environment.timestamp());

        self.metrics_tx.send_replace(self.metrics.clone());
        self.telemetry.observe_round(
            duration,
            &outcome.reports,
            sent_this_round,
            outcome.consensus.is_some(),
            bus_stats.queue_depth,
        );

        debug!(
            round,
            duration_ms = duration.as_millis() as u64,
            decisions = outcome.reports.len(),
            failures,
            "Round completed"
        );
        self.emit(EngineEvent::RoundCompleted {
            round,
            duration,
            decisions: outcome.reports.len(),
            failures,
        });
    }
}

/// Broadcast an agent's decision and record the attempt
async fn share_decision(bus: &MessageBus, agent: &mut Agent, report: &StepReport) {
    let share = DecisionShare {
        decision: report.decision.clone(),
        priority: agent.priority(),
        round: report.round,
    };
    let payload = match serde_json::to_value(&share) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(agent_id = %agent.id(), error = %e, "Decision not encodable");
            return;
        }
    };

    let message = AgentMessage::broadcast(MessageKind::DecisionShare, agent.id(), payload)
        .with_priority(agent.priority().min(10) as u8);

    match bus.send(message).await {
        Ok(id) => agent.record_action(
            report.round,
            "share_decision",
            Outcome::Success,
            json!({ "message": id }),
            ActionCategory::Communication,
        ),
        Err(e) => {
            debug!(agent_id = %agent.id(), round = report.round, error = %e, "Decision share failed");
            agent.note_failed_message();
            agent.record_action(
                report.round,
                "share_decision",
                Outcome::Failure,
                json!({ "error": e.to_string() }),
                ActionCategory::Communication,
            );
        }
    }
}
