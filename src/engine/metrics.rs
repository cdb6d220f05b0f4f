//! Engine metrics
//!
//! [`EngineMetrics`] is the plain snapshot published after every round.
//! [`EngineTelemetry`] mirrors it into a Prometheus registry owned by the
//! engine, so independent simulations never share counters.

use crate::bus::AgentId;
use crate::swarm::StepReport;
use chrono::{DateTime, Utc};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Cumulative simulation metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    /// Rounds completed
    pub steps_completed: u64,
    /// Running mean of round duration, in milliseconds
    pub average_step_ms: f64,
    /// Steps taken per agent
    pub agent_actions: BTreeMap<AgentId, u64>,
    /// Success rate last observed per swarm
    pub swarm_success_rates: BTreeMap<String, f64>,
    /// Messages accepted by the bus
    pub messages_sent: u64,
    /// Rounds in which consensus was reached
    pub consensus_events: u64,
    /// Failed or panicked decisions
    pub decision_failures: u64,
    /// Leader of the last completed round
    pub leader: Option<AgentId>,
    pub last_round_at: Option<DateTime<Utc>>,
}

impl EngineMetrics {
    /// Count a completed round and fold its duration into the running mean
    ///
    /// `avg' = (avg * (n - 1) + sample) / n`
    pub fn record_step(&mut self, sample: Duration) {
        self.steps_completed += 1;
        let n = self.steps_completed as f64;
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.average_step_ms = (self.average_step_ms * (n - 1.0) + sample_ms) / n;
    }

    /// Total steps across all agents
    pub fn total_agent_actions(&self) -> u64 {
        self.agent_actions.values().sum()
    }
}

/// Prometheus instruments of one engine
#[derive(Clone)]
pub struct EngineTelemetry {
    registry: Registry,
    rounds: IntCounter,
    agent_steps: IntCounterVec,
    messages_sent: IntCounter,
    consensus_events: IntCounter,
    round_duration: Histogram,
    queue_depth: IntGauge,
}

impl std::fmt::Debug for EngineTelemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineTelemetry")
            .field("rounds", &self.rounds.get())
            .finish()
    }
}

impl EngineTelemetry {
    /// Create and register every instrument in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let rounds = IntCounter::new("agora_rounds_total", "Rounds completed")?;
        let agent_steps = IntCounterVec::new(
            Opts::new("agora_agent_steps_total", "Agent steps by outcome"),
            &["outcome"],
        )?;
        let messages_sent =
            IntCounter::new("agora_messages_sent_total", "Messages accepted by the bus")?;
        let consensus_events = IntCounter::new(
            "agora_consensus_events_total",
            "Rounds in which consensus was reached",
        )?;
        let round_duration = Histogram::with_opts(
            HistogramOpts::new("agora_round_duration_seconds", "Duration of a round")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let queue_depth = IntGauge::new(
            "agora_bus_queue_depth",
            "Messages waiting in the bus after a round",
        )?;

        registry.register(Box::new(rounds.clone()))?;
        registry.register(Box::new(agent_steps.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(consensus_events.clone()))?;
        registry.register(Box::new(round_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            rounds,
            agent_steps,
            messages_sent,
            consensus_events,
            round_duration,
            queue_depth,
        })
    }

    /// Record a completed round
    pub fn observe_round(
        &self,
        duration: Duration,
        reports: &[StepReport],
        messages_sent: u64,
        consensus: bool,
        queue_depth: usize,
    ) {
        self.rounds.inc();
        self.round_duration.observe(duration.as_secs_f64());
        for report in reports {
            self.agent_steps
                .with_label_values(&[report.outcome.as_str()])
                .inc();
        }
        self.messages_sent.inc_by(messages_sent);
        if consensus {
            self.consensus_events.inc();
        }
        self.queue_depth.set(queue_depth as i64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every instrument as Prometheus text
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
