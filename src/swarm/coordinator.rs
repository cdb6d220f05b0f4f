//! Swarm coordinator
//!
//! A [`Swarm`] groups a fixed set of agents. Each round it derives aggregate
//! statistics from its members' histories, broadcasts them as
//! `SwarmFeedback` and keeps a bounded log of what it observed. The
//! statistics are descriptive only; nothing is enforced.

use super::agent::AgentSnapshot;
use super::decision::Decision;
use super::history::{ActionCategory, Outcome};
use crate::bus::{AgentId, AgentMessage, MessageBus, MessageKind};
use crate::engine::Environment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Behavior snapshots retained per swarm
pub const BEHAVIOR_HISTORY_CAPACITY: usize = 100;

/// Aggregate statistics over a swarm's members
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmergentBehavior {
    /// Mean per-agent fraction of successful decisions
    pub success_rate: f64,
    /// Fraction of received messages that were swarm feedback
    pub cooperation_level: f64,
    /// Population variance of per-agent action counts
    pub action_variance: f64,
    /// Fraction of agents whose latest decision signals agreement
    pub consensus_alignment: f64,
    /// Members the statistics were computed over
    pub agents: usize,
}

/// One entry of a swarm's behavior history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSnapshot {
    pub round: u64,
    pub recorded_at: DateTime<Utc>,
    pub behavior: EmergentBehavior,
}

/// Payload of a `SwarmFeedback` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmFeedback {
    pub swarm: String,
    pub round: u64,
    pub success_rate: f64,
    pub cooperation_level: f64,
}

/// Result of [`Swarm::coordinate`]
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationReport {
    pub swarm: String,
    pub behavior: EmergentBehavior,
    /// Whether the feedback broadcast was accepted by the bus
    pub feedback_sent: bool,
}

/// A fixed group of agents
#[derive(Debug, Clone)]
pub struct Swarm {
    id: String,
    members: Vec<AgentId>,
    history: VecDeque<BehaviorSnapshot>,
}

impl Swarm {
    /// Create a swarm; duplicate members are dropped, order is kept
    pub fn new(id: impl Into<String>, members: impl IntoIterator<Item = AgentId>) -> Self {
        let mut unique = Vec::new();
        for member in members {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }

        Self {
            id: id.into(),
            members: unique,
            history: VecDeque::with_capacity(BEHAVIOR_HISTORY_CAPACITY),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[AgentId] {
        &self.members
    }

    pub fn contains(&self, agent: AgentId) -> bool {
        self.members.contains(&agent)
    }

    /// Behavior observed in past rounds, oldest first
    pub fn behavior_history(&self) -> &VecDeque<BehaviorSnapshot> {
        &self.history
    }

    /// Compute aggregate statistics over `members`
    ///
    /// Pure: reads the snapshots only. Snapshots of agents outside the swarm
    /// are ignored.
    pub fn analyze_emergent_behavior(&self, members: &[&AgentSnapshot]) -> EmergentBehavior {
        let members: Vec<&AgentSnapshot> = members
            .iter()
            .copied()
            .filter(|s| self.contains(s.id))
            .collect();

        if members.is_empty() {
            return EmergentBehavior::default();
        }
        let n = members.len() as f64;

        let rates: Vec<f64> = members
            .iter()
            .filter_map(|s| {
                let decisions = s.historical_actions(ActionCategory::Decision);
                if decisions.is_empty() {
                    return None;
                }
                let successes = decisions
                    .iter()
                    .filter(|r| r.outcome == Outcome::Success)
                    .count();
                Some(successes as f64 / decisions.len() as f64)
            })
            .collect();
        let success_rate = if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        };

        let received: u64 = members.iter().map(|s| s.total_received()).sum();
        let feedback: u64 = members
            .iter()
            .map(|s| s.received(MessageKind::SwarmFeedback))
            .sum();
        let cooperation_level = if received == 0 {
            0.0
        } else {
            feedback as f64 / received as f64
        };

        let counts: Vec<f64> = members
            .iter()
            .map(|s| s.history.total_len() as f64)
            .collect();
        let mean = counts.iter().sum::<f64>() / n;
        let action_variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;

        let aligned = members
            .iter()
            .filter(|s| {
                s.history
                    .latest(ActionCategory::Decision)
                    .map(|r| Decision::from_action(&r.action).signals_agreement())
                    .unwrap_or(false)
            })
            .count();
        let consensus_alignment = aligned as f64 / n;

        EmergentBehavior {
            success_rate,
            cooperation_level,
            action_variance,
            consensus_alignment,
            agents: members.len(),
        }
    }

    /// Run one coordination round
    ///
    /// Broadcasts the success rate and cooperation level as `SwarmFeedback`
    /// from [`AgentId::SYSTEM`] and appends a behavior snapshot. A rejected
    /// broadcast is logged and reported, never returned as an error.
    pub async fn coordinate(
        &mut self,
        environment: &Environment,
        members: &[&AgentSnapshot],
        bus: &MessageBus,
    ) -> CoordinationReport {
        let behavior = self.analyze_emergent_behavior(members);
        let round = environment.round();

        let feedback = SwarmFeedback {
            swarm: self.id.clone(),
            round,
            success_rate: behavior.success_rate,
            cooperation_level: behavior.cooperation_level,
        };

        let feedback_sent = match serde_json::to_value(&feedback) {
            Ok(payload) => {
                let message =
                    AgentMessage::broadcast(MessageKind::SwarmFeedback, AgentId::SYSTEM, payload);
                match bus.send(message).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(swarm = %self.id, round, error = %e, "Swarm feedback not delivered");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(swarm = %self.id, round, error = %e, "Swarm feedback not encodable");
                false
            }
        };

        if self.history.len() >= BEHAVIOR_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(BehaviorSnapshot {
            round,
            recorded_at: environment.timestamp(),
            behavior: behavior.clone(),
        });

        debug!(
            swarm = %self.id,
            round,
            success_rate = behavior.success_rate,
            cooperation = behavior.cooperation_level,
            alignment = behavior.consensus_alignment,
            "Swarm coordinated"
        );

        CoordinationReport {
            swarm: self.id.clone(),
            behavior,
            feedback_sent,
        }
    }
}
