//! Agent plugins
//!
//! Plugins are synchronous hooks invoked in registration order. They receive
//! the core of the agent they are attached to and nothing else mutable, so
//! role changes can only ever come from the agent's own plugins or decision
//! function.

use super::agent::AgentCore;
use super::decision::{Decision, DecisionShare, StepInput};
use super::role::{RoleState, VoterState};
use crate::bus::AgentMessage;
use crate::engine::Environment;
use tracing::{info, trace};

/// Hooks run around an agent's step
pub trait AgentPlugin: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Before the decision function runs
    fn on_step(&self, _agent: &mut AgentCore, _environment: &Environment) {}

    /// For every message delivered to the agent
    fn on_message(&self, _agent: &mut AgentCore, _message: &AgentMessage) {}

    /// After the decision has been recorded
    fn on_decision(&self, _agent: &mut AgentCore, _decision: &Decision, _input: &StepInput<'_>) {}
}

/// Demotes a governance agent to voter after sustained low peer alignment
///
/// Alignment is the fraction of decisions shared with the agent this round
/// that agree with its own decision. Rounds without shared decisions leave
/// the streak untouched.
#[derive(Debug, Clone)]
pub struct GovernanceDemotion {
    threshold: f64,
    patience: u32,
}

impl GovernanceDemotion {
    pub fn new(threshold: f64, patience: u32) -> Self {
        Self {
            threshold,
            patience: patience.max(1),
        }
    }
}

impl Default for GovernanceDemotion {
    fn default() -> Self {
        Self::new(0.5, 3)
    }
}

impl AgentPlugin for GovernanceDemotion {
    fn name(&self) -> &str {
        "governance_demotion"
    }

    fn on_decision(&self, agent: &mut AgentCore, decision: &Decision, input: &StepInput<'_>) {
        let agent_id = agent.id();
        let RoleState::Governance(state) = agent.role_state_mut() else {
            return;
        };

        let shares: Vec<DecisionShare> = input
            .inbox
            .iter()
            .filter_map(DecisionShare::from_message)
            .collect();
        if shares.is_empty() {
            return;
        }

        let agreeing = shares
            .iter()
            .filter(|s| s.decision.signals_agreement() == decision.signals_agreement())
            .count();
        let alignment = agreeing as f64 / shares.len() as f64;

        state.last_alignment = alignment;
        if alignment < self.threshold {
            state.low_alignment_streak += 1;
        } else {
            state.low_alignment_streak = 0;
        }

        if state.low_alignment_streak >= self.patience {
            info!(
                agent_id = %agent_id,
                alignment,
                streak = state.low_alignment_streak,
                "Governance agent demoting itself to voter"
            );
            agent.set_role(RoleState::Voter(VoterState::default()));
        }
    }
}

/// Traces every hook invocation
#[derive(Debug, Clone, Copy, Default)]
pub struct TracePlugin;

impl AgentPlugin for TracePlugin {
    fn name(&self) -> &str {
        "trace"
    }

    fn on_step(&self, agent: &mut AgentCore, environment: &Environment) {
        trace!(agent_id = %agent.id(), round = environment.round(), "Step starting");
    }

    fn on_message(&self, agent: &mut AgentCore, message: &AgentMessage) {
        trace!(
            agent_id = %agent.id(),
            id = %message.id,
            kind = %message.kind,
            sender = %message.sender,
            "Message delivered"
        );
    }

    fn on_decision(&self, agent: &mut AgentCore, decision: &Decision, input: &StepInput<'_>) {
        trace!(
            agent_id = %agent.id(),
            round = input.environment.round(),
            decision = %decision,
            "Decision taken"
        );
    }
}
