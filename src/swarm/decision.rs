//! Decisions and decision functions
//!
//! A [`DecisionFunction`] is the pluggable brain of an agent. It gets mutable
//! access to its own agent's core and read-only access to everything else:
//! the environment, a snapshot of the peers and the messages received for
//! this round. It must never mutate peers.

use super::agent::{AgentCore, Peers};
use super::role::{Role, RoleState};
use crate::bus::{AgentId, AgentMessage, MessageKind};
use crate::engine::{Environment, PRICE_KEY, RISK_KEY};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Agent-local decision errors
///
/// Never fatal to a round: the agent records a failed, skipped decision and
/// the other agents carry on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecisionError {
    #[error("decision failed: {0}")]
    Failed(String),

    #[error("decision function panicked: {0}")]
    Panicked(String),

    #[error("strategy {strategy} cannot drive a {role} agent")]
    RoleMismatch { strategy: String, role: Role },
}

/// Outcome of a decision function
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Skip,
    /// Free-form action tag (e.g. "buy")
    Tag(String),
}

impl From<bool> for Decision {
    fn from(approve: bool) -> Self {
        if approve {
            Decision::Approve
        } else {
            Decision::Reject
        }
    }
}

/// Prefix marking a tag whose name would otherwise read as a built-in decision
const TAG_PREFIX: &str = "tag:";

impl Decision {
    /// Action string recorded in the history
    ///
    /// Tags named like a built-in decision (or already carrying the `tag:`
    /// prefix) are written as `tag:<name>` so [`Decision::from_action`]
    /// gives the tag back.
    pub fn as_action(&self) -> Cow<'_, str> {
        match self {
            Decision::Approve => Cow::Borrowed("approve"),
            Decision::Reject => Cow::Borrowed("reject"),
            Decision::Skip => Cow::Borrowed("skip"),
            Decision::Tag(tag) => {
                if matches!(tag.as_str(), "approve" | "reject" | "skip")
                    || tag.starts_with(TAG_PREFIX)
                {
                    Cow::Owned(format!("{}{}", TAG_PREFIX, tag))
                } else {
                    Cow::Borrowed(tag)
                }
            }
        }
    }

    /// Inverse of [`Decision::as_action`]
    pub fn from_action(action: &str) -> Self {
        if let Some(tag) = action.strip_prefix(TAG_PREFIX) {
            return Decision::Tag(tag.to_string());
        }
        match action {
            "approve" => Decision::Approve,
            "reject" => Decision::Reject,
            "skip" => Decision::Skip,
            tag => Decision::Tag(tag.to_string()),
        }
    }

    /// Whether the decision counts as agreement for consensus purposes
    pub fn signals_agreement(&self) -> bool {
        match self {
            Decision::Approve => true,
            Decision::Tag(tag) => matches!(tag.as_str(), "agree" | "yes"),
            Decision::Reject | Decision::Skip => false,
        }
    }

    /// Whether the decision is an explicit vote against
    pub fn signals_rejection(&self) -> bool {
        match self {
            Decision::Reject => true,
            Decision::Tag(tag) => matches!(tag.as_str(), "disagree" | "no"),
            Decision::Approve | Decision::Skip => false,
        }
    }

    /// Whether the decision should be submitted to a ledger
    pub fn is_actionable(&self) -> bool {
        matches!(self, Decision::Approve | Decision::Tag(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_action())
    }
}

/// Payload of a `DecisionShare` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionShare {
    pub decision: Decision,
    /// Scheduling priority of the sender
    pub priority: u32,
    pub round: u64,
}

impl DecisionShare {
    /// Decode a shared decision, ignoring other message kinds
    pub fn from_message(message: &AgentMessage) -> Option<Self> {
        if message.kind != MessageKind::DecisionShare {
            return None;
        }
        message.decode_payload()
    }
}

/// Count (approvals, rejections) among the decisions shared in `inbox`
pub fn tally_shares(inbox: &[AgentMessage]) -> (usize, usize) {
    inbox
        .iter()
        .filter_map(DecisionShare::from_message)
        .fold((0, 0), |(yes, no), share| {
            if share.decision.signals_agreement() {
                (yes + 1, no)
            } else if share.decision.signals_rejection() {
                (yes, no + 1)
            } else {
                (yes, no)
            }
        })
}

/// Everything a decision function may read
pub struct StepInput<'a> {
    pub environment: &'a Environment,
    pub peers: &'a Peers,
    /// Messages delivered to the agent since its previous step
    pub inbox: &'a [AgentMessage],
}

/// Pluggable decision logic
#[async_trait]
pub trait DecisionFunction: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn decide(
        &self,
        agent: &mut AgentCore,
        input: &StepInput<'_>,
    ) -> Result<Decision, DecisionError>;
}

/// Always returns the same decision
#[derive(Debug, Clone)]
pub struct ConstantDecision(pub Decision);

#[async_trait]
impl DecisionFunction for ConstantDecision {
    fn name(&self) -> &str {
        "constant"
    }

    async fn decide(
        &self,
        _agent: &mut AgentCore,
        _input: &StepInput<'_>,
    ) -> Result<Decision, DecisionError> {
        Ok(self.0.clone())
    }
}

/// Replays one decision per round, then falls back to a fixed decision
#[derive(Debug, Clone)]
pub struct Scripted {
    decisions: Vec<Decision>,
    fallback: Decision,
}

impl Scripted {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions,
            fallback: Decision::Skip,
        }
    }

    pub fn with_fallback(mut self, fallback: Decision) -> Self {
        self.fallback = fallback;
        self
    }
}

#[async_trait]
impl DecisionFunction for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(
        &self,
        _agent: &mut AgentCore,
        input: &StepInput<'_>,
    ) -> Result<Decision, DecisionError> {
        let index = input.environment.round().saturating_sub(1) as usize;
        Ok(self
            .decisions
            .get(index)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Adopts the latest decision shared by a higher-priority agent
#[derive(Debug, Clone)]
pub struct FollowHigherTier {
    fallback: Decision,
}

impl FollowHigherTier {
    pub fn new(fallback: Decision) -> Self {
        Self { fallback }
    }
}

impl Default for FollowHigherTier {
    fn default() -> Self {
        Self::new(Decision::Skip)
    }
}

#[async_trait]
impl DecisionFunction for FollowHigherTier {
    fn name(&self) -> &str {
        "follow_higher_tier"
    }

    async fn decide(
        &self,
        agent: &mut AgentCore,
        input: &StepInput<'_>,
    ) -> Result<Decision, DecisionError> {
        let own = agent.priority();
        let followed = input
            .inbox
            .iter()
            .rev()
            .filter_map(DecisionShare::from_message)
            .find(|share| share.priority > own);

        Ok(followed
            .map(|share| share.decision)
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Approves with a fixed probability using a seeded generator
#[derive(Debug)]
pub struct RandomVote {
    rng: Mutex<StdRng>,
    approve_probability: f64,
}

impl RandomVote {
    pub fn seeded(seed: u64, approve_probability: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            approve_probability: approve_probability.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl DecisionFunction for RandomVote {
    fn name(&self) -> &str {
        "random_vote"
    }

    async fn decide(
        &self,
        _agent: &mut AgentCore,
        _input: &StepInput<'_>,
    ) -> Result<Decision, DecisionError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| DecisionError::Failed("random source poisoned".to_string()))?;
        Ok(Decision::from(rng.gen_bool(self.approve_probability)))
    }
}

/// Default strategy: dispatches on the agent's role state
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleDispatcher;

#[async_trait]
impl DecisionFunction for RoleDispatcher {
    fn name(&self) -> &str {
        "role"
    }

    async fn decide(
        &self,
        agent: &mut AgentCore,
        input: &StepInput<'_>,
    ) -> Result<Decision, DecisionError> {
        let (approvals, rejections) = tally_shares(input.inbox);
        let risk = input.environment.number(RISK_KEY).unwrap_or(0.0);

        let decision = match agent.role_state_mut() {
            RoleState::Governance(state) => {
                state.proposals_reviewed += 1;
                Decision::from(rejections <= approvals)
            }
            RoleState::Validator(state) => {
                if risk > state.risk_tolerance {
                    state.rejected += 1;
                    Decision::Reject
                } else {
                    state.validated += 1;
                    Decision::Approve
                }
            }
            RoleState::Trader(state) => {
                let Some(price) = input.environment.number(PRICE_KEY) else {
                    return Ok(Decision::Skip);
                };
                let action = match state.last_price {
                    Some(last) if price > last => {
                        state.position -= 1;
                        state.balance += price;
                        "sell"
                    }
                    Some(last) if price < last && state.balance >= price => {
                        state.position += 1;
                        state.balance -= price;
                        "buy"
                    }
                    _ => "hold",
                };
                state.last_price = Some(price);
                Decision::Tag(action.to_string())
            }
            RoleState::Voter(state) => {
                state.votes_cast += 1;
                let approve = approvals >= rejections;
                if approve {
                    state.approvals += 1;
                }
                Decision::from(approve)
            }
        };

        Ok(decision)
    }
}

fn default_approve_probability() -> f64 {
    0.5
}

/// Serializable choice of decision function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Role-specific logic
    #[default]
    Role,
    /// Always the same decision
    Constant { decision: Decision },
    /// Adopt decisions of higher-priority peers
    FollowHigherTier {
        #[serde(default = "default_skip")]
        fallback: Decision,
    },
    /// Seeded coin flip
    Random {
        seed: u64,
        #[serde(default = "default_approve_probability")]
        approve_probability: f64,
    },
    /// One decision per round
    Scripted {
        decisions: Vec<Decision>,
        #[serde(default = "default_skip")]
        fallback: Decision,
    },
}

fn default_skip() -> Decision {
    Decision::Skip
}

impl Strategy {
    /// Build the decision function for this strategy
    ///
    /// `agent` salts the random seed so agents sharing a strategy diverge.
    pub fn build(&self, agent: AgentId) -> Arc<dyn DecisionFunction> {
        match self {
            Strategy::Role => Arc::new(RoleDispatcher),
            Strategy::Constant { decision } => Arc::new(ConstantDecision(decision.clone())),
            Strategy::FollowHigherTier { fallback } => {
                Arc::new(FollowHigherTier::new(fallback.clone()))
            }
            Strategy::Random {
                seed,
                approve_probability,
            } => Arc::new(RandomVote::seeded(
                seed.wrapping_add(agent.get()),
                *approve_probability,
            )),
            Strategy::Scripted {
                decisions,
                fallback,
            } => Arc::new(Scripted::new(decisions.clone()).with_fallback(fallback.clone())),
        }
    }
}
