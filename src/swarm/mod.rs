//! Agents and swarms
//!
//! Agents hold a typed role, an opaque state bag and a bounded per-category
//! action history, and delegate their choices to an injected decision
//! function. Swarms group agents and derive emergent statistics from them.

mod agent;
mod coordinator;
mod decision;
mod history;
mod plugin;
mod role;

pub use agent::{Agent, AgentCore, AgentSnapshot, AgentStats, Peers, StepReport};
pub use coordinator::{
    BehaviorSnapshot, CoordinationReport, EmergentBehavior, Swarm, SwarmFeedback,
    BEHAVIOR_HISTORY_CAPACITY,
};
pub use decision::{
    tally_shares, ConstantDecision, Decision, DecisionError, DecisionFunction, DecisionShare,
    FollowHigherTier, RandomVote, RoleDispatcher, Scripted, StepInput, Strategy,
};
pub use history::{ActionCategory, ActionHistory, ActionRecord, Outcome, HISTORY_CAPACITY};
pub use plugin::{AgentPlugin, GovernanceDemotion, TracePlugin};
pub use role::{GovernanceState, Role, RoleState, TraderState, ValidatorState, VoterState};
