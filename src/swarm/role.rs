//! Agent roles
//!
//! The role is the discriminant of [`RoleState`]; each variant carries the
//! typed state its decision logic reads and writes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of agent roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Proposes and ratifies decisions; leader candidate
    Governance,
    /// Checks proposals against the environment's risk level
    Validator,
    /// Reacts to price movements
    Trader,
    /// Follows the majority of shared decisions
    Voter,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Governance, Role::Validator, Role::Trader, Role::Voter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Governance => "governance",
            Role::Validator => "validator",
            Role::Trader => "trader",
            Role::Voter => "voter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "governance" => Ok(Role::Governance),
            "validator" => Ok(Role::Validator),
            "trader" => Ok(Role::Trader),
            "voter" => Ok(Role::Voter),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// State of a governance agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceState {
    /// Proposals this agent ruled on
    pub proposals_reviewed: u64,
    /// Consecutive rounds with peer alignment below the demotion threshold
    pub low_alignment_streak: u32,
    /// Peer alignment observed in the last round (0.0-1.0)
    pub last_alignment: f64,
}

impl Default for GovernanceState {
    fn default() -> Self {
        Self {
            proposals_reviewed: 0,
            low_alignment_streak: 0,
            last_alignment: 1.0,
        }
    }
}

/// State of a validator agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorState {
    pub validated: u64,
    pub rejected: u64,
    /// Highest environment risk the validator still approves
    pub risk_tolerance: f64,
}

impl Default for ValidatorState {
    fn default() -> Self {
        Self {
            validated: 0,
            rejected: 0,
            risk_tolerance: 0.5,
        }
    }
}

/// State of a trader agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderState {
    pub balance: f64,
    pub position: i64,
    /// Price seen in the previous round
    pub last_price: Option<f64>,
}

impl Default for TraderState {
    fn default() -> Self {
        Self {
            balance: 1000.0,
            position: 0,
            last_price: None,
        }
    }
}

/// State of a voter agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoterState {
    pub votes_cast: u64,
    pub approvals: u64,
}

/// Role together with its typed state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RoleState {
    Governance(GovernanceState),
    Validator(ValidatorState),
    Trader(TraderState),
    Voter(VoterState),
}

impl RoleState {
    /// Fresh state for `role`
    pub fn new(role: Role) -> Self {
        match role {
            Role::Governance => RoleState::Governance(GovernanceState::default()),
            Role::Validator => RoleState::Validator(ValidatorState::default()),
            Role::Trader => RoleState::Trader(TraderState::default()),
            Role::Voter => RoleState::Voter(VoterState::default()),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            RoleState::Governance(_) => Role::Governance,
            RoleState::Validator(_) => Role::Validator,
            RoleState::Trader(_) => Role::Trader,
            RoleState::Voter(_) => Role::Voter,
        }
    }
}

impl From<Role> for RoleState {
    fn from(role: Role) -> Self {
        RoleState::new(role)
    }
}
