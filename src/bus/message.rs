//! Agent message types
//!
//! Defines the envelope exchanged between agents, swarms and the engine.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Highest advisory message priority
pub const MAX_MESSAGE_PRIORITY: u8 = 10;

/// Unique, immutable agent identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(u64);

impl AgentId {
    /// Sender id used by the engine and swarm coordinators
    pub const SYSTEM: AgentId = AgentId(0);

    /// Create an agent id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the reserved system id
    pub const fn is_system(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for AgentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            write!(f, "system")
        } else {
            write!(f, "agent-{}", self.0)
        }
    }
}

/// Unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Allocate the next message id
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Closed set of message categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// An agent published part of its state
    StateUpdate,
    /// An agent shared the decision it took this round
    DecisionShare,
    /// A swarm coordinator published aggregate feedback
    SwarmFeedback,
    /// Ask peers to vote on a proposal
    ConsensusRequest,
    /// Vote or consensus outcome
    ConsensusResponse,
    /// Randomized fan-out dissemination
    Gossip,
    /// Engine or agent alert
    Alert,
}

impl MessageKind {
    /// Every message kind, in declaration order
    pub const ALL: [MessageKind; 7] = [
        MessageKind::StateUpdate,
        MessageKind::DecisionShare,
        MessageKind::SwarmFeedback,
        MessageKind::ConsensusRequest,
        MessageKind::ConsensusResponse,
        MessageKind::Gossip,
        MessageKind::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::StateUpdate => "state_update",
            MessageKind::DecisionShare => "decision_share",
            MessageKind::SwarmFeedback => "swarm_feedback",
            MessageKind::ConsensusRequest => "consensus_request",
            MessageKind::ConsensusResponse => "consensus_response",
            MessageKind::Gossip => "gossip",
            MessageKind::Alert => "alert",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single agent
    Agent(AgentId),
    /// Every receiver registered with the bus when the message is sent
    Broadcast,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Agent(id) => write!(f, "{}", id),
            Recipient::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Message exchanged over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique message ID
    pub id: MessageId,

    /// Message category
    pub kind: MessageKind,

    /// Sending agent (or [`AgentId::SYSTEM`])
    pub sender: AgentId,

    /// Destination
    pub receiver: Recipient,

    /// Plaintext payload as handed to the bus
    pub payload: serde_json::Value,

    /// When the message was created
    pub timestamp: DateTime<Utc>,

    /// Advisory priority (0-10); logged only, never reorders delivery
    pub priority: u8,

    /// Payload as sealed by the secure oracle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed: Option<String>,

    /// Proof over the sealed payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AgentMessage {
    /// Create a new message
    pub fn new(
        kind: MessageKind,
        sender: AgentId,
        receiver: Recipient,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::next(),
            kind,
            sender,
            receiver,
            payload,
            timestamp: Utc::now(),
            priority: 5,
            sealed: None,
            signature: None,
        }
    }

    /// Create a message addressed to one agent
    pub fn direct(
        kind: MessageKind,
        sender: AgentId,
        to: AgentId,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(kind, sender, Recipient::Agent(to), payload)
    }

    /// Create a broadcast message
    pub fn broadcast(kind: MessageKind, sender: AgentId, payload: serde_json::Value) -> Self {
        Self::new(kind, sender, Recipient::Broadcast, payload)
    }

    /// Set the advisory priority, clamped to 0-10
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_MESSAGE_PRIORITY);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver == Recipient::Broadcast
    }

    /// Whether `agent` is a valid receiver of this message
    pub fn is_addressed_to(&self, agent: AgentId) -> bool {
        match self.receiver {
            Recipient::Agent(id) => id == agent,
            Recipient::Broadcast => true,
        }
    }

    /// Deserialize the payload into a typed structure
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}
