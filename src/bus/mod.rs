//! Message bus
//!
//! In-memory store-and-forward channel between agents. Supports addressed and
//! broadcast delivery, per-kind listeners, gossip fan-out and two independent
//! sliding-window rate limiters (agent messages, history queries).
//!
//! Broadcasts are tracked per receiver: every agent registered when the
//! message is sent sees it exactly once, and the copy is discarded only after
//! the last of them has polled.

mod message;
mod message_bus;
mod rate_limit;

pub use message::{AgentId, AgentMessage, MessageId, MessageKind, Recipient, MAX_MESSAGE_PRIORITY};
pub use message_bus::{
    select_gossip_targets, BusConfig, BusError, BusStats, GossipReport, HistoryFilter,
    MessageBus, MessageHandler, Result,
};
pub use rate_limit::{LimiterKind, RateLimiter, Throttled};
