//! Message bus - in-memory store-and-forward channel between agents
//!
//! The bus is the only structure with concurrent writers inside a round, so
//! every mutation goes through one async mutex: rate-limit bookkeeping, queue
//! order and counters stay consistent under concurrent senders.
//!
//! # Responsibilities
//!
//! - Rate limit sends (agent messages) and history queries independently
//! - Seal and prove payloads through the secure oracle before enqueue
//! - Deliver direct messages once and broadcasts once per registered receiver
//! - Dispatch received messages to typed listeners
//! - Gossip fan-out to a random subset of peers

use super::message::{AgentId, AgentMessage, MessageId, MessageKind, Recipient};
use super::rate_limit::{LimiterKind, RateLimiter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oracles::SecureOracle;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

/// Message bus errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("rate limit exceeded on {limiter}: {limit} per {window:?}, retry after {retry_after:?}")]
    RateLimitExceeded {
        limiter: LimiterKind,
        limit: usize,
        window: Duration,
        retry_after: Duration,
    },

    #[error("delivery of {message_id} from {sender} failed: {reason}")]
    DeliveryFailure {
        message_id: MessageId,
        sender: AgentId,
        reason: String,
    },
}

/// Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

fn default_agent_message_limit() -> usize {
    1000
}

fn default_history_query_limit() -> usize {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_gossip_fanout() -> usize {
    3
}

fn default_message_log_capacity() -> usize {
    1000
}

/// Bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Agent messages accepted per window
    #[serde(default = "default_agent_message_limit")]
    pub agent_message_limit: usize,

    /// Agent message window in milliseconds
    #[serde(default = "default_window_ms")]
    pub agent_message_window_ms: u64,

    /// History queries accepted per window
    #[serde(default = "default_history_query_limit")]
    pub history_query_limit: usize,

    /// History query window in milliseconds
    #[serde(default = "default_window_ms")]
    pub history_query_window_ms: u64,

    /// Maximum number of gossip receivers per call
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,

    /// Number of sent messages retained for history queries
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            agent_message_limit: default_agent_message_limit(),
            agent_message_window_ms: default_window_ms(),
            history_query_limit: default_history_query_limit(),
            history_query_window_ms: default_window_ms(),
            gossip_fanout: default_gossip_fanout(),
            message_log_capacity: default_message_log_capacity(),
        }
    }
}

impl BusConfig {
    /// Set the agent message limit
    pub fn with_agent_limit(mut self, limit: usize, window: Duration) -> Self {
        self.agent_message_limit = limit;
        self.agent_message_window_ms = window.as_millis() as u64;
        self
    }

    /// Set the history query limit
    pub fn with_history_limit(mut self, limit: usize, window: Duration) -> Self {
        self.history_query_limit = limit;
        self.history_query_window_ms = window.as_millis() as u64;
        self
    }

    /// Set the gossip fanout
    pub fn with_gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    pub fn agent_message_window(&self) -> Duration {
        Duration::from_millis(self.agent_message_window_ms)
    }

    pub fn history_query_window(&self) -> Duration {
        Duration::from_millis(self.history_query_window_ms)
    }
}

/// Counters exposed by [`MessageBus::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages accepted and enqueued
    pub sent: u64,
    /// Accepted messages addressed to every receiver
    pub broadcasts: u64,
    /// Message copies handed to receivers
    pub delivered: u64,
    /// Messages dropped because sealing or proving failed, or because the
    /// receiver was not registered
    pub failed: u64,
    /// Sends and queries rejected by a rate limiter
    pub rate_limited: u64,
    /// Gossip messages accepted
    pub gossip: u64,
    /// Entries still waiting in the queue
    pub queue_depth: usize,
}

/// Filter for [`MessageBus::query_history`]
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub kind: Option<MessageKind>,
    pub sender: Option<AgentId>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, message: &AgentMessage) -> bool {
        self.kind.map_or(true, |k| message.kind == k)
            && self.sender.map_or(true, |s| message.sender == s)
            && self.since.map_or(true, |t| message.timestamp >= t)
    }
}

/// Outcome of a gossip round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GossipReport {
    /// Selected receivers, in send order
    pub targets: Vec<AgentId>,
    /// Messages accepted by the bus
    pub delivered: usize,
    /// Messages rejected (rate limit or delivery failure)
    pub failed: usize,
}

/// Listener invoked for messages of one kind
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &AgentMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&AgentMessage) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, message: &AgentMessage) -> anyhow::Result<()> {
        self(message)
    }
}

/// A queued message and, for broadcasts, the receivers that have not polled it yet
struct QueuedMessage {
    /// Acceptance order, assigned together with the rate-limit stamp
    seq: u64,
    message: AgentMessage,
    waiting: Option<HashSet<AgentId>>,
}

struct BusState {
    queue: VecDeque<QueuedMessage>,
    next_seq: u64,
    receivers: BTreeSet<AgentId>,
    agent_limiter: RateLimiter,
    history_limiter: RateLimiter,
    log: VecDeque<AgentMessage>,
    stats: BusStats,
    failed_by_sender: HashMap<AgentId, u64>,
}

/// The message bus
pub struct MessageBus {
    config: BusConfig,
    oracle: Arc<dyn SecureOracle>,
    state: Mutex<BusState>,
    listeners: RwLock<HashMap<MessageKind, Vec<Arc<dyn MessageHandler>>>>,
}

impl MessageBus {
    /// Create a bus that seals payloads with `oracle`
    pub fn new(config: BusConfig, oracle: Arc<dyn SecureOracle>) -> Self {
        let state = BusState {
            queue: VecDeque::new(),
            next_seq: 0,
            receivers: BTreeSet::new(),
            agent_limiter: RateLimiter::new(
                LimiterKind::AgentMessages,
                config.agent_message_limit,
                config.agent_message_window(),
            ),
            history_limiter: RateLimiter::new(
                LimiterKind::HistoryQueries,
                config.history_query_limit,
                config.history_query_window(),
            ),
            log: VecDeque::with_capacity(config.message_log_capacity.min(4096)),
            stats: BusStats::default(),
            failed_by_sender: HashMap::new(),
        };

        Self {
            config,
            oracle,
            state: Mutex::new(state),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register a receiver for future broadcasts
    pub async fn register_agent(&self, agent: AgentId) {
        self.state.lock().await.receivers.insert(agent);
    }

    /// Remove a receiver
    ///
    /// Direct messages still queued for it are dropped and broadcasts it had
    /// not polled yet are released.
    pub async fn unregister_agent(&self, agent: AgentId) {
        let mut state = self.state.lock().await;
        state.receivers.remove(&agent);
        let before = state.queue.len();
        state.queue.retain_mut(|queued| match queued.waiting.as_mut() {
            Some(waiting) => {
                waiting.remove(&agent);
                !waiting.is_empty()
            }
            None => queued.message.receiver != Recipient::Agent(agent),
        });
        let released = before - state.queue.len();
        if released > 0 {
            debug!(agent = %agent, released, "Queued messages released on unregister");
        }
    }

    /// Currently registered receivers
    pub async fn receivers(&self) -> Vec<AgentId> {
        self.state.lock().await.receivers.iter().copied().collect()
    }

    /// Send a message
    ///
    /// Fails with [`BusError::RateLimitExceeded`] when the agent message
    /// window is full, and with [`BusError::DeliveryFailure`] when a direct
    /// message names an unregistered receiver or the payload could not be
    /// sealed or proved. The bus never retries.
    ///
    /// Messages are queued in acceptance order, even when sealing finishes
    /// out of order for concurrent senders.
    pub async fn send(&self, mut message: AgentMessage) -> Result<MessageId> {
        let (seq, waiting) = {
            let mut state = self.state.lock().await;

            if let Recipient::Agent(receiver) = message.receiver {
                if !state.receivers.contains(&receiver) {
                    state.stats.failed += 1;
                    *state.failed_by_sender.entry(message.sender).or_insert(0) += 1;
                    debug!(
                        id = %message.id,
                        sender = %message.sender,
                        receiver = %receiver,
                        "Message dropped, receiver not registered"
                    );
                    return Err(BusError::DeliveryFailure {
                        message_id: message.id,
                        sender: message.sender,
                        reason: format!("receiver {} is not registered", receiver),
                    });
                }
            }

            if let Err(throttled) = state.agent_limiter.try_acquire() {
                state.stats.rate_limited += 1;
                let limiter = &state.agent_limiter;
                debug!(
                    sender = %message.sender,
                    kind = %message.kind,
                    retry_after_ms = throttled.retry_after.as_millis() as u64,
                    "Send rejected by rate limiter"
                );
                return Err(BusError::RateLimitExceeded {
                    limiter: limiter.kind(),
                    limit: limiter.limit(),
                    window: limiter.window(),
                    retry_after: throttled.retry_after,
                });
            }

            let waiting = match message.receiver {
                Recipient::Broadcast => Some(
                    state
                        .receivers
                        .iter()
                        .copied()
                        .filter(|r| *r != message.sender)
                        .collect::<HashSet<AgentId>>(),
                ),
                Recipient::Agent(_) => None,
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            (seq, waiting)
        };

        let plaintext = match serde_json::to_string(&message.payload) {
            Ok(text) => text,
            Err(e) => return Err(self.record_failure(&message, e.to_string()).await),
        };
        let sealed = match self.oracle.seal(&plaintext).await {
            Ok(sealed) => sealed,
            Err(e) => return Err(self.record_failure(&message, e.to_string()).await),
        };
        let signature = match self.oracle.prove(&sealed).await {
            Ok(proof) => proof,
            Err(e) => return Err(self.record_failure(&message, e.to_string()).await),
        };
        message.sealed = Some(sealed);
        message.signature = Some(signature);

        let id = message.id;
        let mut state = self.state.lock().await;

        // Receivers may have unregistered while the payload was being sealed
        let waiting = waiting.map(|mut waiting| {
            waiting.retain(|r| state.receivers.contains(r));
            waiting
        });
        let deliverable = match (&message.receiver, &waiting) {
            (Recipient::Agent(receiver), _) => state.receivers.contains(receiver),
            (_, Some(waiting)) => !waiting.is_empty(),
            (Recipient::Broadcast, None) => false,
        };
        if message.receiver == Recipient::Broadcast {
            state.stats.broadcasts += 1;
        }

        trace!(
            id = %id,
            sender = %message.sender,
            receiver = %message.receiver,
            kind = %message.kind,
            priority = message.priority,
            "Message enqueued"
        );

        if state.log.len() >= self.config.message_log_capacity {
            state.log.pop_front();
        }
        if self.config.message_log_capacity > 0 {
            state.log.push_back(message.clone());
        }

        if deliverable {
            let slot = state
                .queue
                .iter()
                .rposition(|queued| queued.seq < seq)
                .map_or(0, |p| p + 1);
            state.queue.insert(slot, QueuedMessage { seq, message, waiting });
        }
        state.stats.sent += 1;

        Ok(id)
    }

    async fn record_failure(&self, message: &AgentMessage, reason: String) -> BusError {
        let mut state = self.state.lock().await;
        state.stats.failed += 1;
        *state.failed_by_sender.entry(message.sender).or_insert(0) += 1;

        warn!(
            id = %message.id,
            sender = %message.sender,
            kind = %message.kind,
            reason = %reason,
            "Message dropped, seal/prove failed"
        );

        BusError::DeliveryFailure {
            message_id: message.id,
            sender: message.sender,
            reason,
        }
    }

    /// Remove and return every message waiting for `agent`, in FIFO order
    ///
    /// Direct messages are handed over once. A broadcast is handed to each
    /// receiver that was registered when it was sent, once, and is discarded
    /// after the last of them has polled.
    pub async fn receive(&self, agent: AgentId) -> Vec<AgentMessage> {
        let mut state = self.state.lock().await;
        let queue = std::mem::take(&mut state.queue);
        let mut remaining = VecDeque::with_capacity(queue.len());
        let mut received = Vec::new();

        for mut queued in queue {
            match queued.waiting.as_mut() {
                None => {
                    if queued.message.receiver == Recipient::Agent(agent) {
                        received.push(queued.message);
                        continue;
                    }
                }
                Some(waiting) => {
                    if waiting.remove(&agent) {
                        received.push(queued.message.clone());
                        if waiting.is_empty() {
                            continue;
                        }
                    }
                }
            }
            remaining.push_back(queued);
        }

        state.queue = remaining;
        state.stats.delivered += received.len() as u64;
        received
    }

    /// Number of messages `agent` would get from [`MessageBus::receive`]
    pub async fn pending_for(&self, agent: AgentId) -> usize {
        let state = self.state.lock().await;
        state
            .queue
            .iter()
            .filter(|queued| match &queued.waiting {
                None => queued.message.receiver == Recipient::Agent(agent),
                Some(waiting) => waiting.contains(&agent),
            })
            .count()
    }

    /// Register a listener for one message kind
    ///
    /// Handlers for the same kind run in registration order.
    pub async fn register_listener(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.listeners
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Receive messages for `agent` and dispatch each one to its listeners
    ///
    /// Handlers are awaited one after another. A failing handler is logged
    /// and does not stop the remaining handlers or messages.
    pub async fn process_messages(&self, agent: AgentId) -> Vec<AgentMessage> {
        let messages = self.receive(agent).await;

        for message in &messages {
            let handlers = {
                let listeners = self.listeners.read().await;
                listeners.get(&message.kind).cloned().unwrap_or_default()
            };

            for handler in handlers {
                if let Err(e) = handler.handle(message).await {
                    warn!(
                        agent = %agent,
                        id = %message.id,
                        kind = %message.kind,
                        error = %e,
                        "Message listener failed"
                    );
                }
            }
        }

        messages
    }

    /// Gossip `payload` from `sender` to a random subset of `candidates`
    ///
    /// Fire-and-forget: failures are counted in the report but not returned.
    pub async fn gossip(
        &self,
        sender: AgentId,
        payload: serde_json::Value,
        candidates: &[AgentId],
    ) -> GossipReport {
        let targets = {
            let mut rng = rand::thread_rng();
            select_gossip_targets(sender, candidates, self.config.gossip_fanout, &mut rng)
        };

        let mut report = GossipReport {
            targets: targets.clone(),
            ..Default::default()
        };

        for target in targets {
            let message = AgentMessage::direct(MessageKind::Gossip, sender, target, payload.clone());
            match self.send(message).await {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    debug!(sender = %sender, target = %target, error = %e, "Gossip send failed");
                    report.failed += 1;
                }
            }
        }

        if report.delivered > 0 {
            self.state.lock().await.stats.gossip += report.delivered as u64;
        }

        report
    }

    /// Query recently sent messages, oldest first
    ///
    /// Guarded by the history query limiter.
    pub async fn query_history(&self, filter: &HistoryFilter) -> Result<Vec<AgentMessage>> {
        let mut state = self.state.lock().await;

        if let Err(throttled) = state.history_limiter.try_acquire() {
            state.stats.rate_limited += 1;
            let limiter = &state.history_limiter;
            return Err(BusError::RateLimitExceeded {
                limiter: limiter.kind(),
                limit: limiter.limit(),
                window: limiter.window(),
                retry_after: throttled.retry_after,
            });
        }

        let mut matches: Vec<AgentMessage> = state
            .log
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }

        Ok(matches)
    }

    /// Snapshot of the bus counters
    pub async fn stats(&self) -> BusStats {
        let state = self.state.lock().await;
        BusStats {
            queue_depth: state.queue.len(),
            ..state.stats.clone()
        }
    }

    /// Messages from `sender` dropped because of delivery failures
    pub async fn failed_messages(&self, sender: AgentId) -> u64 {
        self.state
            .lock()
            .await
            .failed_by_sender
            .get(&sender)
            .copied()
            .unwrap_or(0)
    }
}

/// Pick up to `fanout` distinct receivers from `candidates`, never `sender`
pub fn select_gossip_targets<R: Rng + ?Sized>(
    sender: AgentId,
    candidates: &[AgentId],
    fanout: usize,
    rng: &mut R,
) -> Vec<AgentId> {
    let mut pool: Vec<AgentId> = candidates
        .iter()
        .copied()
        .filter(|id| *id != sender)
        .collect();
    pool.sort_unstable();
    pool.dedup();

    let count = fanout.min(pool.len());
    pool.choose_multiple(rng, count).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracles::{EnclaveOracle, PassthroughOracle};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn id(n: u64) -> AgentId {
        AgentId::new(n)
    }

    fn test_bus(config: BusConfig) -> MessageBus {
        MessageBus::new(config, Arc::new(PassthroughOracle))
    }

    async fn bus_with_receivers(bus: MessageBus, receivers: &[u64]) -> MessageBus {
        for n in receivers {
            bus.register_agent(id(*n)).await;
        }
        bus
    }

    #[tokio::test]
    async fn test_direct_message_delivered_once() {
        let bus = bus_with_receivers(test_bus(BusConfig::default()), &[2, 3]).await;

        bus.send(AgentMessage::direct(
            MessageKind::StateUpdate,
            id(1),
            id(2),
            json!({ "balance": 10 }),
        ))
        .await
        .unwrap();

        assert!(bus.receive(id(3)).await.is_empty());
        let inbox = bus.receive(id(2)).await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].sender, id(1));
        assert!(bus.receive(id(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_registered_receiver() {
        let bus = test_bus(BusConfig::default());
        for n in 1..=3 {
            bus.register_agent(id(n)).await;
        }

        bus.send(AgentMessage::broadcast(
            MessageKind::DecisionShare,
            id(1),
            json!("approve"),
        ))
        .await
        .unwrap();

        // The sender does not receive its own broadcast
        assert!(bus.receive(id(1)).await.is_empty());

        assert_eq!(bus.receive(id(2)).await.len(), 1);
        assert_eq!(bus.stats().await.queue_depth, 1);
        assert!(bus.receive(id(2)).await.is_empty());

        assert_eq!(bus.receive(id(3)).await.len(), 1);
        assert_eq!(bus.stats().await.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_broadcast_ignores_receivers_registered_later() {
        let bus = test_bus(BusConfig::default());
        bus.register_agent(id(2)).await;

        bus.send(AgentMessage::broadcast(MessageKind::Alert, id(1), json!(null)))
            .await
            .unwrap();
        bus.register_agent(id(3)).await;

        assert!(bus.receive(id(3)).await.is_empty());
        assert_eq!(bus.receive(id(2)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_releases_pending_broadcasts() {
        let bus = test_bus(BusConfig::default());
        bus.register_agent(id(2)).await;
        bus.register_agent(id(3)).await;

        bus.send(AgentMessage::broadcast(MessageKind::Alert, id(1), json!(null)))
            .await
            .unwrap();
        bus.receive(id(2)).await;
        bus.unregister_agent(id(3)).await;

        assert_eq!(bus.stats().await.queue_depth, 0);
        assert_eq!(bus.receivers().await, vec![id(2)]);
    }

    #[tokio::test]
    async fn test_unregister_drops_direct_messages() {
        let bus = bus_with_receivers(test_bus(BusConfig::default()), &[2, 3]).await;

        for n in 0..5 {
            bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(n)))
                .await
                .unwrap();
        }
        bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(3), json!("kept")))
            .await
            .unwrap();
        assert_eq!(bus.stats().await.queue_depth, 6);

        bus.unregister_agent(id(2)).await;

        assert_eq!(bus.stats().await.queue_depth, 1);
        assert_eq!(bus.pending_for(id(2)).await, 0);
        assert_eq!(bus.receive(id(3)).await[0].payload, json!("kept"));
        assert_eq!(bus.stats().await.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_direct_message_to_unregistered_receiver_is_rejected() {
        let bus = bus_with_receivers(test_bus(BusConfig::default()), &[2]).await;

        let err = bus
            .send(AgentMessage::direct(MessageKind::Gossip, id(1), id(99), json!(null)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BusError::DeliveryFailure { ref reason, .. } if reason.contains("not registered")
        ));
        assert_eq!(bus.failed_messages(id(1)).await, 1);

        let stats = bus.stats().await;
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queue_depth, 0);
    }

    /// Holds the seal of payload `0` until released
    struct GatedOracle {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SecureOracle for GatedOracle {
        fn name(&self) -> &str {
            "gated"
        }

        async fn seal(&self, plaintext: &str) -> oracles::Result<String> {
            if plaintext == "0" {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(plaintext.to_string())
        }

        async fn prove(&self, data: &str) -> oracles::Result<String> {
            Ok(data.to_string())
        }
    }

    #[tokio::test]
    async fn test_queue_follows_acceptance_order() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let oracle = GatedOracle {
            entered: entered.clone(),
            release: release.clone(),
        };
        let bus = Arc::new(MessageBus::new(BusConfig::default(), Arc::new(oracle)));
        bus.register_agent(id(2)).await;

        let first = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(0)))
                    .await
            }
        });
        entered.notified().await;

        // Accepted second, sealed first
        bus.send(AgentMessage::direct(MessageKind::Gossip, id(3), id(2), json!(1)))
            .await
            .unwrap();
        release.notify_one();
        first.await.unwrap().unwrap();

        let payloads: Vec<_> = bus
            .receive(id(2))
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec![json!(0), json!(1)]);
    }

    #[tokio::test]
    async fn test_receive_preserves_fifo_order() {
        let bus = test_bus(BusConfig::default());
        bus.register_agent(id(2)).await;

        for n in 0..5 {
            let msg = if n % 2 == 0 {
                AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(n))
            } else {
                AgentMessage::broadcast(MessageKind::StateUpdate, id(1), json!(n))
            };
            bus.send(msg).await.unwrap();
        }

        let payloads: Vec<_> = bus
            .receive(id(2))
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_payload_is_sealed_and_signed() {
        let bus = MessageBus::new(BusConfig::default(), Arc::new(EnclaveOracle::new()));
        bus.register_agent(id(2)).await;

        bus.send(AgentMessage::direct(
            MessageKind::DecisionShare,
            id(1),
            id(2),
            json!("approve"),
        ))
        .await
        .unwrap();

        let msg = bus.receive(id(2)).await.remove(0);
        assert_eq!(msg.payload, json!("approve"));
        assert_eq!(msg.sealed.as_deref(), Some("\"evorppa\""));
        assert_eq!(msg.signature.as_ref().map(String::len), Some(64));
    }

    #[tokio::test]
    async fn test_seal_failure_drops_message() {
        let oracle = EnclaveOracle::new().with_max_input(8);
        let bus = MessageBus::new(BusConfig::default(), Arc::new(oracle));
        bus.register_agent(id(2)).await;

        let err = bus
            .send(AgentMessage::direct(
                MessageKind::StateUpdate,
                id(1),
                id(2),
                json!({ "too": "long for the enclave" }),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::DeliveryFailure { sender, .. } if sender == id(1)));
        assert_eq!(bus.failed_messages(id(1)).await, 1);
        assert_eq!(bus.failed_messages(id(2)).await, 0);

        let stats = bus.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.sent, 0);
        assert!(bus.receive(id(2)).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_and_window_recovery() {
        let config = BusConfig::default().with_agent_limit(5, Duration::from_millis(1000));
        let bus = bus_with_receivers(test_bus(config), &[2]).await;

        for n in 0..5 {
            bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(n)))
                .await
                .unwrap();
        }

        let err = bus
            .send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(5)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::RateLimitExceeded {
                limiter: LimiterKind::AgentMessages,
                limit: 5,
                ..
            }
        ));
        assert_eq!(bus.stats().await.rate_limited, 1);

        tokio::time::advance(Duration::from_millis(1000)).await;

        bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(6)))
            .await
            .unwrap();
        assert_eq!(bus.receive(id(2)).await.len(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_senders_respect_limit() {
        let config = BusConfig::default().with_agent_limit(50, Duration::from_secs(60));
        let bus = Arc::new(bus_with_receivers(test_bus(config), &[999]).await);

        let sends = (0..80u64).map(|n| {
            let bus = bus.clone();
            async move {
                bus.send(AgentMessage::direct(
                    MessageKind::StateUpdate,
                    id(n + 1),
                    id(999),
                    json!(n),
                ))
                .await
            }
        });
        let results = futures::future::join_all(sends).await;

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 50);
        assert_eq!(bus.receive(id(999)).await.len(), 50);
        assert_eq!(bus.stats().await.rate_limited, 30);
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let bus = bus_with_receivers(test_bus(BusConfig::default()), &[2]).await;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            bus.register_listener(
                MessageKind::Alert,
                Arc::new(move |_msg: &AgentMessage| -> anyhow::Result<()> {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }),
            )
            .await;
        }

        bus.send(AgentMessage::direct(MessageKind::Alert, id(1), id(2), json!(null)))
            .await
            .unwrap();
        bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(null)))
            .await
            .unwrap();

        let processed = bus.process_messages(id(2)).await;
        assert_eq!(processed.len(), 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_dispatch() {
        let bus = bus_with_receivers(test_bus(BusConfig::default()), &[2]).await;
        let calls = Arc::new(AtomicUsize::new(0));

        bus.register_listener(
            MessageKind::Alert,
            Arc::new(|_msg: &AgentMessage| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("listener exploded"))
            }),
        )
        .await;
        let counter = calls.clone();
        bus.register_listener(
            MessageKind::Alert,
            Arc::new(move |_msg: &AgentMessage| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await;

        for _ in 0..2 {
            bus.send(AgentMessage::direct(MessageKind::Alert, id(1), id(2), json!(null)))
                .await
                .unwrap();
        }

        bus.process_messages(id(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gossip_fanout_excludes_sender() {
        let bus = bus_with_receivers(test_bus(BusConfig::default()), &[2, 3, 4, 5]).await;
        let candidates = [id(2), id(3), id(4), id(5)];

        let report = bus.gossip(id(1), json!("rumor"), &candidates).await;
        assert_eq!(report.targets.len(), 3);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed, 0);

        let distinct: HashSet<_> = report.targets.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert!(!report.targets.contains(&id(1)));

        let mut receivers = 0;
        for candidate in candidates {
            let inbox = bus.receive(candidate).await;
            assert!(inbox.len() <= 1);
            receivers += inbox.len();
        }
        assert_eq!(receivers, 3);
        assert_eq!(bus.stats().await.gossip, 3);
    }

    #[test]
    fn test_select_gossip_targets_small_pool() {
        let mut rng = StdRng::seed_from_u64(7);

        let targets = select_gossip_targets(id(1), &[id(1), id(2), id(2)], 3, &mut rng);
        assert_eq!(targets, vec![id(2)]);

        let none = select_gossip_targets(id(1), &[id(1)], 3, &mut rng);
        assert!(none.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_query_uses_its_own_limiter() {
        let config = BusConfig::default()
            .with_agent_limit(100, Duration::from_secs(60))
            .with_history_limit(2, Duration::from_secs(60));
        let bus = bus_with_receivers(test_bus(config), &[2]).await;

        for n in 0..4 {
            let kind = if n % 2 == 0 {
                MessageKind::DecisionShare
            } else {
                MessageKind::Alert
            };
            bus.send(AgentMessage::direct(kind, id(1), id(2), json!(n)))
                .await
                .unwrap();
        }

        let shares = bus
            .query_history(&HistoryFilter::default().kind(MessageKind::DecisionShare))
            .await
            .unwrap();
        assert_eq!(shares.len(), 2);

        let newest = bus
            .query_history(&HistoryFilter::default().limit(1))
            .await
            .unwrap();
        assert_eq!(newest[0].payload, json!(3));

        assert!(matches!(
            bus.query_history(&HistoryFilter::default()).await,
            Err(BusError::RateLimitExceeded {
                limiter: LimiterKind::HistoryQueries,
                ..
            })
        ));

        // Agent messages are unaffected by the history limiter
        bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(null)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_message_log_is_bounded() {
        let mut config = BusConfig::default();
        config.message_log_capacity = 3;
        let bus = bus_with_receivers(test_bus(config), &[2]).await;

        for n in 0..10 {
            bus.send(AgentMessage::direct(MessageKind::Gossip, id(1), id(2), json!(n)))
                .await
                .unwrap();
        }

        let log = bus.query_history(&HistoryFilter::default()).await.unwrap();
        let payloads: Vec<_> = log.into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![json!(7), json!(8), json!(9)]);
    }
}
