//! Sliding-window rate limiter
//!
//! Keeps the timestamps of accepted operations inside a time window. After
//! pruning entries older than the window, the number of retained stamps never
//! exceeds the configured limit.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Which limiter rejected an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// Agent-to-agent messages
    AgentMessages,
    /// Historical data queries
    HistoryQueries,
}

impl fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterKind::AgentMessages => write!(f, "agent_messages"),
            LimiterKind::HistoryQueries => write!(f, "history_queries"),
        }
    }
}

/// Rejection returned by [`RateLimiter::try_acquire_at`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    /// Time until the oldest stamp leaves the window
    pub retry_after: Duration,
}

/// Sliding-window limiter of `limit` operations per `window`
#[derive(Debug, Clone)]
pub struct RateLimiter {
    kind: LimiterKind,
    limit: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter
    pub fn new(kind: LimiterKind, limit: usize, window: Duration) -> Self {
        Self {
            kind,
            limit,
            window,
            stamps: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    pub fn kind(&self) -> LimiterKind {
        self.kind
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Try to record an operation now
    pub fn try_acquire(&mut self) -> Result<(), Throttled> {
        self.try_acquire_at(Instant::now())
    }

    /// Try to record an operation at `now`
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Throttled> {
        self.prune(now);

        if self.stamps.len() >= self.limit {
            let retry_after = self
                .stamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Err(Throttled { retry_after });
        }

        self.stamps.push_back(now);
        Ok(())
    }

    /// Operations still counted against the window at `now`
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }

    /// Remaining capacity at `now`
    pub fn remaining(&mut self, now: Instant) -> usize {
        self.limit.saturating_sub(self.in_window(now))
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}
