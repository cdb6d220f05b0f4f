//! Shared environment snapshot
//!
//! The engine owns one [`Environment`] and advances it at the start of every
//! round. Agents only ever see it through a shared reference.

use crate::bus::AgentId;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment key holding the current asset price
pub const PRICE_KEY: &str = "price";

/// Environment key holding the current risk level (0.0-1.0)
pub const RISK_KEY: &str = "risk";

/// World state shared by every agent during a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    round: u64,
    timestamp: DateTime<Utc>,
    leader: Option<AgentId>,
    #[serde(default)]
    values: BTreeMap<String, serde_json::Value>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self {
            round: 0,
            timestamp: Utc::now(),
            leader: None,
            values: BTreeMap::new(),
        }
    }

    /// Rounds started so far
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Leader elected for the current round
    pub fn leader(&self) -> Option<AgentId> {
        self.leader
    }

    pub(crate) fn set_leader(&mut self, leader: Option<AgentId>) {
        self.leader = leader;
    }

    /// Move to the next round
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.round += 1;
        self.timestamp = now;
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Numeric value stored under `key`
    pub fn number(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(serde_json::Value::as_f64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn values(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.values
    }
}

/// Mutates the environment once per round, after the round counter moved
///
/// An error aborts the round and is surfaced as a scheduler failure.
pub trait EnvironmentDriver: Send + Sync {
    fn name(&self) -> &str;

    fn advance(&mut self, environment: &mut Environment) -> anyhow::Result<()>;
}

/// Driver that leaves everything but the round counter untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDriver;

impl EnvironmentDriver for StaticDriver {
    fn name(&self) -> &str {
        "static"
    }

    fn advance(&mut self, _environment: &mut Environment) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Seeded random-walk price with a risk level derived from the last move
#[derive(Debug, Clone)]
pub struct MarketDriver {
    rng: StdRng,
    price: f64,
    volatility: f64,
}

impl MarketDriver {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            price: 100.0,
            volatility: 0.05,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility;
        self
    }
}

impl EnvironmentDriver for MarketDriver {
    fn name(&self) -> &str {
        "market"
    }

    fn advance(&mut self, environment: &mut Environment) -> anyhow::Result<()> {
        let change = if self.volatility > 0.0 {
            self.rng.gen_range(-self.volatility..=self.volatility)
        } else {
            0.0
        };
        let next = self.price * (1.0 + change);
        if !next.is_finite() || next <= 0.0 {
            anyhow::bail!("price left the valid range: {}", next);
        }
        self.price = next;

        let risk = if self.volatility > 0.0 {
            (change.abs() / self.volatility).clamp(0.0, 1.0)
        } else {
            0.0
        };

        environment.set(PRICE_KEY, self.price);
        environment.set(RISK_KEY, risk);
        Ok(())
    }
}
