//! Bounded per-category action history
//!
//! Every agent keeps one FIFO ring per [`ActionCategory`]. The categories are
//! fixed when the history is created; a ring never grows past its capacity
//! and always evicts its oldest entry first.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Entries retained per category
pub const HISTORY_CAPACITY: usize = 100;

/// Category an action is recorded under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// Outcome of the decision function
    Decision,
    /// Messages the agent tried to send
    Communication,
    /// Ledger submissions
    Ledger,
    /// Role changes
    Governance,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; 4] = [
        ActionCategory::Decision,
        ActionCategory::Communication,
        ActionCategory::Ledger,
        ActionCategory::Governance,
    ];

    fn index(self) -> usize {
        match self {
            ActionCategory::Decision => 0,
            ActionCategory::Communication => 1,
            ActionCategory::Ledger => 2,
            ActionCategory::Governance => 3,
        }
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionCategory::Decision => "decision",
            ActionCategory::Communication => "communication",
            ActionCategory::Ledger => "ledger",
            ActionCategory::Governance => "governance",
        };
        f.write_str(name)
    }
}

/// Result of a recorded action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Rejected,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Rejected => "rejected",
            Outcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the action history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Round the action was taken in
    pub step: u64,
    pub action: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ActionRecord {
    pub fn new(step: u64, action: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            step,
            action: action.into(),
            outcome,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Fixed set of bounded FIFO rings, one per category
#[derive(Debug, Clone, PartialEq)]
pub struct ActionHistory {
    capacity: usize,
    rings: [VecDeque<ActionRecord>; 4],
}

impl Default for ActionHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl ActionHistory {
    /// Create an empty history retaining `capacity` entries per category
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rings: std::array::from_fn(|_| VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest entry when the ring is full
    pub fn record(&mut self, category: ActionCategory, record: ActionRecord) {
        if self.capacity == 0 {
            return;
        }
        let ring = &mut self.rings[category.index()];
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Records of one category, oldest first
    pub fn get(&self, category: ActionCategory) -> &VecDeque<ActionRecord> {
        &self.rings[category.index()]
    }

    /// Most recent record of one category
    pub fn latest(&self, category: ActionCategory) -> Option<&ActionRecord> {
        self.get(category).back()
    }

    pub fn len(&self, category: ActionCategory) -> usize {
        self.get(category).len()
    }

    /// Records across all categories
    pub fn total_len(&self) -> usize {
        self.rings.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Number of records per category
    pub fn counts(&self) -> BTreeMap<ActionCategory, usize> {
        ActionCategory::ALL
            .iter()
            .map(|c| (*c, self.len(*c)))
            .collect()
    }

    /// Copy out the rings keyed by category
    pub fn to_map(&self) -> BTreeMap<ActionCategory, Vec<ActionRecord>> {
        ActionCategory::ALL
            .iter()
            .map(|c| (*c, self.get(*c).iter().cloned().collect()))
            .collect()
    }

    /// Rebuild a history, keeping the newest `capacity` entries of each category
    pub fn from_map(capacity: usize, map: BTreeMap<ActionCategory, Vec<ActionRecord>>) -> Self {
        let mut history = Self::new(capacity);
        for (category, records) in map {
            for record in records {
                history.record(category, record);
            }
        }
        history
    }
}
