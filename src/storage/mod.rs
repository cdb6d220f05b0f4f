//! Storage layer
//!
//! Versioned agent-state records and the stores that persist them. The
//! runtime itself never touches disk; the CLI and embedding applications
//! decide when to snapshot and restore.

mod jsonl;

pub use jsonl::{read_records, write_records, JsonlReader, JsonlStore, JsonlWriter};

use crate::bus::AgentId;
use crate::swarm::{ActionCategory, ActionRecord, RoleState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current agent record format version
pub const RECORD_VERSION: u32 = 1;

fn default_version() -> u32 {
    RECORD_VERSION
}

/// Persisted state of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Format version (for backwards compatibility)
    #[serde(default = "default_version")]
    pub version: u32,

    pub id: AgentId,

    /// Role and its typed state
    pub role_state: RoleState,

    pub priority: u32,

    /// Opaque key/value state
    #[serde(default)]
    pub state: BTreeMap<String, serde_json::Value>,

    /// Bounded action history per category
    #[serde(default)]
    pub history: BTreeMap<ActionCategory, Vec<ActionRecord>>,

    pub saved_at: DateTime<Utc>,
}

/// Persistence backend for agent records
pub trait StateStore {
    /// Replace the stored records
    fn save_all(&self, records: &[AgentRecord]) -> crate::Result<()>;

    /// Load every stored record
    fn load_all(&self) -> crate::Result<Vec<AgentRecord>>;
}
