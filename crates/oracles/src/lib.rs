//! External collaborator contracts for agent simulations
//!
//! The coordination runtime treats sealing, proving and ledger submission as
//! black boxes. This crate defines those contracts and ships small reference
//! implementations that are deterministic enough to log and compare.
//!
//! # Example
//!
//! ```no_run
//! use oracles::{EnclaveOracle, Ledger, MemoryLedger, SecureOracle};
//!
//! # async fn demo() -> oracles::Result<()> {
//! let oracle = EnclaveOracle::new();
//! let sealed = oracle.seal("approve").await?;
//! let proof = oracle.prove(&sealed).await?;
//!
//! let ledger = MemoryLedger::new(["mainnet"]);
//! let tx = ledger.submit("approve", "mainnet").await;
//! assert!(!oracles::is_failed_tx(&tx));
//! # let _ = proof;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::Mutex;

/// Transaction hash returned by a ledger when a submission fails
pub const FAILED_TX_HASH: &str = "0x0";

/// Errors raised by oracle implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("seal failed: {0}")]
    SealFailed(String),

    #[error("proof failed: {0}")]
    ProofFailed(String),

    #[error("unknown chain: {0}")]
    UnknownChain(String),
}

/// Result type for oracle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Returns true when a ledger answered with the failure sentinel
pub fn is_failed_tx(hash: &str) -> bool {
    hash.is_empty() || hash == FAILED_TX_HASH
}

/// Trusted-execution sealing and proof generation
#[async_trait]
pub trait SecureOracle: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Seal a plaintext into an opaque ciphertext
    async fn seal(&self, plaintext: &str) -> Result<String>;

    /// Produce a proof over `data`
    async fn prove(&self, data: &str) -> Result<String>;
}

/// Ledger submission
///
/// Implementations never fail loudly: a rejected submission answers
/// [`FAILED_TX_HASH`] and callers interpret the sentinel.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Submit an action on a chain, returning the transaction hash
    async fn submit(&self, action: &str, chain: &str) -> String;
}

fn sha256_hex(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

/// Enclave-style oracle
///
/// Sealing reverses the plaintext character order, which is what the enclave
/// routine of the reference deployment does. Proofs are SHA-256 digests.
#[derive(Debug, Clone, Default)]
pub struct EnclaveOracle {
    /// Largest plaintext the enclave accepts, in bytes
    max_input: Option<usize>,
}

impl EnclaveOracle {
    /// Create an enclave oracle without an input limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject plaintexts larger than `max_input` bytes
    pub fn with_max_input(mut self, max_input: usize) -> Self {
        self.max_input = Some(max_input);
        self
    }

    /// Invert [`SecureOracle::seal`]
    pub fn unseal(&self, ciphertext: &str) -> String {
        ciphertext.chars().rev().collect()
    }

    fn check_len(&self, input: &str) -> std::result::Result<(), String> {
        match self.max_input {
            Some(max) if input.len() > max => Err(format!(
                "input of {} bytes exceeds enclave limit of {} bytes",
                input.len(),
                max
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SecureOracle for EnclaveOracle {
    fn name(&self) -> &str {
        "enclave"
    }

    async fn seal(&self, plaintext: &str) -> Result<String> {
        self.check_len(plaintext).map_err(Error::SealFailed)?;
        Ok(plaintext.chars().rev().collect())
    }

    async fn prove(&self, data: &str) -> Result<String> {
        self.check_len(data).map_err(Error::ProofFailed)?;
        Ok(sha256_hex(data))
    }
}

/// Oracle that returns its input unchanged and never signs
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughOracle;

#[async_trait]
impl SecureOracle for PassthroughOracle {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn seal(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    async fn prove(&self, data: &str) -> Result<String> {
        Ok(data.to_string())
    }
}

/// A transaction accepted by [`MemoryLedger`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash (0x-prefixed SHA-256)
    pub hash: String,
    /// Chain the action was submitted on
    pub chain: String,
    /// Submitted action
    pub action: String,
    /// Position in the ledger
    pub nonce: u64,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
}

/// In-process ledger that accepts submissions on a fixed set of chains
#[derive(Debug, Default)]
pub struct MemoryLedger {
    chains: HashSet<String>,
    transactions: Mutex<Vec<Transaction>>,
}

impl MemoryLedger {
    /// Create a ledger accepting the given chains
    pub fn new<I, S>(chains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chains: chains.into_iter().map(Into::into).collect(),
            transactions: Mutex::new(Vec::new()),
        }
    }

    /// Whether submissions on `chain` are accepted
    pub fn accepts(&self, chain: &str) -> bool {
        self.chains.contains(chain)
    }

    /// All accepted transactions, oldest first
    pub async fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().await.clone()
    }

    /// Number of accepted transactions
    pub async fn len(&self) -> usize {
        self.transactions.lock().await.len()
    }

    /// Whether no transaction has been accepted yet
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn name(&self) -> &str {
        "memory"
    }

    async fn submit(&self, action: &str, chain: &str) -> String {
        if !self.accepts(chain) || action.is_empty() {
            return FAILED_TX_HASH.to_string();
        }

        let mut transactions = self.transactions.lock().await;
        let nonce = transactions.len() as u64;
        let hash = format!("0x{}", sha256_hex(&format!("{}:{}:{}", chain, nonce, action)));

        transactions.push(Transaction {
            hash: hash.clone(),
            chain: chain.to_string(),
            action: action.to_string(),
            nonce,
            submitted_at: Utc::now(),
        });

        hash
    }
}

/// Ledger that rejects every submission
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLedger;

#[async_trait]
impl Ledger for NullLedger {
    fn name(&self) -> &str {
        "none"
    }

    async fn submit(&self, _action: &str, _chain: &str) -> String {
        FAILED_TX_HASH.to_string()
    }
}
