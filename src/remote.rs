// src/remote.rs
// Capability interfaces the orchestrator consumes, plus the wire types they
// exchange. The HTTP adapter lives in api_client.rs; tests plug in mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// ------------------ Challenge ------------------

/// One mining round. Immutable once observed, identified by `challenge_id`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub challenge_id: String,
    /// 8-hex-char bitmask the digest prefix is checked against.
    pub difficulty: String,
    /// ROM seed material for the keyed hash.
    pub no_pre_mine: String,
    pub latest_submission: String,
    pub no_pre_mine_hour: String,
    pub day: Option<u32>,
    pub challenge_number: Option<u32>,
}

/// What the remote reports when asked for the current challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeStatus {
    /// Challenges have not started yet; workers idle.
    Before { starts_at: Option<String> },
    Active(Challenge),
    /// `active` code but the payload was missing fields; poll again before
    /// propagating anything.
    ActiveIncomplete,
    /// Season is over; workers idle.
    After,
}

/// ------------------ Submission ------------------

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CryptoReceipt {
    pub preimage: String,
    pub timestamp: String,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub enum RejectKind {
    Duplicate,
    InvalidNonce,
    ExpiredChallenge,
    Other(String),
}

#[derive(Debug, Clone)]
pub enum TransientKind {
    Network(String),
    ServerError(u16),
    Timeout,
}

/// Classified result of one submission attempt.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted { receipt: Option<CryptoReceipt> },
    Rejected(RejectKind),
    Transient(TransientKind),
}

/// ------------------ Registration ------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

/// ------------------ Stats view ------------------

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AddressSubmissions {
    pub count: u64,
    pub last: Option<String>,
    pub challenges: Vec<String>,
}

/// ------------------ Capabilities ------------------

/// Challenge and solution endpoint of the remote service.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn get_challenge(&self) -> Result<ChallengeStatus, RemoteError>;

    /// Submits a solution; network failures come back as
    /// `SubmitOutcome::Transient` so the submitter owns all retry policy.
    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce: &str) -> SubmitOutcome;

    /// Optional per-address stats view; adapters without one return default.
    async fn get_address_submissions(&self, address: &str) -> Result<AddressSubmissions, RemoteError>;
}

/// T&C acceptance recording for one address.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// The message to sign. Cached by the adapter.
    async fn tandc_message(&self) -> Result<String, RemoteError>;

    async fn register(
        &self,
        address: &str,
        signature_hex: &str,
        pubkey_hex: &str,
    ) -> Result<RegisterOutcome, RemoteError>;
}

/// Supplies the developer address for dev-fee submissions. `None` means the
/// feature is effectively disabled.
#[async_trait]
pub trait DevFeeSource: Send + Sync {
    async fn dev_address(&self) -> Option<String>;
}

/// ------------------ Receipt sink ------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SolutionReceipt {
    pub address: String,
    pub address_index: Option<u32>,
    pub challenge_id: String,
    pub nonce: String,
    pub timestamp: String,
    pub receipt_signature: Option<String>,
    pub dev_fee: bool,
}

#[derive(Debug, Serialize, Clone)]
pub struct HashrateSample {
    pub hash_rate: f64,
    pub workers_active: u32,
    pub timestamp: String,
}

/// Where accepted solutions and rate samples go. Failures are logged, never
/// propagated: persistence lives outside the core.
#[async_trait]
pub trait ReceiptSink: Send + Sync {
    async fn record_solution(&self, receipt: &SolutionReceipt);
    async fn record_hashrate(&self, sample: &HashrateSample);
}

/// No-op sink for setups that do not persist anything.
pub struct NullSink;

#[async_trait]
impl ReceiptSink for NullSink {
    async fn record_solution(&self, _receipt: &SolutionReceipt) {}
    async fn record_hashrate(&self, _sample: &HashrateSample) {}
}
