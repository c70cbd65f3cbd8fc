// src/test_utils.rs
// In-memory capability implementations for scheduler and control tests.
// Compiled into the library so integration tests can drive the full core
// without a network or a real ROM.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{RemoteError, WalletError};
use crate::events::EventBus;
use crate::hash_service::{AdaptiveParams, HashEngine, HashService, MarkerEngine};
use crate::orchestrator::{CoreServices, CoreTuning, Miner};
use crate::registry::ADDRESS_WINDOW;
use crate::remote::{
    AddressSubmissions, Challenge, ChallengeStatus, DevFeeSource, HashrateSample, ReceiptSink,
    RegisterOutcome, Registrar, RejectKind, RemoteGateway, SolutionReceipt, SubmitOutcome,
};
use crate::stability::StabilityParams;
use crate::wallet::{DerivedAddress, SignedMessage, Signer, SignerProvider};

pub fn test_challenge(id: &str) -> Challenge {
    Challenge {
        challenge_id: id.to_string(),
        difficulty: "00ffffff".to_string(),
        no_pre_mine: format!("seed-{}", id),
        latest_submission: "2026-12-31T00:00:00Z".to_string(),
        no_pre_mine_hour: "hour".to_string(),
        day: Some(1),
        challenge_number: Some(1),
    }
}

/// Gateway with a switchable challenge and scripted submission behavior.
pub struct MockGateway {
    status: Mutex<ChallengeStatus>,
    /// Addresses whose submissions always come back 408.
    pub flaky_addresses: Mutex<HashSet<String>>,
    /// Addresses that report "already solved".
    pub duplicate_addresses: Mutex<HashSet<String>>,
    pub accepted: Mutex<Vec<(String, String, String)>>,
    pub submissions: AtomicU64,
}

impl MockGateway {
    pub fn new(status: ChallengeStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(status),
            flaky_addresses: Mutex::new(HashSet::new()),
            duplicate_addresses: Mutex::new(HashSet::new()),
            accepted: Mutex::new(Vec::new()),
            submissions: AtomicU64::new(0),
        })
    }

    pub fn set_status(&self, status: ChallengeStatus) {
        *self.status.lock() = status;
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().len()
    }

    pub fn accepted_addresses(&self) -> Vec<String> {
        self.accepted.lock().iter().map(|(a, _, _)| a.clone()).collect()
    }
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn get_challenge(&self) -> Result<ChallengeStatus, RemoteError> {
        Ok(self.status.lock().clone())
    }

    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce: &str) -> SubmitOutcome {
        self.submissions.fetch_add(1, Ordering::Relaxed);
        if self.flaky_addresses.lock().contains(address) {
            return SubmitOutcome::Transient(crate::remote::TransientKind::Timeout);
        }
        if self.duplicate_addresses.lock().contains(address) {
            return SubmitOutcome::Rejected(RejectKind::Duplicate);
        }
        let mut accepted = self.accepted.lock();
        if accepted
            .iter()
            .any(|(a, c, _)| a == address && c == challenge_id)
        {
            return SubmitOutcome::Rejected(RejectKind::Duplicate);
        }
        accepted.push((address.to_string(), challenge_id.to_string(), nonce.to_string()));
        SubmitOutcome::Accepted { receipt: None }
    }

    async fn get_address_submissions(&self, _address: &str) -> Result<AddressSubmissions, RemoteError> {
        Ok(AddressSubmissions::default())
    }
}

/// Registrar that accepts everything and remembers what it saw.
#[derive(Default)]
pub struct MockRegistrar {
    pub registered: Mutex<Vec<String>>,
}

#[async_trait]
impl Registrar for MockRegistrar {
    async fn tandc_message(&self) -> Result<String, RemoteError> {
        Ok("I accept the terms".to_string())
    }

    async fn register(
        &self,
        address: &str,
        _signature_hex: &str,
        _pubkey_hex: &str,
    ) -> Result<RegisterOutcome, RemoteError> {
        self.registered.lock().push(address.to_string());
        Ok(RegisterOutcome::Registered)
    }
}

pub struct MockDevFee {
    pub address: Option<String>,
    pub requests: AtomicU64,
}

#[async_trait]
impl DevFeeSource for MockDevFee {
    async fn dev_address(&self) -> Option<String> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.address.clone()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub receipts: Mutex<Vec<SolutionReceipt>>,
}

#[async_trait]
impl ReceiptSink for RecordingSink {
    async fn record_solution(&self, receipt: &SolutionReceipt) {
        self.receipts.lock().push(receipt.clone());
    }

    async fn record_hashrate(&self, _sample: &HashrateSample) {}
}

/// Deterministic signer: addresses carry their index in the bech32 so test
/// assertions can read them back.
pub struct StubSigner;

impl Signer for StubSigner {
    fn derive_window(&self, offset: u32, width: u32) -> Result<Vec<DerivedAddress>, WalletError> {
        let start = offset * width;
        Ok((start..start + width)
            .map(|i| DerivedAddress {
                index: i,
                bech32: format!("addr1qtest{:06}", i),
                pubkey_hex: format!("{:064x}", i),
            })
            .collect())
    }

    fn sign_message(&self, index: u32, _message: &str) -> Result<SignedMessage, WalletError> {
        Ok(SignedMessage {
            signature_hex: format!("sig{:08x}", index),
            pubkey_hex: format!("{:064x}", index),
        })
    }
}

pub struct StubSignerProvider;

impl SignerProvider for StubSignerProvider {
    fn unlock(&self, password: &str) -> Result<Arc<dyn Signer>, WalletError> {
        if password == "wrong" {
            return Err(WalletError::BadPassword);
        }
        Ok(Arc::new(StubSigner))
    }
}

/// Engine that hits instantly for `hit_marker` preimages, so scenarios
/// resolve in milliseconds.
pub fn marker_hash_service(events: EventBus, hit_marker: &str) -> Arc<HashService> {
    Arc::new(HashService::with_engine(
        events,
        Arc::new(MarkerEngine {
            marker: hit_marker.as_bytes().to_vec(),
        }) as Arc<dyn HashEngine>,
        50,
        AdaptiveParams::default(),
    ))
}

pub struct TestRig {
    pub miner: Arc<Miner>,
    pub gateway: Arc<MockGateway>,
    pub registrar: Arc<MockRegistrar>,
    pub devfee: Arc<MockDevFee>,
    pub sink: Arc<RecordingSink>,
    pub events: EventBus,
    pub settings_path: std::path::PathBuf,
}

impl Drop for TestRig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.settings_path);
    }
}

/// Builds a full miner over mocks. `hit_marker` selects which preimages the
/// fake engine accepts (an address substring, or "" for everything).
pub fn test_rig(tag: &str, status: ChallengeStatus, hit_marker: &str, dev_address: Option<String>) -> TestRig {
    let events = EventBus::new();
    let gateway = MockGateway::new(status);
    let registrar = Arc::new(MockRegistrar::default());
    let devfee = Arc::new(MockDevFee {
        address: dev_address,
        requests: AtomicU64::new(0),
    });
    let sink = Arc::new(RecordingSink::default());
    let settings_path = std::env::temp_dir().join(format!(
        "swarm-rig-{}-{}.json",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&settings_path);
    let store = Arc::new(crate::config::ConfigStore::load(&settings_path).unwrap());

    let services = CoreServices {
        gateway: gateway.clone() as Arc<dyn RemoteGateway>,
        registrar: registrar.clone() as Arc<dyn Registrar>,
        devfee: devfee.clone() as Arc<dyn DevFeeSource>,
        signer_provider: Arc::new(StubSignerProvider),
        sink: sink.clone() as Arc<dyn ReceiptSink>,
        hash: marker_hash_service(events.clone(), hit_marker),
        store,
        events: events.clone(),
        registered_path: None,
    };
    let tuning = CoreTuning {
        tick: std::time::Duration::from_millis(10),
        stats_interval: std::time::Duration::from_millis(50),
        sweep_interval: std::time::Duration::from_millis(500),
        stability: StabilityParams {
            baseline_window: std::time::Duration::from_secs(2),
            drop_grace: std::time::Duration::from_secs(2),
        },
    };
    TestRig {
        miner: Miner::new(services, tuning),
        gateway,
        registrar,
        devfee,
        sink,
        events,
        settings_path,
    }
}

/// Polls `predicate` until it holds or the timeout elapses.
pub async fn wait_for<F>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    predicate()
}

// Keep the window width visible to scenario tests without a registry import.
pub const WINDOW: u32 = ADDRESS_WINDOW;
