// src/orchestrator.rs
// Top-level state machine and scheduler. One session task owns the registry,
// the worker pool and the stability monitor; solvers, the submitter and the
// poller talk to it exclusively through the core channel, so every registry
// transition happens on this single logical thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use crate::config::{ConfigStore, MinerSettings};
use crate::devfee::DevFeeCounter;
use crate::error::{HashInitError, StartError, WalletError};
use crate::events::{EventBus, EventPayload};
use crate::hash_service::{HashService, HashServiceStatus};
use crate::poller::{self, RemotePhase};
use crate::preimage::{difficulty_mask, nonce_hex};
use crate::registry::{AddressCounts, AddressRegistry, AddressStatus, Assignment, ADDRESS_WINDOW};
use crate::remote::{
    Challenge, DevFeeSource, ReceiptSink, RegisterOutcome, Registrar, RemoteError, RemoteGateway,
    SolutionReceipt,
};
use crate::solver::{SolutionCandidate, SolverOutcome};
use crate::stability::{StabilityMonitor, StabilityParams};
use crate::submitter::{self, SubmissionResult, SubmitterHandle};
use crate::wallet::{DerivedAddress, Signer, SignerProvider};
use crate::workers::{DistributionMode, WorkerInfo, WorkerPool};

/// Consecutive submission failures before an address is paused.
const PAUSE_THRESHOLD: u32 = 5;
/// Registration retry ceiling per address.
const REGISTER_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MinerState {
    Stopped,
    Starting,
    Registering,
    Mining,
    Paused,
    Stopping,
    Error,
}

impl MinerState {
    pub fn name(&self) -> &'static str {
        match self {
            MinerState::Stopped => "stopped",
            MinerState::Starting => "starting",
            MinerState::Registering => "registering",
            MinerState::Mining => "mining",
            MinerState::Paused => "paused",
            MinerState::Stopping => "stopping",
            MinerState::Error => "error",
        }
    }
}

/// Messages feeding the scheduler loop.
#[derive(Debug)]
pub enum CoreMsg {
    Solver {
        worker_id: u32,
        outcome: SolverOutcome,
    },
    Submission {
        candidate: SolutionCandidate,
        result: SubmissionResult,
    },
    Challenge(Challenge),
    Phase(RemotePhase),
    RomReady {
        challenge_id: String,
        result: Result<(), HashInitError>,
    },
    DevAddress(Option<String>),
    Registered {
        index: u32,
        address: String,
        outcome: Result<RegisterOutcome, String>,
    },
    RegistrationDone,
}

/// Injected collaborators; everything the core does not own.
#[derive(Clone)]
pub struct CoreServices {
    pub gateway: Arc<dyn RemoteGateway>,
    pub registrar: Arc<dyn Registrar>,
    pub devfee: Arc<dyn DevFeeSource>,
    pub signer_provider: Arc<dyn SignerProvider>,
    pub sink: Arc<dyn ReceiptSink>,
    pub hash: Arc<HashService>,
    pub store: Arc<ConfigStore>,
    pub events: EventBus,
    /// Registered-set persistence; `None` keeps it in memory (tests).
    pub registered_path: Option<std::path::PathBuf>,
}

/// Loop cadences; tests compress them.
#[derive(Debug, Clone)]
pub struct CoreTuning {
    pub tick: Duration,
    pub stats_interval: Duration,
    pub sweep_interval: Duration,
    pub stability: StabilityParams,
}

impl Default for CoreTuning {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            stats_interval: Duration::from_secs(1),
            sweep_interval: crate::stability::SWEEP_INTERVAL,
            stability: StabilityParams::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Totals {
    pub solutions_found: u64,
    pub solutions_accepted: u64,
    pub dev_solutions_accepted: u64,
    pub submissions_failed: u64,
    pub hashes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: MinerState,
    pub challenge_id: Option<String>,
    pub hashrate: f64,
    pub worker_budget: u32,
    pub effective_budget: u32,
    pub workers: Vec<WorkerInfo>,
    pub addresses: AddressCounts,
    pub address_detail: Vec<AddressStatus>,
    pub hash: HashServiceStatus,
    pub totals: Totals,
    pub dev_fee_counter: u32,
    pub config: MinerSettings,
}

struct RunningSession {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// The orchestrator facade the control surface talks to.
pub struct Miner {
    services: CoreServices,
    tuning: CoreTuning,
    status: Arc<RwLock<StatusSnapshot>>,
    session: Mutex<Option<RunningSession>>,
}

impl Miner {
    pub fn new(services: CoreServices, tuning: CoreTuning) -> Arc<Self> {
        let status = StatusSnapshot {
            state: MinerState::Stopped,
            challenge_id: None,
            hashrate: 0.0,
            worker_budget: 0,
            effective_budget: 0,
            workers: Vec::new(),
            addresses: AddressCounts::default(),
            address_detail: Vec::new(),
            hash: services.hash.status(),
            totals: Totals::default(),
            dev_fee_counter: 0,
            config: services.store.get(),
        };
        Arc::new(Self {
            services,
            tuning,
            status: Arc::new(RwLock::new(status)),
            session: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.services.store
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    pub fn status(&self) -> StatusSnapshot {
        let mut snapshot = self.status.read().clone();
        snapshot.config = self.services.store.get();
        snapshot.hash = self.services.hash.status();
        snapshot
    }

    /// Loads the wallet, validates the address window and launches the
    /// session. Only wallet, config and hash-init failures surface here.
    pub async fn start(&self, password: &str) -> Result<(), StartError> {
        let mut guard = self.session.lock().await;
        if guard.as_ref().map(|s| !s.task.is_finished()).unwrap_or(false) {
            return Err(StartError::AlreadyRunning);
        }

        self.set_state(MinerState::Starting, "loading wallet");
        let settings = self.services.store.get();
        let provider = Arc::clone(&self.services.signer_provider);
        let password = password.to_string();
        let offset = settings.address_offset;

        let unlock = tokio::task::spawn_blocking(move || -> Result<_, WalletError> {
            let signer = provider.unlock(&password)?;
            let window = signer.derive_window(offset, ADDRESS_WINDOW)?;
            Ok((signer, window))
        })
        .await
        .map_err(|e| StartError::Wallet(WalletError::Mnemonic(format!("join error: {}", e))))?;

        let (signer, window) = match unlock {
            Ok(ok) => ok,
            Err(e) => {
                self.set_state(MinerState::Error, &e.to_string());
                self.publish_error("wallet", "critical", &e.to_string());
                return Err(e.into());
            }
        };

        let registry = Arc::new(AddressRegistry::new(self.services.registered_path.clone()));
        if let Err(e) = registry.load(window, offset) {
            self.set_state(MinerState::Error, &e.to_string());
            self.publish_error("wallet", "critical", &e.to_string());
            return Err(e.into());
        }

        self.services.store.set_was_mining(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Session::new(
            self.services.clone(),
            self.tuning.clone(),
            Arc::clone(&self.status),
            registry,
            signer,
            shutdown_rx,
        );
        let task = tokio::spawn(session.run());
        *guard = Some(RunningSession { shutdown_tx, task });
        info!("⛏️  Miner started (offset={}, window={})", offset, ADDRESS_WINDOW);
        Ok(())
    }

    /// Signals every solver to abort and waits briefly before reaping the
    /// session task itself.
    pub async fn stop(&self) {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.take() else {
            return;
        };
        self.set_state(MinerState::Stopping, "stop requested");
        let _ = session.shutdown_tx.send(true);
        let mut task = session.task;
        if timeout(Duration::from_secs(6), &mut task).await.is_err() {
            warn!("Session did not wind down in time, aborting task");
            task.abort();
        }
        self.services.store.set_was_mining(false);
        self.set_state(MinerState::Stopped, "stopped");
        info!("Miner stopped");
    }

    pub async fn update_config(
        &self,
        patch: &crate::config::SettingsPatch,
    ) -> Result<MinerSettings, crate::error::ConfigError> {
        let mining_active = self.is_running().await;
        let settings = self.services.store.update(patch, mining_active)?;
        // Batch ceiling applies from the next solver batch; worker budget is
        // picked up by the next pool tick.
        self.services.hash.set_base_batch(settings.batch_size);
        self.services.events.publish(EventPayload::Status {
            state: self.status.read().state.name().into(),
            message: "configuration updated".into(),
        });
        Ok(settings)
    }

    fn set_state(&self, state: MinerState, message: &str) {
        self.status.write().state = state;
        self.services.events.publish(EventPayload::Status {
            state: state.name().into(),
            message: message.into(),
        });
    }

    fn publish_error(&self, kind: &str, severity: &str, message: &str) {
        self.services.events.publish(EventPayload::Error {
            kind: kind.into(),
            severity: severity.into(),
            address_index: None,
            message: message.into(),
        });
    }
}

/// min(2^failures, 3600) seconds.
fn pause_duration(failure_count: u32) -> Duration {
    let secs = 2u64
        .checked_pow(failure_count.min(32))
        .unwrap_or(u64::MAX)
        .min(3600);
    Duration::from_secs(secs)
}

struct ActiveChallenge {
    challenge: Arc<Challenge>,
    mask: u32,
    rom_ready: bool,
}

struct Session {
    services: CoreServices,
    tuning: CoreTuning,
    status: Arc<RwLock<StatusSnapshot>>,
    registry: Arc<AddressRegistry>,
    signer: Arc<dyn Signer>,
    pool: WorkerPool,
    stability: StabilityMonitor,
    devfee_counter: DevFeeCounter,
    totals: Totals,
    state: MinerState,
    current: Option<ActiveChallenge>,
    dev_address: Option<String>,
    dev_fetch_in_flight: bool,
    dev_fetch_failed_at: Option<Instant>,
    dev_active: bool,
    registering: bool,
    hashing_paused: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    core_rx: mpsc::UnboundedReceiver<CoreMsg>,
    submitter: SubmitterHandle,
    poller_task: tokio::task::JoinHandle<()>,
}

impl Session {
    fn new(
        services: CoreServices,
        tuning: CoreTuning,
        status: Arc<RwLock<StatusSnapshot>>,
        registry: Arc<AddressRegistry>,
        signer: Arc<dyn Signer>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (core_tx, core_rx) = mpsc::unbounded_channel();
        let settings = services.store.get();
        let pool = WorkerPool::new(settings.worker_threads, services.events.clone());
        let submitter = submitter::spawn(
            Arc::clone(&services.gateway),
            core_tx.clone(),
            services.events.clone(),
            shutdown_rx.clone(),
        );
        let poller_task = poller::spawn(
            Arc::clone(&services.gateway),
            core_tx.clone(),
            shutdown_rx.clone(),
        );
        let stability = StabilityMonitor::new(tuning.stability.clone());
        services.hash.set_base_batch(settings.batch_size);

        Self {
            services,
            tuning,
            status,
            registry,
            signer,
            pool,
            stability,
            devfee_counter: DevFeeCounter::new(),
            totals: Totals::default(),
            state: MinerState::Starting,
            current: None,
            dev_address: None,
            dev_fetch_in_flight: false,
            dev_fetch_failed_at: None,
            dev_active: false,
            registering: false,
            hashing_paused: Arc::new(AtomicBool::new(false)),
            shutdown_rx,
            core_tx,
            core_rx,
            submitter,
            poller_task,
        }
    }

    async fn run(mut self) {
        self.begin_registration_phase();

        let mut tick = interval(self.tuning.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_tick = interval(self.tuning.stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = interval(self.tuning.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                maybe = self.core_rx.recv() => {
                    match maybe {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = tick.tick() => self.assignment_tick(),
                _ = stats_tick.tick() => self.stats_tick().await,
                _ = sweep_tick.tick() => self.sweep_tick().await,
            }
        }

        // Wind down: raise every abort flag and free the slots; solver
        // threads observe the flag within one hash.
        self.pool.abort_all();
        self.set_state(MinerState::Stopped, "session closed");
        self.poller_task.abort();
        self.publish_status();
    }

    /// ------------------ Phase handling ------------------

    fn begin_registration_phase(&mut self) {
        let unregistered = self.registry.unregistered();
        if unregistered.is_empty() {
            self.registering = false;
            self.pool.set_mode(DistributionMode::Steady);
            self.set_state(MinerState::Paused, "waiting for challenge");
            return;
        }

        self.registering = true;
        self.pool.set_mode(DistributionMode::Registration);
        self.set_state(
            MinerState::Registering,
            &format!("{} addresses to register", unregistered.len()),
        );
        let settings = self.services.store.get();
        let concurrency = (settings.worker_threads / 2).max(1) as usize;
        spawn_registration_driver(
            unregistered,
            Arc::clone(&self.services.registrar),
            Arc::clone(&self.signer),
            concurrency,
            self.core_tx.clone(),
            self.shutdown_rx.clone(),
        );
    }

    async fn handle(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Challenge(challenge) => self.on_challenge(challenge),
            CoreMsg::Phase(phase) => self.on_phase(phase),
            CoreMsg::RomReady { challenge_id, result } => self.on_rom_ready(challenge_id, result),
            CoreMsg::Solver { worker_id, outcome } => self.on_solver(worker_id, outcome),
            CoreMsg::Submission { candidate, result } => self.on_submission(candidate, result).await,
            CoreMsg::DevAddress(address) => {
                self.dev_fetch_in_flight = false;
                self.dev_fetch_failed_at = address.is_none().then(Instant::now);
                self.dev_address = address;
            }
            CoreMsg::Registered { index, address, outcome } => {
                self.on_registered(index, address, outcome)
            }
            CoreMsg::RegistrationDone => self.on_registration_done(),
        }
    }

    fn on_challenge(&mut self, challenge: Challenge) {
        if let Some(active) = &self.current {
            if active.challenge.challenge_id == challenge.challenge_id {
                return;
            }
        }

        let mask = match difficulty_mask(&challenge.difficulty) {
            Ok(mask) => mask,
            Err(e) => {
                self.publish_error("challenge", "warning", &e);
                return;
            }
        };

        info!("🔄 Challenge rotation -> {}", challenge.challenge_id);
        self.services.events.publish(EventPayload::ChallengeRotated {
            challenge_id: challenge.challenge_id.clone(),
        });

        // Abort every active solver; slots free immediately, threads drain
        // on their own. Per-challenge registry state is rebuilt.
        self.pool.abort_all();
        self.dev_active = false;
        self.registry.on_challenge_rotation(&challenge.challenge_id, false);

        let challenge = Arc::new(challenge);
        self.current = Some(ActiveChallenge {
            challenge: Arc::clone(&challenge),
            mask,
            rom_ready: false,
        });

        // ROM construction is seconds of CPU; run it off the scheduler.
        let hash = Arc::clone(&self.services.hash);
        let core_tx = self.core_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = hash.init(challenge.no_pre_mine.as_bytes());
            let _ = core_tx.send(CoreMsg::RomReady {
                challenge_id: challenge.challenge_id.clone(),
                result,
            });
        });

        if !self.registering {
            self.set_state(MinerState::Mining, "challenge active");
        }
    }

    fn on_phase(&mut self, phase: RemotePhase) {
        if self.current.is_some() {
            info!("Remote phase changed to {:?}, idling workers", phase);
            self.pool.abort_all();
            self.dev_active = false;
            self.current = None;
        }
        if !self.registering && self.state != MinerState::Paused {
            self.set_state(MinerState::Paused, "no active challenge");
        }
    }

    fn on_rom_ready(&mut self, challenge_id: String, result: Result<(), HashInitError>) {
        let Some(active) = &mut self.current else {
            return;
        };
        if active.challenge.challenge_id != challenge_id {
            return;
        }
        match result {
            Ok(()) => {
                active.rom_ready = true;
                if !self.registering {
                    self.stability.begin_steady_state(Instant::now());
                }
            }
            Err(e) => {
                error!("{}", e);
                self.publish_error("hash_init", "critical", &e.to_string());
                // Workers stay idle; the control surface remains live.
                self.current = None;
            }
        }
    }

    fn on_solver(&mut self, worker_id: u32, outcome: SolverOutcome) {
        match outcome {
            SolverOutcome::Candidate(candidate) => {
                let valid = self
                    .current
                    .as_ref()
                    .map(|a| a.challenge.challenge_id == candidate.challenge_id)
                    .unwrap_or(false);
                if !valid {
                    // Rotation won the race; the find is worthless now.
                    self.pool.release_slot(worker_id);
                    if let Some(index) = candidate.address_index {
                        self.release_address(index);
                    }
                    return;
                }

                if let Some(index) = candidate.address_index {
                    let to = Assignment::Submitting {
                        challenge_id: candidate.challenge_id.clone(),
                        nonce: candidate.nonce,
                    };
                    if let Err(violation) = self.registry.transition(index, to) {
                        // Scheduler bug: reap the worker, reset the address,
                        // drop the candidate.
                        error!("{}", violation);
                        self.publish_error("state_violation", "error", &violation.to_string());
                        self.pool.release_slot(worker_id);
                        self.registry.force_release(index);
                        return;
                    }
                }
                self.pool.mark_submitting(worker_id);
                self.totals.solutions_found += 1;
                self.services.events.publish(EventPayload::Solution {
                    address_index: candidate.address_index,
                    challenge_id: candidate.challenge_id.clone(),
                    nonce: nonce_hex(candidate.nonce),
                    dev_fee: candidate.address_index.is_none(),
                });
                self.submitter.submit(candidate);
            }
            SolverOutcome::Aborted { reason } => {
                if self.pool.slot_is_dev(worker_id) {
                    self.dev_active = false;
                }
                let index = self.pool.slot_address(worker_id);
                self.pool.release_slot(worker_id);
                if let Some(index) = index {
                    self.release_address(index);
                }
                if reason == crate::solver::AbortReason::EngineUnavailable {
                    self.publish_error(
                        "hash_init",
                        "warning",
                        "solver aborted: hash engine unavailable",
                    );
                }
            }
        }
    }

    async fn on_submission(&mut self, candidate: SolutionCandidate, result: SubmissionResult) {
        self.pool.complete_submission(candidate.worker_id);
        let is_dev = candidate.address_index.is_none();
        if is_dev {
            self.dev_active = false;
        }

        let (ok, detail) = match &result {
            SubmissionResult::Accepted { .. } => (true, None),
            SubmissionResult::Duplicate => (true, Some("duplicate".to_string())),
            SubmissionResult::Discarded { detail } => (false, Some(detail.clone())),
            SubmissionResult::Failed { detail } => (false, Some(detail.clone())),
        };
        self.services.events.publish(EventPayload::SolutionResult {
            address_index: candidate.address_index,
            challenge_id: candidate.challenge_id.clone(),
            ok,
            detail,
        });

        match result {
            SubmissionResult::Accepted { receipt } => {
                if is_dev {
                    self.devfee_counter.record_dev_accepted();
                    self.totals.dev_solutions_accepted += 1;
                } else {
                    self.totals.solutions_accepted += 1;
                    if let Some(index) = candidate.address_index {
                        self.mark_solved(index, &candidate.challenge_id);
                        self.registry.clear_failures(index);
                    }
                    if self.services.store.get().dev_fee_enabled {
                        self.devfee_counter.record_user_accepted();
                    }
                }
                let receipt = SolutionReceipt {
                    address: candidate.address.clone(),
                    address_index: candidate.address_index,
                    challenge_id: candidate.challenge_id.clone(),
                    nonce: nonce_hex(candidate.nonce),
                    timestamp: Utc::now().to_rfc3339(),
                    receipt_signature: receipt.map(|r| r.signature),
                    dev_fee: is_dev,
                };
                self.services.sink.record_solution(&receipt).await;
            }
            SubmissionResult::Duplicate => {
                // Someone (perhaps an earlier run) already solved for this
                // address: idempotently mark it solved.
                if let Some(index) = candidate.address_index {
                    self.mark_solved(index, &candidate.challenge_id);
                }
            }
            SubmissionResult::Discarded { .. } => {
                if let Some(index) = candidate.address_index {
                    self.release_address(index);
                }
            }
            SubmissionResult::Failed { detail } => {
                self.totals.submissions_failed += 1;
                let Some(index) = candidate.address_index else {
                    return; // dev counter stays due, retried next decision
                };
                let failures = self.registry.record_failure(index);
                if failures >= PAUSE_THRESHOLD {
                    let duration = pause_duration(failures);
                    warn!(
                        "⏸️  Pausing address {} for {}s after {} failures",
                        index,
                        duration.as_secs(),
                        failures
                    );
                    self.registry.pause(index, duration, "submission failures");
                    self.services.events.publish(EventPayload::Error {
                        kind: "address_paused".into(),
                        severity: "warning".into(),
                        address_index: Some(index),
                        message: format!(
                            "paused {}s after {} rejections: {}",
                            duration.as_secs(),
                            failures,
                            detail
                        ),
                    });
                } else {
                    self.release_address(index);
                }
            }
        }
    }

    fn on_registered(&mut self, index: u32, address: String, outcome: Result<RegisterOutcome, String>) {
        match outcome {
            Ok(_) => {
                self.registry.mark_registered(index);
                self.services.events.publish(EventPayload::RegistrationProgress {
                    registered: self.registry.registered_count(),
                    total: ADDRESS_WINDOW,
                    address,
                });
            }
            Err(e) => {
                self.services.events.publish(EventPayload::Error {
                    kind: "registration".into(),
                    severity: "warning".into(),
                    address_index: Some(index),
                    message: e,
                });
            }
        }
    }

    fn on_registration_done(&mut self) {
        self.registering = false;
        self.pool.set_mode(DistributionMode::Steady);
        let registered = self.registry.registered_count();
        info!(
            "Registration phase finished: {}/{} registered",
            registered, ADDRESS_WINDOW
        );
        if self.current.as_ref().map(|a| a.rom_ready).unwrap_or(false) {
            self.set_state(MinerState::Mining, "registration complete");
            self.stability.begin_steady_state(Instant::now());
        } else {
            self.set_state(MinerState::Paused, "registration complete, waiting for challenge");
        }
    }

    /// ------------------ Ticks ------------------

    fn assignment_tick(&mut self) {
        let settings = self.services.store.get();
        self.pool.set_budget(settings.worker_threads);
        self.services.hash.set_base_batch(settings.batch_size);

        // Submission backpressure: past 2x the budget, solvers stop batching
        // until the queue drains back under the budget.
        let backlog = self.submitter.backlog();
        let budget = settings.worker_threads as usize;
        if backlog > 2 * budget {
            self.hashing_paused.store(true, Ordering::Release);
        } else if backlog <= budget {
            self.hashing_paused.store(false, Ordering::Release);
        }

        let Some(active) = &self.current else {
            return;
        };
        if !active.rom_ready {
            return;
        }
        if !matches!(self.state, MinerState::Mining | MinerState::Registering) {
            return;
        }

        let challenge = Arc::clone(&active.challenge);
        let mask = active.mask;
        let mut idle = self.pool.idle_slots();
        if idle.is_empty() {
            return;
        }

        // Dev-fee interleave: when due, the first free slot of this decision
        // goes to the dev address instead of a wallet address.
        if settings.dev_fee_enabled && self.devfee_counter.is_due() && !self.dev_active {
            match self.dev_address.clone() {
                Some(dev_address) => {
                    let worker_id = idle.remove(0);
                    self.dev_active = true;
                    self.pool.start_dev_assignment(
                        worker_id,
                        dev_address,
                        Arc::clone(&challenge),
                        mask,
                        Arc::clone(&self.services.hash),
                        Arc::clone(&self.hashing_paused),
                        self.core_tx.clone(),
                    );
                }
                None if !self.dev_fetch_in_flight => {
                    // An absent dev destination behaves as disabled; retry
                    // no more than once a minute.
                    let recently_failed = self
                        .dev_fetch_failed_at
                        .map(|t| t.elapsed() < Duration::from_secs(60))
                        .unwrap_or(false);
                    if !recently_failed {
                        self.dev_fetch_in_flight = true;
                        let devfee = Arc::clone(&self.services.devfee);
                        let core_tx = self.core_tx.clone();
                        tokio::spawn(async move {
                            let address = devfee.dev_address().await;
                            let _ = core_tx.send(CoreMsg::DevAddress(address));
                        });
                    }
                }
                None => {}
            }
        }

        if idle.is_empty() {
            return;
        }
        let acquired = self
            .registry
            .acquire_assignable(&challenge.challenge_id, &idle);
        for assignment in &acquired {
            self.pool.start_assignment(
                assignment,
                Arc::clone(&challenge),
                mask,
                Arc::clone(&self.services.hash),
                Arc::clone(&self.hashing_paused),
                self.core_tx.clone(),
            );
        }
    }

    async fn stats_tick(&mut self) {
        let now = Instant::now();
        let total_hashes = self.pool.pool_hashes().load(Ordering::Relaxed);
        self.totals.hashes = total_hashes;
        self.stability.record_sample(total_hashes, now);

        self.pool.emit_worker_updates();
        self.services.events.publish(EventPayload::Stats {
            total_hashrate: self.stability.hashrate(),
            workers_active: self.pool.active_count(),
            solutions_found: self.totals.solutions_found,
            current_batch: self.services.hash.current_batch(),
        });

        if let Some((baseline, current)) = self.stability.check_hashrate_drop(now) {
            warn!(
                "📉 Hashrate dropped: {:.0} H/s vs baseline {:.0} H/s",
                current, baseline
            );
            self.services.events.publish(EventPayload::HashrateDropped { baseline, current });
            self.services.hash.advise_shrink("hashrate_dropped");
            self.sweep_tick().await;
        }

        self.publish_status();
    }

    async fn sweep_tick(&mut self) {
        let settings = self.services.store.get();
        let report = self.stability.sweep(
            &self.registry,
            &mut self.pool,
            settings.worker_threads,
            Instant::now(),
        );
        self.services.events.publish(EventPayload::StabilityCheck {
            issues_found: report.issues_found,
            repairs_made: report.repairs_made,
            details: report.details,
        });

        let sample = crate::remote::HashrateSample {
            hash_rate: self.stability.hashrate(),
            workers_active: self.pool.active_count(),
            timestamp: Utc::now().to_rfc3339(),
        };
        self.services.sink.record_hashrate(&sample).await;
    }

    /// ------------------ Helpers ------------------

    fn mark_solved(&mut self, index: u32, challenge_id: &str) {
        let to = Assignment::Solved {
            challenge_id: challenge_id.to_string(),
            solved_at: Instant::now(),
        };
        if let Err(violation) = self.registry.transition(index, to) {
            // Rotation may have reset the address while the submission was
            // in flight; the accepted solution belongs to the old challenge.
            if self.registry.current_challenge().as_deref() == Some(challenge_id) {
                error!("{}", violation);
                self.publish_error("state_violation", "error", &violation.to_string());
                self.registry.force_release(index);
            }
        }
    }

    fn release_address(&mut self, index: u32) {
        match self.registry.assignment_of(index) {
            Some(Assignment::InProgress { .. }) | Some(Assignment::Submitting { .. }) => {
                if self.registry.transition(index, Assignment::None).is_err() {
                    self.registry.force_release(index);
                }
            }
            _ => {}
        }
    }

    fn set_state(&mut self, state: MinerState, message: &str) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.status.write().state = state;
        self.services.events.publish(EventPayload::Status {
            state: state.name().into(),
            message: message.into(),
        });
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.state = self.state;
        status.challenge_id = self
            .current
            .as_ref()
            .map(|a| a.challenge.challenge_id.clone());
        status.hashrate = self.stability.hashrate();
        status.worker_budget = self.services.store.get().worker_threads;
        status.effective_budget = self.pool.effective_budget();
        status.workers = self.pool.worker_infos();
        status.addresses = self.registry.counts();
        status.address_detail = self.registry.address_statuses();
        status.hash = self.services.hash.status();
        status.totals = self.totals.clone();
        status.dev_fee_counter = self.devfee_counter.count();
    }
}

/// Drives the registrar over the unregistered subset with bounded
/// concurrency, then reports completion.
fn spawn_registration_driver(
    unregistered: Vec<DerivedAddress>,
    registrar: Arc<dyn Registrar>,
    signer: Arc<dyn Signer>,
    concurrency: usize,
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut joins = Vec::with_capacity(unregistered.len());
        for address in unregistered {
            if *shutdown_rx.borrow() {
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let registrar = Arc::clone(&registrar);
            let signer = Arc::clone(&signer);
            let core_tx = core_tx.clone();
            joins.push(tokio::spawn(async move {
                let outcome = register_one(&*registrar, &*signer, &address).await;
                let _ = core_tx.send(CoreMsg::Registered {
                    index: address.index,
                    address: address.bech32,
                    outcome,
                });
                drop(permit);
            }));
        }
        for join in joins {
            let _ = join.await;
        }
        let _ = core_tx.send(CoreMsg::RegistrationDone);
    });
}

async fn register_one(
    registrar: &dyn Registrar,
    signer: &dyn Signer,
    address: &DerivedAddress,
) -> Result<RegisterOutcome, String> {
    let message = registrar
        .tandc_message()
        .await
        .map_err(|e| format!("T&C fetch failed: {}", e))?;
    let signed = signer
        .sign_message(address.index, &message)
        .map_err(|e| format!("signing failed: {}", e))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match registrar
            .register(&address.bech32, &signed.signature_hex, &signed.pubkey_hex)
            .await
        {
            Ok(outcome) => return Ok(outcome),
            Err(RemoteError::Transient(e)) if attempt < REGISTER_ATTEMPTS => {
                let backoff = Duration::from_secs(2u64.pow(attempt).min(60));
                warn!(
                    "Transient registration failure for {} (attempt {}): {}",
                    address.bech32, attempt, e
                );
                sleep(backoff).await;
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}
