// src/workers.rs
// Bounded pool of cooperative worker slots. The count is a budget, not a
// fixed allocation: a slot idles when the registry has nothing assignable.
// All methods run on the scheduler; only the per-slot `SlotShared` atomics
// are touched from solver threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::MAX_WORKERS;
use crate::events::{EventBus, EventPayload};
use crate::hash_service::HashService;
use crate::orchestrator::CoreMsg;
use crate::registry::AcquiredAssignment;
use crate::remote::Challenge;
use crate::solver::{self, SolverContext};

/// Heartbeat age after which a worker counts as stuck.
pub const STUCK_THRESHOLD: Duration = Duration::from_secs(120);
/// More than this many stucks inside the window quarantines a slot.
const QUARANTINE_STUCKS: usize = 3;
const QUARANTINE_WINDOW: Duration = Duration::from_secs(600);

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Cross-thread view of one assignment: the solver heartbeats here, the
/// scheduler reads and raises the abort flag. Replaced wholesale on reap so
/// an orphaned thread can never write into a reassigned slot.
pub struct SlotShared {
    pub hashes: AtomicU64,
    pub last_heartbeat_ms: AtomicU64,
    pub abort: AtomicBool,
    /// Aggregate counter shared with the stability monitor.
    pub pool_hashes: Arc<AtomicU64>,
}

impl SlotShared {
    pub fn new(pool_hashes: Arc<AtomicU64>) -> Self {
        Self {
            hashes: AtomicU64::new(0),
            last_heartbeat_ms: AtomicU64::new(now_millis()),
            abort: AtomicBool::new(false),
            pool_hashes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Mining,
    Submitting,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionMode {
    Registration,
    Steady,
}

struct WorkerSlot {
    id: u32,
    state: SlotState,
    /// (address index, challenge id); index is `None` for a dev assignment.
    current: Option<(Option<u32>, String)>,
    started_at: Option<Instant>,
    shared: Arc<SlotShared>,
    stuck_times: VecDeque<Instant>,
    quarantined: bool,
}

impl WorkerSlot {
    fn new(id: u32, pool_hashes: Arc<AtomicU64>) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            current: None,
            started_at: None,
            shared: Arc::new(SlotShared::new(pool_hashes)),
            stuck_times: VecDeque::new(),
            quarantined: false,
        }
    }

    fn release(&mut self, pool_hashes: &Arc<AtomicU64>) {
        self.shared.abort.store(true, Ordering::Release);
        // Fresh shared state: the old solver thread keeps its own Arc and
        // exits on the abort flag without touching the next assignment.
        self.shared = Arc::new(SlotShared::new(Arc::clone(pool_hashes)));
        self.state = SlotState::Idle;
        self.current = None;
        self.started_at = None;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: u32,
    pub state: SlotState,
    pub address_index: Option<u32>,
    pub hashes: u64,
    pub heartbeat_age_ms: u64,
    pub quarantined: bool,
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    budget: u32,
    mode: DistributionMode,
    pool_hashes: Arc<AtomicU64>,
    events: EventBus,
}

impl WorkerPool {
    pub fn new(budget: u32, events: EventBus) -> Self {
        Self {
            slots: Vec::new(),
            budget: budget.min(MAX_WORKERS),
            mode: DistributionMode::Steady,
            pool_hashes: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    pub fn pool_hashes(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.pool_hashes)
    }

    pub fn set_budget(&mut self, budget: u32) {
        let budget = budget.min(MAX_WORKERS);
        if budget != self.budget {
            debug!("Worker budget {} -> {}", self.budget, budget);
            self.budget = budget;
            // Operator touched the config: give quarantined slots another go.
            for slot in &mut self.slots {
                slot.quarantined = false;
                slot.stuck_times.clear();
            }
        }
    }

    pub fn set_mode(&mut self, mode: DistributionMode) {
        self.mode = mode;
    }

    /// Budget currently in force: halved while registration is running,
    /// reduced by quarantined slots, never below one.
    pub fn effective_budget(&self) -> u32 {
        let base = match self.mode {
            DistributionMode::Registration => (self.budget / 2).max(1),
            DistributionMode::Steady => self.budget,
        };
        let quarantined = self.slots.iter().filter(|s| s.quarantined).count() as u32;
        base.saturating_sub(quarantined).max(1)
    }

    pub fn active_count(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Mining | SlotState::Submitting))
            .count() as u32
    }

    /// Idle, non-quarantined slot ids available this tick, growing the slot
    /// table up to the effective budget first.
    pub fn idle_slots(&mut self) -> Vec<u32> {
        let effective = self.effective_budget();
        while (self.slots.len() as u32) < effective {
            let id = self.slots.len() as u32;
            self.slots
                .push(WorkerSlot::new(id, Arc::clone(&self.pool_hashes)));
        }
        // Completed slots rejoin the idle set one tick later.
        for slot in &mut self.slots {
            if slot.state == SlotState::Completed {
                slot.state = SlotState::Idle;
                slot.current = None;
            }
        }

        let active = self.active_count();
        if active >= effective {
            return Vec::new();
        }
        let room = (effective - active) as usize;
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Idle && !s.quarantined)
            .map(|s| s.id)
            .take(room)
            .collect()
    }

    /// Spawns a solver for one acquired wallet address.
    pub fn start_assignment(
        &mut self,
        assignment: &AcquiredAssignment,
        challenge: Arc<Challenge>,
        difficulty_mask: u32,
        hash: Arc<HashService>,
        hashing_paused: Arc<AtomicBool>,
        tx: UnboundedSender<CoreMsg>,
    ) {
        self.spawn_solver(
            assignment.worker_id,
            Some(assignment.index),
            assignment.address.bech32.clone(),
            challenge,
            difficulty_mask,
            hash,
            hashing_paused,
            tx,
        );
    }

    /// Spawns a solver against the externally supplied dev address.
    pub fn start_dev_assignment(
        &mut self,
        worker_id: u32,
        dev_address: String,
        challenge: Arc<Challenge>,
        difficulty_mask: u32,
        hash: Arc<HashService>,
        hashing_paused: Arc<AtomicBool>,
        tx: UnboundedSender<CoreMsg>,
    ) {
        self.spawn_solver(
            worker_id,
            None,
            dev_address,
            challenge,
            difficulty_mask,
            hash,
            hashing_paused,
            tx,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_solver(
        &mut self,
        worker_id: u32,
        address_index: Option<u32>,
        address: String,
        challenge: Arc<Challenge>,
        difficulty_mask: u32,
        hash: Arc<HashService>,
        hashing_paused: Arc<AtomicBool>,
        tx: UnboundedSender<CoreMsg>,
    ) {
        let Some(slot) = self.slots.iter_mut().find(|s| s.id == worker_id) else {
            warn!("start_assignment for unknown worker {}", worker_id);
            return;
        };
        debug_assert_eq!(slot.state, SlotState::Idle);
        slot.shared = Arc::new(SlotShared::new(Arc::clone(&self.pool_hashes)));
        slot.state = SlotState::Mining;
        slot.current = Some((address_index, challenge.challenge_id.clone()));
        slot.started_at = Some(Instant::now());

        self.events.publish(EventPayload::MiningStart {
            address_index,
            address: address.clone(),
            challenge_id: challenge.challenge_id.clone(),
        });

        let ctx = SolverContext {
            worker_id,
            address_index,
            address,
            challenge,
            difficulty_mask,
            hash,
            shared: Arc::clone(&slot.shared),
            hashing_paused,
            tx,
            events: self.events.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("solver-{}", worker_id))
            .spawn(move || solver::run(ctx));
        if let Err(e) = spawned {
            warn!("Could not spawn solver thread: {}", e);
            self.release_slot(worker_id);
        }
    }

    /// The solver exited with a candidate; the slot tracks the in-flight
    /// submission until the result comes back.
    pub fn mark_submitting(&mut self, worker_id: u32) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == worker_id) {
            if slot.state == SlotState::Mining {
                slot.state = SlotState::Submitting;
            }
        }
    }

    pub fn complete_submission(&mut self, worker_id: u32) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == worker_id) {
            if slot.state == SlotState::Submitting {
                slot.state = SlotState::Completed;
                slot.current = None;
            }
        }
    }

    pub fn release_slot(&mut self, worker_id: u32) {
        let pool_hashes = Arc::clone(&self.pool_hashes);
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == worker_id) {
            slot.release(&pool_hashes);
        }
    }

    /// True while the slot runs a dev-fee assignment (no wallet index).
    pub fn slot_is_dev(&self, worker_id: u32) -> bool {
        self.slots
            .iter()
            .find(|s| s.id == worker_id)
            .and_then(|s| s.current.as_ref())
            .map(|(idx, _)| idx.is_none())
            .unwrap_or(false)
    }

    pub fn slot_address(&self, worker_id: u32) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.id == worker_id)
            .and_then(|s| s.current.as_ref())
            .and_then(|(idx, _)| *idx)
    }

    /// Mining slots and the wallet address they reference, for the orphan
    /// cross-check.
    pub fn mining_assignments(&self) -> Vec<(u32, Option<u32>)> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Mining)
            .map(|s| (s.id, s.current.as_ref().and_then(|(idx, _)| *idx)))
            .collect()
    }

    /// Signals every active solver to abort and frees the slots. Orphaned
    /// threads observe the flag within one hash and exit on their own.
    pub fn abort_all(&mut self) -> Vec<Option<u32>> {
        let pool_hashes = Arc::clone(&self.pool_hashes);
        let mut released = Vec::new();
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Mining | SlotState::Submitting) {
                released.push(slot.current.as_ref().and_then(|(idx, _)| *idx));
                slot.release(&pool_hashes);
            }
        }
        released
    }

    /// Forcibly releases slots whose heartbeat went silent. Returns the
    /// wallet addresses that must go back to `None` (without a failure
    /// increment) so the scheduler can repair the registry.
    pub fn reap_stuck(&mut self, now: Instant, threshold: Duration) -> Vec<(u32, Option<u32>)> {
        let now_ms = now_millis();
        let pool_hashes = Arc::clone(&self.pool_hashes);
        let mut reaped = Vec::new();
        for slot in &mut self.slots {
            if slot.state != SlotState::Mining {
                continue;
            }
            let beat = slot.shared.last_heartbeat_ms.load(Ordering::Relaxed);
            let age = Duration::from_millis(now_ms.saturating_sub(beat));
            if age <= threshold {
                continue;
            }
            warn!(
                "Reaping stuck worker {} (heartbeat {}s old)",
                slot.id,
                age.as_secs()
            );
            reaped.push((slot.id, slot.current.as_ref().and_then(|(idx, _)| *idx)));
            slot.release(&pool_hashes);

            slot.stuck_times.push_back(now);
            while let Some(front) = slot.stuck_times.front() {
                if now.duration_since(*front) > QUARANTINE_WINDOW {
                    slot.stuck_times.pop_front();
                } else {
                    break;
                }
            }
            if slot.stuck_times.len() > QUARANTINE_STUCKS && !slot.quarantined {
                slot.quarantined = true;
                warn!("Worker {} quarantined after repeated stucks", slot.id);
                self.events.publish(EventPayload::Error {
                    kind: "worker_quarantined".into(),
                    severity: "warning".into(),
                    address_index: None,
                    message: format!(
                        "worker {} removed from budget after {} stucks in 10min",
                        slot.id,
                        slot.stuck_times.len()
                    ),
                });
            }
        }
        reaped
    }

    pub fn worker_infos(&self) -> Vec<WorkerInfo> {
        let now_ms = now_millis();
        self.slots
            .iter()
            .map(|s| WorkerInfo {
                id: s.id,
                state: s.state,
                address_index: s.current.as_ref().and_then(|(idx, _)| *idx),
                hashes: s.shared.hashes.load(Ordering::Relaxed),
                heartbeat_age_ms: now_ms
                    .saturating_sub(s.shared.last_heartbeat_ms.load(Ordering::Relaxed)),
                quarantined: s.quarantined,
            })
            .collect()
    }

    /// Per-slot stats stream, published on the scheduler's 1 Hz tick.
    pub fn emit_worker_updates(&self) {
        for slot in &self.slots {
            if slot.state == SlotState::Idle && slot.current.is_none() {
                continue;
            }
            self.events.publish(EventPayload::WorkerUpdate {
                worker_id: slot.id,
                state: format!("{:?}", slot.state).to_lowercase(),
                address_index: slot.current.as_ref().and_then(|(idx, _)| *idx),
                hashes: slot.shared.hashes.load(Ordering::Relaxed),
            });
        }
    }

    #[cfg(test)]
    fn slot_state(&self, worker_id: u32) -> SlotState {
        self.slots
            .iter()
            .find(|s| s.id == worker_id)
            .map(|s| s.state)
            .unwrap()
    }

    #[cfg(test)]
    fn force_heartbeat_age(&mut self, worker_id: u32, age: Duration) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == worker_id) {
            let past = now_millis().saturating_sub(age.as_millis() as u64);
            slot.shared.last_heartbeat_ms.store(past, Ordering::Relaxed);
        }
    }
}
