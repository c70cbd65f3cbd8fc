// src/registry.rs
// Canonical per-address state. A single mutex guards the whole table so
// assignment acquisition is linearizable: concurrent pool ticks can never
// hand the same address to two workers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{StateViolation, WalletError};
use crate::wallet::DerivedAddress;

/// Width of the address window the orchestrator operates on.
pub const ADDRESS_WINDOW: u32 = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    None,
    InProgress {
        worker_id: u32,
        challenge_id: String,
        started_at: Instant,
        hashes: u64,
    },
    Submitting {
        challenge_id: String,
        nonce: u64,
    },
    Solved {
        challenge_id: String,
        solved_at: Instant,
    },
    PausedUntil {
        deadline: Instant,
        reason: String,
    },
}

impl Assignment {
    pub fn name(&self) -> &'static str {
        match self {
            Assignment::None => "none",
            Assignment::InProgress { .. } => "in_progress",
            Assignment::Submitting { .. } => "submitting",
            Assignment::Solved { .. } => "solved",
            Assignment::PausedUntil { .. } => "paused",
        }
    }
}

#[derive(Debug)]
pub struct AddressEntry {
    pub address: DerivedAddress,
    pub registered: bool,
    pub assignment: Assignment,
    pub failure_count: u32,
    pub last_activity: Instant,
}

/// Per-challenge ephemeral state, recreated on every rotation.
#[derive(Debug)]
pub struct ChallengeScope {
    pub challenge_id: String,
    pub started_at: Instant,
    pub solved: HashSet<u32>,
    pub submitted_nonces: HashMap<u32, u64>,
    pub solve_times: Vec<Duration>,
}

impl ChallengeScope {
    fn new(challenge_id: String) -> Self {
        Self {
            challenge_id,
            started_at: Instant::now(),
            solved: HashSet::new(),
            submitted_nonces: HashMap::new(),
            solve_times: Vec::new(),
        }
    }
}

/// One address handed to a worker slot.
#[derive(Debug, Clone)]
pub struct AcquiredAssignment {
    pub worker_id: u32,
    pub index: u32,
    pub address: DerivedAddress,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AddressCounts {
    pub total: u32,
    pub registered: u32,
    pub in_progress: u32,
    pub submitting: u32,
    pub solved: u32,
    pub paused: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressStatus {
    pub index: u32,
    pub address: String,
    pub registered: bool,
    pub state: String,
    pub failure_count: u32,
}

#[derive(Default, Serialize, Deserialize)]
struct RegisteredLog {
    addresses: HashSet<String>,
}

struct Inner {
    offset: u32,
    entries: BTreeMap<u32, AddressEntry>,
    scope: Option<ChallengeScope>,
    registered_log: RegisteredLog,
}

pub struct AddressRegistry {
    inner: Mutex<Inner>,
    /// Persisted registered set; `None` in tests.
    registered_path: Option<PathBuf>,
}

impl AddressRegistry {
    pub fn new(registered_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                offset: 0,
                entries: BTreeMap::new(),
                scope: None,
                registered_log: RegisteredLog::default(),
            }),
            registered_path,
        }
    }

    /// Loads one window of derived addresses. Gaps or duplicates in the
    /// index space mean the wallet needs repair, so mining refuses to start.
    pub fn load(&self, window: Vec<DerivedAddress>, offset: u32) -> Result<(), WalletError> {
        if window.len() != ADDRESS_WINDOW as usize {
            return Err(WalletError::AddressCorruption(format!(
                "expected {} addresses, got {}",
                ADDRESS_WINDOW,
                window.len()
            )));
        }
        let start = offset * ADDRESS_WINDOW;
        let mut seen = HashSet::new();
        for (i, addr) in window.iter().enumerate() {
            let expected = start + i as u32;
            if addr.index != expected {
                return Err(WalletError::AddressCorruption(format!(
                    "index gap: expected {}, found {}",
                    expected, addr.index
                )));
            }
            if !seen.insert(addr.bech32.clone()) {
                return Err(WalletError::AddressCorruption(format!(
                    "duplicate address {} at index {}",
                    addr.bech32, addr.index
                )));
            }
        }

        let mut inner = self.inner.lock();
        inner.registered_log = self.load_registered_log();
        inner.offset = offset;
        inner.scope = None;
        let log = std::mem::take(&mut inner.registered_log);
        inner.entries = window
            .into_iter()
            .map(|address| {
                let registered = log.addresses.contains(&address.bech32);
                (
                    address.index,
                    AddressEntry {
                        address,
                        registered,
                        assignment: Assignment::None,
                        failure_count: 0,
                        last_activity: Instant::now(),
                    },
                )
            })
            .collect();
        inner.registered_log = log;
        let registered = inner.entries.values().filter(|e| e.registered).count();
        info!(
            "Loaded address window offset={} ({} addresses, {} already registered)",
            offset,
            inner.entries.len(),
            registered
        );
        Ok(())
    }

    fn load_registered_log(&self) -> RegisteredLog {
        let Some(path) = &self.registered_path else {
            return RegisteredLog::default();
        };
        match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => RegisteredLog::default(),
        }
    }

    fn persist_registered_log(&self, log: &RegisteredLog) {
        let Some(path) = &self.registered_path else {
            return;
        };
        let tmp = path.with_extension("tmp");
        let text = match serde_json::to_string_pretty(log) {
            Ok(t) => t,
            Err(e) => {
                warn!("Could not serialize registered log: {}", e);
                return;
            }
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(&tmp, text).and_then(|_| fs::rename(&tmp, path)) {
            warn!("Could not persist registered log: {}", e);
        }
    }

    /// Registration only ever adds addresses during a run.
    pub fn mark_registered(&self, index: u32) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&index) else {
            return;
        };
        if entry.registered {
            return;
        }
        entry.registered = true;
        let bech32 = entry.address.bech32.clone();
        inner.registered_log.addresses.insert(bech32);
        self.persist_registered_log(&inner.registered_log);
    }

    pub fn registered_count(&self) -> u32 {
        self.inner.lock().entries.values().filter(|e| e.registered).count() as u32
    }

    pub fn unregistered(&self) -> Vec<DerivedAddress> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| !e.registered)
            .map(|e| e.address.clone())
            .collect()
    }

    /// Installs the scope for a new challenge: clears per-challenge fields
    /// and, by default, the failure counters.
    pub fn on_challenge_rotation(&self, new_id: &str, keep_failures: bool) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.values_mut() {
            entry.assignment = Assignment::None;
            if !keep_failures {
                entry.failure_count = 0;
            }
        }
        inner.scope = Some(ChallengeScope::new(new_id.to_string()));
    }

    pub fn current_challenge(&self) -> Option<String> {
        self.inner.lock().scope.as_ref().map(|s| s.challenge_id.clone())
    }

    /// Atomically hands out up to one address per requesting worker. An
    /// address is assignable when it is registered, unassigned, not solved
    /// for the current challenge and not paused. Expired pauses are released
    /// in passing.
    pub fn acquire_assignable(&self, challenge_id: &str, worker_ids: &[u32]) -> Vec<AcquiredAssignment> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(scope) = &inner.scope else {
            return Vec::new();
        };
        if scope.challenge_id != challenge_id {
            return Vec::new();
        }
        let solved: HashSet<u32> = scope.solved.clone();

        let mut out = Vec::with_capacity(worker_ids.len());
        let mut workers = worker_ids.iter();
        for entry in inner.entries.values_mut() {
            if out.len() == worker_ids.len() {
                break;
            }
            if !entry.registered || solved.contains(&entry.address.index) {
                continue;
            }
            match &entry.assignment {
                Assignment::None => {}
                Assignment::PausedUntil { deadline, .. } if *deadline <= now => {
                    entry.assignment = Assignment::None;
                }
                _ => continue,
            }
            let worker_id = *workers.next().expect("out.len() < worker_ids.len()");
            entry.assignment = Assignment::InProgress {
                worker_id,
                challenge_id: challenge_id.to_string(),
                started_at: now,
                hashes: 0,
            };
            entry.last_activity = now;
            out.push(AcquiredAssignment {
                worker_id,
                index: entry.address.index,
                address: entry.address.clone(),
            });
        }
        out
    }

    /// Guarded transition used by the scheduler for the legal state flow.
    /// Anything else is a scheduler bug surfaced as `StateViolation`; the
    /// caller repairs with `force_release` instead of crashing.
    pub fn transition(&self, index: u32, to: Assignment) -> Result<(), StateViolation> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&index).ok_or_else(|| StateViolation {
            index,
            from: "unknown".into(),
            to: to.name().into(),
        })?;

        let legal = matches!(
            (&entry.assignment, &to),
            (Assignment::None, Assignment::InProgress { .. })
                | (Assignment::InProgress { .. }, Assignment::Submitting { .. })
                | (Assignment::InProgress { .. }, Assignment::None)
                | (Assignment::Submitting { .. }, Assignment::Solved { .. })
                | (Assignment::Submitting { .. }, Assignment::None)
                | (Assignment::Submitting { .. }, Assignment::PausedUntil { .. })
                | (Assignment::PausedUntil { .. }, Assignment::None)
        );
        if !legal {
            return Err(StateViolation {
                index,
                from: entry.assignment.name().into(),
                to: to.name().into(),
            });
        }

        // Solve-time sample and submitted-nonce bookkeeping ride along on
        // the InProgress -> Submitting edge.
        if let (
            Assignment::InProgress { started_at, .. },
            Assignment::Submitting { nonce, .. },
        ) = (&entry.assignment, &to)
        {
            let elapsed = started_at.elapsed();
            let nonce = *nonce;
            let idx = entry.address.index;
            entry.assignment = to;
            entry.last_activity = Instant::now();
            if let Some(scope) = &mut inner.scope {
                scope.solve_times.push(elapsed);
                scope.submitted_nonces.insert(idx, nonce);
            }
            return Ok(());
        }

        if let Assignment::Solved { challenge_id, .. } = &to {
            let challenge_id = challenge_id.clone();
            entry.assignment = to;
            entry.last_activity = Instant::now();
            let idx = index;
            if let Some(scope) = &mut inner.scope {
                if scope.challenge_id == challenge_id {
                    scope.solved.insert(idx);
                }
            }
            return Ok(());
        }

        entry.assignment = to;
        entry.last_activity = Instant::now();
        Ok(())
    }

    /// Repair path: unconditionally releases an address back to `None`.
    pub fn force_release(&self, index: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&index) {
            entry.assignment = Assignment::None;
            entry.last_activity = Instant::now();
        }
    }

    pub fn pause(&self, index: u32, duration: Duration, reason: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&index) {
            entry.assignment = Assignment::PausedUntil {
                deadline: Instant::now() + duration,
                reason: reason.to_string(),
            };
            entry.last_activity = Instant::now();
        }
    }

    /// Releases addresses whose pause deadline has passed.
    pub fn expire_paused(&self, now: Instant) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        for entry in inner.entries.values_mut() {
            if let Assignment::PausedUntil { deadline, .. } = &entry.assignment {
                if *deadline <= now {
                    entry.assignment = Assignment::None;
                    expired.push(entry.address.index);
                }
            }
        }
        expired
    }

    pub fn record_failure(&self, index: u32) -> u32 {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&index) {
            Some(entry) => {
                entry.failure_count += 1;
                entry.failure_count
            }
            None => 0,
        }
    }

    pub fn clear_failures(&self, index: u32) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&index) {
            entry.failure_count = 0;
        }
    }

    pub fn assignment_of(&self, index: u32) -> Option<Assignment> {
        self.inner
            .lock()
            .entries
            .get(&index)
            .map(|e| e.assignment.clone())
    }

    /// Indices currently InProgress, with their worker and start time.
    pub fn in_progress(&self) -> Vec<(u32, u32, Instant)> {
        self.inner
            .lock()
            .entries
            .values()
            .filter_map(|e| match &e.assignment {
                Assignment::InProgress {
                    worker_id,
                    started_at,
                    ..
                } => Some((e.address.index, *worker_id, *started_at)),
                _ => None,
            })
            .collect()
    }

    /// Leak repair: if more addresses are InProgress than the budget allows
    /// (plus tolerance), release the excess and report how many were clamped.
    pub fn clamp_in_progress(&self, max_allowed: usize) -> usize {
        let mut inner = self.inner.lock();
        let in_progress: Vec<u32> = inner
            .entries
            .values()
            .filter(|e| matches!(e.assignment, Assignment::InProgress { .. }))
            .map(|e| e.address.index)
            .collect();
        if in_progress.len() <= max_allowed {
            return 0;
        }
        let excess = &in_progress[max_allowed..];
        for idx in excess {
            if let Some(entry) = inner.entries.get_mut(idx) {
                entry.assignment = Assignment::None;
            }
        }
        excess.len()
    }

    pub fn median_solve_time(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        let scope = inner.scope.as_ref()?;
        if scope.solve_times.is_empty() {
            return None;
        }
        let mut times = scope.solve_times.clone();
        times.sort();
        Some(times[times.len() / 2])
    }

    pub fn solved_count(&self) -> u32 {
        self.inner
            .lock()
            .scope
            .as_ref()
            .map(|s| s.solved.len() as u32)
            .unwrap_or(0)
    }

    pub fn counts(&self) -> AddressCounts {
        let inner = self.inner.lock();
        let mut counts = AddressCounts {
            total: inner.entries.len() as u32,
            ..Default::default()
        };
        for entry in inner.entries.values() {
            if entry.registered {
                counts.registered += 1;
            }
            match entry.assignment {
                Assignment::InProgress { .. } => counts.in_progress += 1,
                Assignment::Submitting { .. } => counts.submitting += 1,
                Assignment::Solved { .. } => counts.solved += 1,
                Assignment::PausedUntil { .. } => counts.paused += 1,
                Assignment::None => {}
            }
        }
        counts
    }

    pub fn address_statuses(&self) -> Vec<AddressStatus> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| AddressStatus {
                index: e.address.index,
                address: e.address.bech32.clone(),
                registered: e.registered,
                state: e.assignment.name().to_string(),
                failure_count: e.failure_count,
            })
            .collect()
    }

    pub fn address_of(&self, index: u32) -> Option<DerivedAddress> {
        self.inner
            .lock()
            .entries
            .get(&index)
            .map(|e| e.address.clone())
    }
}
