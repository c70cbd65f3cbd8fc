// src/stability.rs
// Periodic audit that reconciles registry and worker pool against the
// scheduler invariants, plus the hash-rate watchdog. All methods run on the
// scheduler; sweeps are cheap compared to the 30 s cadence.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::warn;

use crate::registry::AddressRegistry;
use crate::workers::{WorkerPool, STUCK_THRESHOLD};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// An InProgress assignment older than this multiple of the median solve
/// time, with a silent worker, counts as stale.
const STALE_MULTIPLIER: u32 = 10;
/// Heartbeat age that counts as "no recent heartbeat" for staleness.
const STALE_HEARTBEAT: Duration = Duration::from_secs(30);
/// Assignments may exceed the budget by this much before the leak clamp.
const LEAK_TOLERANCE: usize = 2;
const DROP_RATIO: f64 = 0.7;
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct StabilityParams {
    /// How long the baseline is collected after steady state begins.
    pub baseline_window: Duration,
    /// How long the rate must stay below the threshold before flagging.
    pub drop_grace: Duration,
}

impl Default for StabilityParams {
    fn default() -> Self {
        Self {
            baseline_window: Duration::from_secs(120),
            drop_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub issues_found: u32,
    pub repairs_made: u32,
    pub details: Vec<String>,
}

pub struct StabilityMonitor {
    params: StabilityParams,
    ewma: Option<f64>,
    last_hashes: u64,
    last_sample: Option<Instant>,
    steady_since: Option<Instant>,
    baseline_acc: Vec<f64>,
    baseline: Option<f64>,
    low_since: Option<Instant>,
}

impl StabilityMonitor {
    pub fn new(params: StabilityParams) -> Self {
        Self {
            params,
            ewma: None,
            last_hashes: 0,
            last_sample: None,
            steady_since: None,
            baseline_acc: Vec::new(),
            baseline: None,
            low_since: None,
        }
    }

    /// Called when steady-state mining begins; restarts baseline learning.
    pub fn begin_steady_state(&mut self, now: Instant) {
        self.steady_since = Some(now);
        self.baseline_acc.clear();
        self.baseline = None;
        self.low_since = None;
        self.ewma = None;
        self.last_sample = Some(now);
    }

    /// Feeds the monotonically increasing pool hash counter; returns the
    /// instantaneous rate for the stats stream.
    pub fn record_sample(&mut self, total_hashes: u64, now: Instant) -> f64 {
        let rate = match self.last_sample {
            Some(last) if now > last => {
                let dt = now.duration_since(last).as_secs_f64();
                (total_hashes.saturating_sub(self.last_hashes)) as f64 / dt
            }
            _ => 0.0,
        };
        self.last_hashes = total_hashes;
        self.last_sample = Some(now);
        self.ewma = Some(match self.ewma {
            Some(prev) => EWMA_ALPHA * rate + (1.0 - EWMA_ALPHA) * prev,
            None => rate,
        });

        if let Some(steady) = self.steady_since {
            if self.baseline.is_none() {
                if now.duration_since(steady) <= self.params.baseline_window {
                    if rate > 0.0 {
                        self.baseline_acc.push(rate);
                    }
                } else if !self.baseline_acc.is_empty() {
                    let avg = self.baseline_acc.iter().sum::<f64>() / self.baseline_acc.len() as f64;
                    self.baseline = Some(avg);
                }
            }
        }
        rate
    }

    pub fn hashrate(&self) -> f64 {
        self.ewma.unwrap_or(0.0)
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    /// Returns `(baseline, current)` once the EWMA has sat below 70% of the
    /// learned baseline for the grace period. Re-arms after flagging.
    pub fn check_hashrate_drop(&mut self, now: Instant) -> Option<(f64, f64)> {
        let baseline = self.baseline?;
        let current = self.ewma?;
        if current >= DROP_RATIO * baseline {
            self.low_since = None;
            return None;
        }
        let since = *self.low_since.get_or_insert(now);
        if now.duration_since(since) >= self.params.drop_grace {
            self.low_since = None;
            Some((baseline, current))
        } else {
            None
        }
    }

    /// One stability sweep: expire pauses, reap stuck workers, release
    /// orphans on both sides, clamp assignment leaks.
    pub fn sweep(
        &mut self,
        registry: &AddressRegistry,
        pool: &mut WorkerPool,
        budget: u32,
        now: Instant,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        let expired = registry.expire_paused(now);
        if !expired.is_empty() {
            report.repairs_made += expired.len() as u32;
            report
                .details
                .push(format!("expired {} paused addresses", expired.len()));
        }

        // Stuck workers: silent heartbeat. The address goes back to None
        // with no failure increment.
        let reaped = pool.reap_stuck(now, STUCK_THRESHOLD);
        for (worker_id, index) in &reaped {
            if let Some(index) = index {
                registry.force_release(*index);
            }
            report.issues_found += 1;
            report.repairs_made += 1;
            report.details.push(format!("reaped stuck worker {}", worker_id));
        }

        // Stale addresses: far past the median solve time with a silent
        // worker behind them.
        if let Some(median) = registry.median_solve_time() {
            let stale_after = median * STALE_MULTIPLIER;
            let heartbeat_by_worker: HashMap<u32, Duration> = pool
                .worker_infos()
                .into_iter()
                .map(|w| (w.id, Duration::from_millis(w.heartbeat_age_ms)))
                .collect();
            for (index, worker_id, started_at) in registry.in_progress() {
                let age = now.duration_since(started_at);
                let silent = heartbeat_by_worker
                    .get(&worker_id)
                    .map(|hb| *hb > STALE_HEARTBEAT)
                    .unwrap_or(true);
                if age > stale_after && silent {
                    pool.release_slot(worker_id);
                    registry.force_release(index);
                    report.issues_found += 1;
                    report.repairs_made += 1;
                    report
                        .details
                        .push(format!("released stale address {} (worker {})", index, worker_id));
                }
            }
        }

        // Orphans, both directions.
        let slot_view = pool.mining_assignments();
        let registry_view: Vec<(u32, u32)> = registry
            .in_progress()
            .into_iter()
            .map(|(index, worker_id, _)| (index, worker_id))
            .collect();
        let (orphan_slots, orphan_addresses) = find_orphans(&slot_view, &registry_view);
        for worker_id in orphan_slots {
            pool.release_slot(worker_id);
            report.issues_found += 1;
            report.repairs_made += 1;
            report.details.push(format!("released orphaned slot {}", worker_id));
        }
        for index in orphan_addresses {
            registry.force_release(index);
            report.issues_found += 1;
            report.repairs_made += 1;
            report
                .details
                .push(format!("released orphaned assignment for address {}", index));
        }

        // Assignment leak clamp.
        let clamped = registry.clamp_in_progress(budget as usize + LEAK_TOLERANCE);
        if clamped > 0 {
            warn!("Clamped {} leaked assignments", clamped);
            report.issues_found += clamped as u32;
            report.repairs_made += clamped as u32;
            report.details.push(format!("clamped {} leaked assignments", clamped));
        }

        report
    }
}

/// Pure reconciliation: slots mining an address the registry does not map
/// back to them, and registry assignments no mining slot backs.
fn find_orphans(
    slots: &[(u32, Option<u32>)],
    registry: &[(u32, u32)],
) -> (Vec<u32>, Vec<u32>) {
    let by_index: HashMap<u32, u32> = registry.iter().map(|(i, w)| (*i, *w)).collect();
    let mut mining_by_worker: HashMap<u32, u32> = HashMap::new();
    for (worker_id, index) in slots {
        if let Some(index) = index {
            mining_by_worker.insert(*worker_id, *index);
        }
    }

    let orphan_slots = slots
        .iter()
        .filter_map(|(worker_id, index)| {
            // Dev assignments carry no registry entry and are never orphans.
            let index = (*index)?;
            match by_index.get(&index) {
                Some(owner) if *owner == *worker_id => None,
                _ => Some(*worker_id),
            }
        })
        .collect();

    let orphan_addresses = registry
        .iter()
        .filter_map(|(index, worker_id)| match mining_by_worker.get(worker_id) {
            Some(mining_index) if mining_index == index => None,
            _ => Some(*index),
        })
        .collect();

    (orphan_slots, orphan_addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(baseline_window: Duration, drop_grace: Duration) -> StabilityMonitor {
        StabilityMonitor::new(StabilityParams {
            baseline_window,
            drop_grace,
        })
    }

    #[test]
    fn baseline_learned_then_drop_flagged_after_grace() {
        let mut m = monitor(Duration::from_secs(10), Duration::from_secs(6));
        let t0 = Instant::now();
        m.begin_steady_state(t0);

        // 1000 H/s for the baseline window.
        let mut hashes = 0u64;
        for i in 1..=12 {
            hashes += 1000;
            m.record_sample(hashes, t0 + Duration::from_secs(i));
        }
        let baseline = m.baseline().expect("baseline learned");
        assert!((baseline - 1000.0).abs() < 1.0);

        // Collapse to zero; the flag needs the grace period to elapse.
        let mut flagged = None;
        for i in 13..40 {
            let now = t0 + Duration::from_secs(i);
            m.record_sample(hashes, now); // counter stalls
            if let Some(f) = m.check_hashrate_drop(now) {
                flagged = Some((i, f));
                break;
            }
        }
        let (at, (b, current)) = flagged.expect("drop flagged");
        assert!(at >= 19, "flagged before grace elapsed (at {}s)", at);
        assert!((b - 1000.0).abs() < 1.0);
        assert!(current < 0.7 * b);
    }

    #[test]
    fn healthy_rate_never_flags() {
        let mut m = monitor(Duration::from_secs(5), Duration::from_secs(5));
        let t0 = Instant::now();
        m.begin_steady_state(t0);
        let mut hashes = 0u64;
        for i in 1..=30 {
            hashes += 900; // ~90% of eventual baseline, above the 70% line
            m.record_sample(hashes, t0 + Duration::from_secs(i));
            assert!(m.check_hashrate_drop(t0 + Duration::from_secs(i)).is_none());
        }
    }

    #[test]
    fn recovery_rearms_the_watchdog() {
        let mut m = monitor(Duration::from_secs(4), Duration::from_secs(4));
        let t0 = Instant::now();
        m.begin_steady_state(t0);
        let mut hashes = 0u64;
        for i in 1..=6 {
            hashes += 1000;
            m.record_sample(hashes, t0 + Duration::from_secs(i));
        }
        // Brief dip shorter than the grace period...
        for i in 7..=8 {
            m.record_sample(hashes, t0 + Duration::from_secs(i));
            assert!(m.check_hashrate_drop(t0 + Duration::from_secs(i)).is_none());
        }
        // ...then recovery clears the low timer.
        for i in 9..=20 {
            hashes += 1000;
            m.record_sample(hashes, t0 + Duration::from_secs(i));
            assert!(m.check_hashrate_drop(t0 + Duration::from_secs(i)).is_none());
        }
    }

    #[test]
    fn orphan_detection_both_directions() {
        // Slot 0 mines address 5 and the registry agrees; slot 1 claims
        // address 6 but the registry gave 6 to worker 9; address 7 has no
        // slot at all; slot 2 is a dev assignment.
        let slots = vec![(0, Some(5)), (1, Some(6)), (2, None)];
        let registry = vec![(5, 0), (6, 9), (7, 3)];
        let (orphan_slots, mut orphan_addresses) = find_orphans(&slots, &registry);
        orphan_addresses.sort();
        assert_eq!(orphan_slots, vec![1]);
        assert_eq!(orphan_addresses, vec![6, 7]);
    }

    #[test]
    fn consistent_views_have_no_orphans() {
        let slots = vec![(0, Some(1)), (1, Some(2))];
        let registry = vec![(1, 0), (2, 1)];
        let (orphan_slots, orphan_addresses) = find_orphans(&slots, &registry);
        assert!(orphan_slots.is_empty());
        assert!(orphan_addresses.is_empty());
    }
}
