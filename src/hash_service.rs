// src/hash_service.rs
// Wraps the native ROM-initialized hash. ROMs are expensive (seconds, ~1 GiB)
// so they are cached per challenge seed; batched hashing honors a deadline
// and an abort flag so callers never sit inside a batch longer than one hash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ashmaize::{hash, Rom, RomGenerationType};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::{MAX_BATCH, MIN_BATCH};
use crate::error::HashInitError;
use crate::events::{EventBus, EventPayload};

/// Digest function over a prepared ROM. The seam tests stub out.
pub trait HashEngine: Send + Sync {
    fn digest(&self, preimage: &[u8]) -> [u8; 64];
}

/// ROM tuning constants. The values are fixed by the remote validator.
#[derive(Debug, Clone)]
pub struct RomParams {
    pub nb_loops: u32,
    pub nb_instrs: u32,
    pub pre_size: usize,
    pub mixing_numbers: usize,
    pub rom_size: usize,
}

impl Default for RomParams {
    fn default() -> Self {
        Self {
            nb_loops: 8,
            nb_instrs: 256,
            pre_size: 16 * 1024 * 1024,
            mixing_numbers: 4,
            rom_size: 1024 * 1024 * 1024,
        }
    }
}

struct AshMaizeEngine {
    rom: Arc<Rom>,
    nb_loops: u32,
    nb_instrs: u32,
}

impl HashEngine for AshMaizeEngine {
    fn digest(&self, preimage: &[u8]) -> [u8; 64] {
        hash(preimage, &self.rom, self.nb_loops, self.nb_instrs)
    }
}

/// Result of one batched call. `consumed` counts hashes actually computed;
/// on deadline or abort the remainder of the request is skipped.
pub struct BatchOutcome {
    pub digests: Vec<[u8; 64]>,
    pub consumed: u32,
    pub timed_out: bool,
    pub aborted: bool,
}

/// Adaptive sizing thresholds; tests shrink the clean window.
#[derive(Debug, Clone)]
pub struct AdaptiveParams {
    /// Consecutive timeouts before the batch halves.
    pub timeout_trigger: u32,
    /// Clean stretch before the batch doubles back toward base.
    pub clean_window: Duration,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            timeout_trigger: 2,
            clean_window: Duration::from_secs(120),
        }
    }
}

struct AdaptiveBatch {
    base: AtomicU32,
    current: AtomicU32,
    consecutive_timeouts: AtomicU32,
    timeout_count: AtomicU64,
    last_timeout: Mutex<Option<Instant>>,
    clean_since: Mutex<Option<Instant>>,
    params: AdaptiveParams,
}

impl AdaptiveBatch {
    fn new(base: u32, params: AdaptiveParams) -> Self {
        let base = base.clamp(MIN_BATCH, MAX_BATCH);
        Self {
            base: AtomicU32::new(base),
            current: AtomicU32::new(base),
            consecutive_timeouts: AtomicU32::new(0),
            timeout_count: AtomicU64::new(0),
            last_timeout: Mutex::new(None),
            clean_since: Mutex::new(None),
            params,
        }
    }
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HashServiceStatus {
    pub rom_ready: bool,
    pub base_batch: u32,
    pub current_batch: u32,
    pub timeout_count: u64,
    pub adaptive_active: bool,
}

pub struct HashService {
    params: RomParams,
    /// ROM cache keyed by seed so rotating back to a seen seed is free.
    engines: RwLock<HashMap<Vec<u8>, Arc<dyn HashEngine>>>,
    active: RwLock<Option<Arc<dyn HashEngine>>>,
    /// Test seam: when set, every seed resolves to this engine.
    fixed: Option<Arc<dyn HashEngine>>,
    batch: AdaptiveBatch,
    events: EventBus,
}

impl HashService {
    pub fn new(events: EventBus, params: RomParams, base_batch: u32) -> Self {
        Self {
            params,
            engines: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            fixed: None,
            batch: AdaptiveBatch::new(base_batch, AdaptiveParams::default()),
            events,
        }
    }

    /// Test constructor: a fixed engine, no ROM builds.
    pub fn with_engine(
        events: EventBus,
        engine: Arc<dyn HashEngine>,
        base_batch: u32,
        adaptive: AdaptiveParams,
    ) -> Self {
        Self {
            params: RomParams::default(),
            engines: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            fixed: Some(engine),
            batch: AdaptiveBatch::new(base_batch, adaptive),
            events,
        }
    }

    /// Builds (or reuses) the ROM for `seed` and makes it the active engine.
    /// Idempotent per seed. Heavy: run on a blocking thread.
    pub fn init(&self, seed: &[u8]) -> Result<(), HashInitError> {
        if let Some(engine) = &self.fixed {
            *self.active.write() = Some(Arc::clone(engine));
            return Ok(());
        }
        if seed.is_empty() {
            return Err(HashInitError("empty ROM seed".into()));
        }

        // Fast path: already built for this seed.
        {
            let cache = self.engines.read();
            if let Some(engine) = cache.get(seed) {
                *self.active.write() = Some(Arc::clone(engine));
                return Ok(());
            }
        }

        info!("Building ROM for new challenge seed ({} bytes)...", seed.len());
        let started = Instant::now();
        let rom = Rom::new(
            seed,
            RomGenerationType::TwoStep {
                pre_size: self.params.pre_size,
                mixing_numbers: self.params.mixing_numbers,
            },
            self.params.rom_size,
        );
        let engine: Arc<dyn HashEngine> = Arc::new(AshMaizeEngine {
            rom: Arc::new(rom),
            nb_loops: self.params.nb_loops,
            nb_instrs: self.params.nb_instrs,
        });
        info!("ROM ready in {:.1}s", started.elapsed().as_secs_f64());

        // Double-check under the write lock; another builder may have won.
        {
            let mut cache = self.engines.write();
            let entry = cache.entry(seed.to_vec()).or_insert_with(|| Arc::clone(&engine));
            *self.active.write() = Some(Arc::clone(entry));
        }
        Ok(())
    }

    pub fn ready(&self) -> bool {
        self.active.read().is_some()
    }

    pub fn hash_one(&self, preimage: &[u8]) -> Result<[u8; 64], HashInitError> {
        let engine = self
            .active
            .read()
            .clone()
            .ok_or_else(|| HashInitError("no active ROM".into()))?;
        Ok(engine.digest(preimage))
    }

    /// Computes up to `max_n` hashes, stopping at `deadline` or when `abort`
    /// is raised. Both are checked between individual hashes so a rotation
    /// is observed in single-hash time, never batch time.
    pub fn hash_batch<I>(
        &self,
        preimages: I,
        max_n: u32,
        deadline: Instant,
        abort: &AtomicBool,
    ) -> Result<BatchOutcome, HashInitError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let engine = self
            .active
            .read()
            .clone()
            .ok_or_else(|| HashInitError("no active ROM".into()))?;

        let mut digests = Vec::with_capacity(max_n as usize);
        let mut timed_out = false;
        let mut aborted = false;
        for preimage in preimages.into_iter().take(max_n as usize) {
            if abort.load(Ordering::Acquire) {
                aborted = true;
                break;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            digests.push(engine.digest(preimage.as_ref()));
        }
        let consumed = digests.len() as u32;
        Ok(BatchOutcome {
            digests,
            consumed,
            timed_out,
            aborted,
        })
    }

    /// ------------------ Adaptive sizing ------------------

    pub fn current_batch(&self) -> u32 {
        self.batch.current.load(Ordering::Relaxed)
    }

    pub fn base_batch(&self) -> u32 {
        self.batch.base.load(Ordering::Relaxed)
    }

    /// Live config change: the configured batch is the ceiling/base, not the
    /// running value; the current batch is clamped into the new bound.
    pub fn set_base_batch(&self, base: u32) {
        let base = base.clamp(MIN_BATCH, MAX_BATCH);
        let old = self.batch.base.swap(base, Ordering::Relaxed);
        if old != base {
            let current = self.batch.current.load(Ordering::Relaxed);
            if current > base {
                self.batch.current.store(base, Ordering::Relaxed);
            }
            self.publish_resize("config");
        }
    }

    /// Called by a solver whose batch hit the deadline with nothing returned.
    pub fn report_timeout(&self) {
        self.batch.timeout_count.fetch_add(1, Ordering::Relaxed);
        *self.batch.last_timeout.lock() = Some(Instant::now());
        *self.batch.clean_since.lock() = None;
        let n = self.batch.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.batch.params.timeout_trigger {
            self.batch.consecutive_timeouts.store(0, Ordering::Relaxed);
            self.shrink("timeout");
        }
    }

    /// Called by a solver after a full batch completed within deadline.
    pub fn report_clean(&self) {
        self.batch.consecutive_timeouts.store(0, Ordering::Relaxed);
        let mut clean = self.batch.clean_since.lock();
        let since = *clean.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.batch.params.clean_window {
            let base = self.batch.base.load(Ordering::Relaxed);
            let current = self.batch.current.load(Ordering::Relaxed);
            if current < base {
                let next = (current.saturating_mul(2)).min(base);
                self.batch.current.store(next, Ordering::Relaxed);
                *clean = Some(Instant::now());
                self.publish_resize("recovered");
            }
        }
    }

    /// Stability monitor advice on a hash-rate anomaly.
    pub fn advise_shrink(&self, reason: &str) {
        self.shrink(reason);
    }

    fn shrink(&self, reason: &str) {
        let current = self.batch.current.load(Ordering::Relaxed);
        let next = (current / 2).max(MIN_BATCH);
        if next != current {
            self.batch.current.store(next, Ordering::Relaxed);
            warn!("Shrinking hash batch {} -> {} ({})", current, next, reason);
            self.publish_resize(reason);
        }
    }

    fn publish_resize(&self, reason: &str) {
        self.events.publish(EventPayload::BatchResized {
            current_batch: self.batch.current.load(Ordering::Relaxed),
            base_batch: self.batch.base.load(Ordering::Relaxed),
            reason: reason.to_string(),
        });
    }

    pub fn status(&self) -> HashServiceStatus {
        let base = self.base_batch();
        let current = self.current_batch();
        HashServiceStatus {
            rom_ready: self.ready(),
            base_batch: base,
            current_batch: current,
            timeout_count: self.batch.timeout_count.load(Ordering::Relaxed),
            adaptive_active: current != base,
        }
    }
}

/// Deterministic engine for scheduler tests: hits (all-zero digest) when the
/// preimage contains `marker`, misses (0xff prefix) otherwise. An empty
/// marker hits on everything.
pub struct MarkerEngine {
    pub marker: Vec<u8>,
}

impl HashEngine for MarkerEngine {
    fn digest(&self, preimage: &[u8]) -> [u8; 64] {
        let hit = self.marker.is_empty()
            || preimage
                .windows(self.marker.len())
                .any(|w| w == self.marker.as_slice());
        let mut out = [0u8; 64];
        if !hit {
            out[0] = 0xff;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingEngine {
        delay: Duration,
    }

    impl HashEngine for CountingEngine {
        fn digest(&self, _preimage: &[u8]) -> [u8; 64] {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            [0u8; 64]
        }
    }

    fn service(base: u32, clean_window: Duration) -> HashService {
        HashService::with_engine(
            EventBus::new(),
            Arc::new(CountingEngine {
                delay: Duration::ZERO,
            }),
            base,
            AdaptiveParams {
                timeout_trigger: 2,
                clean_window,
            },
        )
    }

    fn preimages(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("p{}", i).into_bytes()).collect()
    }

    #[test]
    fn not_ready_before_init() {
        let svc = service(300, Duration::from_secs(120));
        assert!(!svc.ready());
        let abort = AtomicBool::new(false);
        assert!(svc
            .hash_batch(preimages(1), 1, Instant::now() + Duration::from_secs(1), &abort)
            .is_err());
        svc.init(b"seed").unwrap();
        assert!(svc.ready());
    }

    #[test]
    fn batch_respects_deadline() {
        let svc = HashService::with_engine(
            EventBus::new(),
            Arc::new(CountingEngine {
                delay: Duration::from_millis(20),
            }),
            300,
            AdaptiveParams::default(),
        );
        svc.init(b"seed").unwrap();
        let abort = AtomicBool::new(false);
        let out = svc
            .hash_batch(
                preimages(1000),
                1000,
                Instant::now() + Duration::from_millis(100),
                &abort,
            )
            .unwrap();
        assert!(out.timed_out);
        assert!(out.consumed < 1000);
        assert_eq!(out.digests.len(), out.consumed as usize);
    }

    #[test]
    fn batch_observes_abort() {
        let svc = service(300, Duration::from_secs(120));
        svc.init(b"seed").unwrap();
        let abort = AtomicBool::new(true);
        let out = svc
            .hash_batch(preimages(100), 100, Instant::now() + Duration::from_secs(10), &abort)
            .unwrap();
        assert!(out.aborted);
        assert_eq!(out.consumed, 0);
    }

    #[test]
    fn two_timeouts_halve_the_batch() {
        let svc = service(300, Duration::from_secs(120));
        assert_eq!(svc.current_batch(), 300);
        svc.report_timeout();
        assert_eq!(svc.current_batch(), 300);
        svc.report_timeout();
        assert_eq!(svc.current_batch(), 150);
        // Counter resets after a halving.
        svc.report_timeout();
        assert_eq!(svc.current_batch(), 150);
        svc.report_timeout();
        assert_eq!(svc.current_batch(), 75);
    }

    #[test]
    fn batch_never_leaves_bounds() {
        let svc = service(MIN_BATCH, Duration::from_secs(120));
        for _ in 0..64 {
            svc.report_timeout();
        }
        assert_eq!(svc.current_batch(), MIN_BATCH);

        svc.set_base_batch(MAX_BATCH + 1);
        assert_eq!(svc.base_batch(), MAX_BATCH);
    }

    #[test]
    fn clean_window_doubles_toward_base() {
        let svc = service(400, Duration::from_millis(10));
        svc.report_timeout();
        svc.report_timeout();
        svc.report_timeout();
        svc.report_timeout();
        assert_eq!(svc.current_batch(), 100);

        svc.report_clean();
        std::thread::sleep(Duration::from_millis(15));
        svc.report_clean();
        assert_eq!(svc.current_batch(), 200);
        std::thread::sleep(Duration::from_millis(15));
        svc.report_clean();
        assert_eq!(svc.current_batch(), 400);
        // Never above base.
        std::thread::sleep(Duration::from_millis(15));
        svc.report_clean();
        assert_eq!(svc.current_batch(), 400);
    }

    #[test]
    fn timeout_resets_clean_window() {
        let svc = service(400, Duration::from_millis(50));
        svc.advise_shrink("test");
        assert_eq!(svc.current_batch(), 200);
        svc.report_clean();
        svc.report_timeout(); // clean stretch broken
        std::thread::sleep(Duration::from_millis(60));
        svc.report_clean(); // starts a fresh window, no double yet
        assert_eq!(svc.current_batch(), 200);
    }

    #[test]
    fn config_base_clamps_current() {
        let svc = service(1000, Duration::from_secs(120));
        svc.set_base_batch(200);
        assert_eq!(svc.base_batch(), 200);
        assert_eq!(svc.current_batch(), 200);
    }
}
