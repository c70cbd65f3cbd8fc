// src/events.rs
// In-process typed pub/sub for the UI and log stream. Publishers never block;
// each subscriber owns a bounded ring where only stats-class traffic may be
// dropped on overflow. Dropping a Subscription unsubscribes it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// Default per-subscriber ring capacity.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ts: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// The serde tag is the wire `type` field consumed by the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Status {
        state: String,
        message: String,
    },
    MiningStart {
        address_index: Option<u32>,
        address: String,
        challenge_id: String,
    },
    HashProgress {
        address_index: Option<u32>,
        worker_id: u32,
        hashes: u64,
    },
    Stats {
        total_hashrate: f64,
        workers_active: u32,
        solutions_found: u64,
        current_batch: u32,
    },
    WorkerUpdate {
        worker_id: u32,
        state: String,
        address_index: Option<u32>,
        hashes: u64,
    },
    Solution {
        address_index: Option<u32>,
        challenge_id: String,
        nonce: String,
        dev_fee: bool,
    },
    SolutionSubmit {
        address_index: Option<u32>,
        challenge_id: String,
        nonce: String,
        attempt: u32,
    },
    SolutionResult {
        address_index: Option<u32>,
        challenge_id: String,
        ok: bool,
        detail: Option<String>,
    },
    RegistrationProgress {
        registered: u32,
        total: u32,
        address: String,
    },
    Error {
        kind: String,
        severity: String,
        address_index: Option<u32>,
        message: String,
    },
    ChallengeRotated {
        challenge_id: String,
    },
    HashrateDropped {
        baseline: f64,
        current: f64,
    },
    StabilityCheck {
        issues_found: u32,
        repairs_made: u32,
        details: Vec<String>,
    },
    BatchResized {
        current_batch: u32,
        base_batch: u32,
        reason: String,
    },
}

impl EventPayload {
    /// Stats-class traffic may be shed under pressure; everything else is
    /// lifecycle or solution data and must reach every subscriber.
    pub fn droppable(&self) -> bool {
        matches!(
            self,
            EventPayload::Stats { .. }
                | EventPayload::HashProgress { .. }
                | EventPayload::WorkerUpdate { .. }
        )
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Event>,
    queued: Arc<AtomicUsize>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Cheap to clone; all clones publish into the same subscriber set.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: EventPayload) {
        let event = Event {
            ts: Utc::now().to_rfc3339(),
            payload,
        };
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if event.payload.droppable() && sub.queued.load(Ordering::Relaxed) >= sub.capacity {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    sub.queued.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => false,
            }
        });
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            tx,
            queued: Arc::clone(&queued),
            capacity,
            dropped: Arc::clone(&dropped),
        });
        Subscription {
            id,
            rx,
            queued,
            dropped,
            bus: Arc::clone(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Receiving end of one subscription; unsubscribes when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
    queued: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    bus: Arc<Mutex<BusInner>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await?;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        Some(event)
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => {
                self.queued.fetch_sub(1, Ordering::Relaxed);
                Some(event)
            }
            Err(_) => None,
        }
    }

    /// Events shed from this subscriber's ring so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = self.bus.lock();
        inner.subscribers.retain(|s| s.id != self.id);
    }
}
