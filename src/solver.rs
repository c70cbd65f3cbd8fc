// src/solver.rs
// The inner hashing loop for one (address, challenge) pair. Runs on a native
// worker thread; the only waits are the batch deadline inside the hash
// service and the cooperative pause/abort checks between batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use crate::events::{EventBus, EventPayload};
use crate::hash_service::HashService;
use crate::orchestrator::CoreMsg;
use crate::preimage::{self, meets_difficulty};
use crate::remote::Challenge;
use crate::workers::{now_millis, SlotShared};

/// Deadline for one batched hash call.
pub const BATCH_DEADLINE: Duration = Duration::from_secs(10);

/// A nonce whose digest satisfied the challenge difficulty.
#[derive(Debug, Clone)]
pub struct SolutionCandidate {
    pub worker_id: u32,
    /// `None` for a dev-fee assignment.
    pub address_index: Option<u32>,
    pub address: String,
    pub challenge_id: String,
    pub nonce: u64,
    pub digest_hex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Rotation, stop, pause or stuck-reap raised the abort flag.
    Preempted,
    /// The 64-bit nonce space wrapped; treated as an abort, not a retry.
    NonceWrapped,
    /// No active ROM for the current challenge.
    EngineUnavailable,
}

#[derive(Debug, Clone)]
pub enum SolverOutcome {
    Candidate(SolutionCandidate),
    Aborted { reason: AbortReason },
}

pub struct SolverContext {
    pub worker_id: u32,
    pub address_index: Option<u32>,
    pub address: String,
    pub challenge: Arc<Challenge>,
    pub difficulty_mask: u32,
    pub hash: Arc<HashService>,
    pub shared: Arc<SlotShared>,
    /// Raised by the orchestrator when the submission queue is saturated.
    pub hashing_paused: Arc<AtomicBool>,
    pub tx: UnboundedSender<CoreMsg>,
    pub events: EventBus,
}

pub fn run(ctx: SolverContext) {
    let start_nonce = preimage::starting_nonce(&ctx.address, &ctx.challenge.challenge_id);
    let mut nonce = start_nonce;
    let mut preimages: Vec<String> = Vec::new();
    debug!(
        "solver-{} start address={} nonce={:016x}",
        ctx.worker_id, ctx.address, start_nonce
    );

    let outcome = loop {
        if ctx.shared.abort.load(Ordering::Acquire) {
            break SolverOutcome::Aborted {
                reason: AbortReason::Preempted,
            };
        }
        if ctx.hashing_paused.load(Ordering::Acquire) {
            // Submission backlog: no new batches until it drains.
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }

        // Batch size is re-read every iteration so resizes apply between
        // batches, never mid-batch.
        let batch = ctx.hash.current_batch();
        let Some(end) = nonce.checked_add(batch as u64) else {
            break SolverOutcome::Aborted {
                reason: AbortReason::NonceWrapped,
            };
        };

        preimages.clear();
        for n in nonce..end {
            preimages.push(preimage::build_preimage(n, &ctx.address, &ctx.challenge));
        }

        let deadline = Instant::now() + BATCH_DEADLINE;
        let out = match ctx.hash.hash_batch(preimages.iter(), batch, deadline, &ctx.shared.abort) {
            Ok(out) => out,
            Err(_) => {
                break SolverOutcome::Aborted {
                    reason: AbortReason::EngineUnavailable,
                }
            }
        };

        // Heartbeat before anything else so the reaper sees liveness even on
        // empty partial batches.
        ctx.shared
            .hashes
            .fetch_add(out.consumed as u64, Ordering::Relaxed);
        ctx.shared
            .last_heartbeat_ms
            .store(now_millis(), Ordering::Relaxed);
        ctx.shared
            .pool_hashes
            .fetch_add(out.consumed as u64, Ordering::Relaxed);
        if out.consumed > 0 {
            ctx.events.publish(EventPayload::HashProgress {
                address_index: ctx.address_index,
                worker_id: ctx.worker_id,
                hashes: out.consumed as u64,
            });
        }

        if let Some(hit) = out
            .digests
            .iter()
            .position(|digest| meets_difficulty(digest, ctx.difficulty_mask))
        {
            let found = nonce + hit as u64;
            break SolverOutcome::Candidate(SolutionCandidate {
                worker_id: ctx.worker_id,
                address_index: ctx.address_index,
                address: ctx.address.clone(),
                challenge_id: ctx.challenge.challenge_id.clone(),
                nonce: found,
                digest_hex: hex::encode(out.digests[hit]),
            });
        }

        if out.aborted {
            break SolverOutcome::Aborted {
                reason: AbortReason::Preempted,
            };
        }
        if out.timed_out && out.consumed == 0 {
            ctx.hash.report_timeout();
        } else if !out.timed_out {
            ctx.hash.report_clean();
        }

        nonce += out.consumed as u64;
    };

    debug!("solver-{} exiting: {:?}", ctx.worker_id, outcome_tag(&outcome));
    let _ = ctx.tx.send(CoreMsg::Solver {
        worker_id: ctx.worker_id,
        outcome,
    });
}

fn outcome_tag(outcome: &SolverOutcome) -> &'static str {
    match outcome {
        SolverOutcome::Candidate(_) => "candidate",
        SolverOutcome::Aborted { reason } => match reason {
            AbortReason::Preempted => "preempted",
            AbortReason::NonceWrapped => "nonce_wrapped",
            AbortReason::EngineUnavailable => "engine_unavailable",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_service::{AdaptiveParams, MarkerEngine};
    use tokio::sync::mpsc;

    fn challenge() -> Arc<Challenge> {
        Arc::new(Challenge {
            challenge_id: "C1".into(),
            difficulty: "00ffffff".into(),
            no_pre_mine: "aa".into(),
            latest_submission: "ls".into(),
            no_pre_mine_hour: "h".into(),
            day: None,
            challenge_number: None,
        })
    }

    fn hash_service(marker: &str) -> Arc<HashService> {
        let svc = HashService::with_engine(
            EventBus::new(),
            Arc::new(MarkerEngine {
                marker: marker.as_bytes().to_vec(),
            }),
            50,
            AdaptiveParams::default(),
        );
        svc.init(b"seed").unwrap();
        Arc::new(svc)
    }

    fn context(
        hash: Arc<HashService>,
        tx: UnboundedSender<CoreMsg>,
    ) -> (SolverContext, Arc<SlotShared>) {
        let shared = Arc::new(SlotShared::new(Arc::new(Default::default())));
        let ctx = SolverContext {
            worker_id: 1,
            address_index: Some(0),
            address: "addr1qsolvertest".into(),
            challenge: challenge(),
            difficulty_mask: 0x00ff_ffff,
            hash,
            shared: Arc::clone(&shared),
            hashing_paused: Arc::new(AtomicBool::new(false)),
            tx,
            events: EventBus::new(),
        };
        (ctx, shared)
    }

    #[test]
    fn finds_candidate_when_engine_hits() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Engine hits on every preimage containing the address.
        let (ctx, _shared) = context(hash_service("addr1qsolvertest"), tx);
        let expected_nonce = preimage::starting_nonce("addr1qsolvertest", "C1");
        run(ctx);
        match rx.try_recv().unwrap() {
            CoreMsg::Solver {
                worker_id,
                outcome: SolverOutcome::Candidate(candidate),
            } => {
                assert_eq!(worker_id, 1);
                assert_eq!(candidate.nonce, expected_nonce);
                assert_eq!(candidate.address_index, Some(0));
                assert_eq!(candidate.challenge_id, "C1");
            }
            other => panic!("expected candidate, got {:?}", msg_tag(&other)),
        }
    }

    #[test]
    fn aborts_on_preemption() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Engine never hits; abort before starting.
        let (ctx, shared) = context(hash_service("no-such-marker"), tx);
        shared.abort.store(true, Ordering::Release);
        run(ctx);
        match rx.try_recv().unwrap() {
            CoreMsg::Solver {
                outcome: SolverOutcome::Aborted { reason },
                ..
            } => assert_eq!(reason, AbortReason::Preempted),
            other => panic!("expected abort, got {:?}", msg_tag(&other)),
        }
    }

    #[test]
    fn aborts_when_engine_unavailable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = Arc::new(HashService::with_engine(
            EventBus::new(),
            Arc::new(MarkerEngine { marker: vec![] }),
            50,
            AdaptiveParams::default(),
        ));
        // Deliberately no init().
        let (ctx, _shared) = context(svc, tx);
        run(ctx);
        match rx.try_recv().unwrap() {
            CoreMsg::Solver {
                outcome: SolverOutcome::Aborted { reason },
                ..
            } => assert_eq!(reason, AbortReason::EngineUnavailable),
            other => panic!("expected abort, got {:?}", msg_tag(&other)),
        }
    }

    fn msg_tag(msg: &CoreMsg) -> &'static str {
        match msg {
            CoreMsg::Solver { .. } => "solver",
            _ => "other",
        }
    }
}
