// src/submitter.rs
// Delivers solution candidates to the remote gateway with bounded retries
// and exponential backoff, then reports the classified outcome back to the
// scheduler. Runs entirely on the I/O runtime; worker threads never block
// on the network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep, timeout};

use crate::events::{EventBus, EventPayload};
use crate::orchestrator::CoreMsg;
use crate::preimage::nonce_hex;
use crate::remote::{CryptoReceipt, RejectKind, RemoteGateway, SubmitOutcome};
use crate::solver::SolutionCandidate;

pub const MAX_ATTEMPTS: u32 = 5;
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);
/// Hard wall-clock ceiling for one candidate, retries included.
pub const OVERALL_DEADLINE: Duration = Duration::from_secs(30);
/// Concurrent in-flight submissions; the rest queue.
const IN_FLIGHT: usize = 4;

/// Terminal outcome of one candidate, already mapped to the registry action
/// the scheduler must take.
#[derive(Debug, Clone)]
pub enum SubmissionResult {
    Accepted { receipt: Option<CryptoReceipt> },
    /// Someone already solved with this address; treated as solved.
    Duplicate,
    /// Invalid nonce or expired challenge: release the address, no penalty.
    Discarded { detail: String },
    /// Permanent rejection or exhausted retries: counts toward the pause
    /// threshold.
    Failed { detail: String },
}

#[derive(Clone)]
pub struct SubmitterHandle {
    queue: mpsc::UnboundedSender<SolutionCandidate>,
    backlog: Arc<AtomicUsize>,
}

impl SubmitterHandle {
    pub fn submit(&self, candidate: SolutionCandidate) {
        self.backlog.fetch_add(1, Ordering::Relaxed);
        if self.queue.send(candidate).is_err() {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Queued plus in-flight candidates; drives solver backpressure.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}

pub fn spawn(
    gateway: Arc<dyn RemoteGateway>,
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) -> SubmitterHandle {
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<SolutionCandidate>();
    let backlog = Arc::new(AtomicUsize::new(0));
    let handle = SubmitterHandle {
        queue: queue_tx,
        backlog: Arc::clone(&backlog),
    };

    let semaphore = Arc::new(Semaphore::new(IN_FLIGHT));
    tokio::spawn(async move {
        loop {
            let candidate = tokio::select! {
                maybe = queue_rx.recv() => match maybe {
                    Some(c) => c,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let gateway = Arc::clone(&gateway);
            let core_tx = core_tx.clone();
            let events = events.clone();
            let backlog = Arc::clone(&backlog);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = submit_one(gateway, &events, &candidate, shutdown).await;
                backlog.fetch_sub(1, Ordering::Relaxed);
                let _ = core_tx.send(CoreMsg::Submission { candidate, result });
                drop(permit);
            });
        }
    });

    handle
}

async fn submit_one(
    gateway: Arc<dyn RemoteGateway>,
    events: &EventBus,
    candidate: &SolutionCandidate,
    mut shutdown: watch::Receiver<bool>,
) -> SubmissionResult {
    let nonce = nonce_hex(candidate.nonce);
    let started = Instant::now();

    for attempt in 1..=MAX_ATTEMPTS {
        events.publish(EventPayload::SolutionSubmit {
            address_index: candidate.address_index,
            challenge_id: candidate.challenge_id.clone(),
            nonce: nonce.clone(),
            attempt,
        });

        // A stop abandons the attempt immediately, mid-request included.
        let outcome = tokio::select! {
            res = timeout(
                SUBMIT_TIMEOUT,
                gateway.submit_solution(&candidate.address, &candidate.challenge_id, &nonce),
            ) => match res {
                Ok(outcome) => outcome,
                Err(_) => SubmitOutcome::Transient(crate::remote::TransientKind::Timeout),
            },
            _ = shutdown.changed() => {
                return SubmissionResult::Failed {
                    detail: "abandoned: miner stopping".into(),
                };
            }
        };

        match outcome {
            SubmitOutcome::Accepted { receipt } => {
                info!(
                    "✅ Solution accepted: address={} challenge={} nonce={}",
                    candidate.address, candidate.challenge_id, nonce
                );
                return SubmissionResult::Accepted { receipt };
            }
            SubmitOutcome::Rejected(RejectKind::Duplicate) => {
                return SubmissionResult::Duplicate;
            }
            SubmitOutcome::Rejected(RejectKind::InvalidNonce) => {
                return SubmissionResult::Discarded {
                    detail: "invalid nonce".into(),
                };
            }
            SubmitOutcome::Rejected(RejectKind::ExpiredChallenge) => {
                return SubmissionResult::Discarded {
                    detail: "challenge expired".into(),
                };
            }
            SubmitOutcome::Rejected(RejectKind::Other(detail)) => {
                return SubmissionResult::Failed { detail };
            }
            SubmitOutcome::Transient(kind) => {
                warn!(
                    "Transient submission failure (attempt {}/{}): {:?}",
                    attempt, MAX_ATTEMPTS, kind
                );
                let delay = Duration::from_secs_f64(1.5 * attempt as f64);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => {
                        return SubmissionResult::Failed {
                            detail: "abandoned: miner stopping".into(),
                        };
                    }
                }
                if attempt == MAX_ATTEMPTS || started.elapsed() >= OVERALL_DEADLINE {
                    return SubmissionResult::Failed {
                        detail: format!("transient failures exhausted after {} attempts", attempt),
                    };
                }
            }
        }
    }

    SubmissionResult::Failed {
        detail: "retries exhausted".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::{AddressSubmissions, ChallengeStatus, TransientKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedGateway {
        outcomes: Mutex<Vec<SubmitOutcome>>,
        attempts: AtomicUsize,
    }

    impl ScriptedGateway {
        fn new(outcomes: Vec<SubmitOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteGateway for ScriptedGateway {
        async fn get_challenge(&self) -> Result<ChallengeStatus, RemoteError> {
            Err(RemoteError::Permanent("not used".into()))
        }

        async fn submit_solution(&self, _a: &str, _c: &str, _n: &str) -> SubmitOutcome {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let mut outcomes = self.outcomes.lock();
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes[0].clone()
            }
        }

        async fn get_address_submissions(
            &self,
            _a: &str,
        ) -> Result<AddressSubmissions, RemoteError> {
            Ok(AddressSubmissions::default())
        }
    }

    fn candidate() -> SolutionCandidate {
        SolutionCandidate {
            worker_id: 0,
            address_index: Some(2),
            address: "addr1qsubmit".into(),
            challenge_id: "C1".into(),
            nonce: 12345,
            digest_hex: String::new(),
        }
    }

    fn shutdown_rx() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test duration.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn accepted_first_try() {
        let gateway = ScriptedGateway::new(vec![SubmitOutcome::Accepted { receipt: None }]);
        let result = submit_one(
            Arc::clone(&gateway) as Arc<dyn RemoteGateway>,
            &EventBus::new(),
            &candidate(),
            shutdown_rx(),
        )
        .await;
        assert!(matches!(result, SubmissionResult::Accepted { .. }));
        assert_eq!(gateway.attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_retries_five_times_then_fails() {
        let gateway = ScriptedGateway::new(vec![SubmitOutcome::Transient(TransientKind::ServerError(503))]);
        let started = tokio::time::Instant::now();
        let result = submit_one(
            Arc::clone(&gateway) as Arc<dyn RemoteGateway>,
            &EventBus::new(),
            &candidate(),
            shutdown_rx(),
        )
        .await;
        assert!(matches!(result, SubmissionResult::Failed { .. }));
        assert_eq!(gateway.attempts.load(Ordering::Relaxed), MAX_ATTEMPTS as usize);
        // Backoff schedule is 1.5, 3.0, 4.5, 6.0, 7.5 seconds.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs_f64(22.5));
        assert!(elapsed < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_accepted() {
        let gateway = ScriptedGateway::new(vec![
            SubmitOutcome::Transient(TransientKind::Network("reset".into())),
            SubmitOutcome::Accepted { receipt: None },
        ]);
        let result = submit_one(
            Arc::clone(&gateway) as Arc<dyn RemoteGateway>,
            &EventBus::new(),
            &candidate(),
            shutdown_rx(),
        )
        .await;
        assert!(matches!(result, SubmissionResult::Accepted { .. }));
        assert_eq!(gateway.attempts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn duplicate_is_terminal_and_not_punished() {
        let gateway = ScriptedGateway::new(vec![SubmitOutcome::Rejected(RejectKind::Duplicate)]);
        let result = submit_one(
            Arc::clone(&gateway) as Arc<dyn RemoteGateway>,
            &EventBus::new(),
            &candidate(),
            shutdown_rx(),
        )
        .await;
        assert!(matches!(result, SubmissionResult::Duplicate));
        assert_eq!(gateway.attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn expired_challenge_is_discarded() {
        let gateway =
            ScriptedGateway::new(vec![SubmitOutcome::Rejected(RejectKind::ExpiredChallenge)]);
        let result = submit_one(
            Arc::clone(&gateway) as Arc<dyn RemoteGateway>,
            &EventBus::new(),
            &candidate(),
            shutdown_rx(),
        )
        .await;
        assert!(matches!(result, SubmissionResult::Discarded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn handle_tracks_backlog() {
        let gateway = ScriptedGateway::new(vec![SubmitOutcome::Accepted { receipt: None }]);
        let (core_tx, mut core_rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn(gateway as Arc<dyn RemoteGateway>, core_tx, EventBus::new(), stop_rx);
        handle.submit(candidate());
        assert_eq!(handle.backlog(), 1);
        let msg = core_rx.recv().await.unwrap();
        assert!(matches!(msg, CoreMsg::Submission { .. }));
        assert_eq!(handle.backlog(), 0);
    }
}
