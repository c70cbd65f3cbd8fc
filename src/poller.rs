// src/poller.rs
// Polls the remote for the active challenge on a fixed cadence and reports
// phase changes to the scheduler. Rotation detection itself lives in the
// orchestrator, which already knows the current challenge id.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use crate::orchestrator::CoreMsg;
use crate::remote::{ChallengeStatus, RemoteGateway};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// Short retry when the remote says `active` but sent a partial payload.
const INCOMPLETE_RETRY: Duration = Duration::from_secs(1);

/// Where the remote currently is in its season, apart from a concrete
/// challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePhase {
    Before,
    After,
}

pub fn spawn(
    gateway: Arc<dyn RemoteGateway>,
    core_tx: mpsc::UnboundedSender<CoreMsg>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = match poll_once(&*gateway, &core_tx).await {
                PollStep::Continue => POLL_INTERVAL,
                PollStep::RetrySoon => INCOMPLETE_RETRY,
                PollStep::ChannelClosed => return,
            };
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {
                    debug!("Challenge poller stopping");
                    return;
                }
            }
        }
    })
}

enum PollStep {
    Continue,
    RetrySoon,
    ChannelClosed,
}

async fn poll_once(
    gateway: &dyn RemoteGateway,
    core_tx: &mpsc::UnboundedSender<CoreMsg>,
) -> PollStep {
    let status = match timeout(POLL_TIMEOUT, gateway.get_challenge()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            warn!("Challenge poll failed: {}", e);
            return PollStep::Continue;
        }
        Err(_) => {
            warn!("Challenge poll timed out after {:?}", POLL_TIMEOUT);
            return PollStep::Continue;
        }
    };

    let msg = match status {
        ChallengeStatus::Active(challenge) => CoreMsg::Challenge(challenge),
        ChallengeStatus::ActiveIncomplete => {
            debug!("Active challenge with partial data, retrying shortly");
            return PollStep::RetrySoon;
        }
        ChallengeStatus::Before { starts_at } => {
            debug!("Challenges not started yet (starts_at={:?})", starts_at);
            CoreMsg::Phase(RemotePhase::Before)
        }
        ChallengeStatus::After => CoreMsg::Phase(RemotePhase::After),
    };
    if core_tx.send(msg).is_err() {
        return PollStep::ChannelClosed;
    }
    PollStep::Continue
}
