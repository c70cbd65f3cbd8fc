// End-to-end scheduler scenarios over in-memory capabilities: mock gateway,
// instant hash engine, stub signer. Real worker threads, real scheduler
// loop, no network and no ROM.

use std::time::Duration;

use scavenger_swarm::config::SettingsPatch;
use scavenger_swarm::events::EventPayload;
use scavenger_swarm::orchestrator::MinerState;
use scavenger_swarm::remote::ChallengeStatus;
use scavenger_swarm::test_utils::{test_challenge, test_rig, wait_for, WINDOW};

const ADDR0: &str = "addr1qtest000000";
const NO_HIT: &str = "marker-that-never-appears";

fn two_workers() -> SettingsPatch {
    SettingsPatch {
        worker_threads: Some(2),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_solves_and_submits() {
    let rig = test_rig(
        "happy",
        ChallengeStatus::Active(test_challenge("C1")),
        ADDR0,
        None,
    );
    rig.miner.update_config(&two_workers()).await.unwrap();
    let mut events = rig.events.subscribe();

    rig.miner.start("").await.unwrap();

    assert!(
        wait_for(Duration::from_secs(20), || rig.gateway.accepted_count() >= 1).await,
        "no solution was accepted"
    );
    assert_eq!(rig.gateway.accepted_addresses()[0], ADDR0);

    // The registry marks the address solved and the receipt reaches the sink.
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.miner.status().addresses.solved >= 1
        })
        .await
    );
    assert!(
        wait_for(Duration::from_secs(5), || !rig.sink.receipts.lock().is_empty()).await
    );
    {
        let receipts = rig.sink.receipts.lock();
        assert_eq!(receipts[0].address, ADDR0);
        assert_eq!(receipts[0].challenge_id, "C1");
        assert!(!receipts[0].dev_fee);
    }

    let status = rig.miner.status();
    assert!(status.totals.solutions_accepted >= 1);
    assert_eq!(status.challenge_id.as_deref(), Some("C1"));

    // The event stream carried the whole lifecycle.
    let mut saw_mining_start = false;
    let mut saw_submit = false;
    let mut saw_result_ok = false;
    while let Some(event) = events.try_recv() {
        match event.payload {
            EventPayload::MiningStart { .. } => saw_mining_start = true,
            EventPayload::SolutionSubmit { .. } => saw_submit = true,
            EventPayload::SolutionResult { ok: true, .. } => saw_result_ok = true,
            _ => {}
        }
    }
    assert!(saw_mining_start && saw_submit && saw_result_ok);

    rig.miner.stop().await;
    assert_eq!(rig.miner.status().state, MinerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_runs_before_mining() {
    let rig = test_rig(
        "registration",
        ChallengeStatus::Active(test_challenge("C1")),
        NO_HIT,
        None,
    );
    rig.miner.update_config(&two_workers()).await.unwrap();
    rig.miner.start("").await.unwrap();

    assert!(
        wait_for(Duration::from_secs(20), || {
            rig.registrar.registered.lock().len() as u32 == WINDOW
        })
        .await,
        "registration did not cover the window"
    );
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.miner.status().addresses.registered == WINDOW
        })
        .await
    );

    // With registration done the pool moves to the full budget.
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.miner.status().effective_budget == 2
        })
        .await
    );

    rig.miner.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rotation_reassigns_workers_to_new_challenge() {
    let rig = test_rig(
        "rotation",
        ChallengeStatus::Active(test_challenge("C1")),
        NO_HIT,
        None,
    );
    rig.miner.update_config(&two_workers()).await.unwrap();
    let mut events = rig.events.subscribe();
    rig.miner.start("").await.unwrap();

    // Wait until workers are actually mining C1.
    assert!(
        wait_for(Duration::from_secs(20), || {
            let s = rig.miner.status();
            s.challenge_id.as_deref() == Some("C1") && s.addresses.in_progress >= 1
        })
        .await,
        "never started mining C1"
    );

    rig.gateway.set_status(ChallengeStatus::Active(test_challenge("C2")));

    // The poller picks the rotation up, the registry resets and workers are
    // reassigned under the new challenge id.
    assert!(
        wait_for(Duration::from_secs(20), || {
            let s = rig.miner.status();
            s.challenge_id.as_deref() == Some("C2") && s.addresses.in_progress >= 1
        })
        .await,
        "rotation did not reassign workers"
    );

    let mut saw_rotation = false;
    while let Some(event) = events.try_recv() {
        if let EventPayload::ChallengeRotated { challenge_id } = &event.payload {
            if challenge_id == "C2" {
                saw_rotation = true;
            }
        }
    }
    assert!(saw_rotation);

    rig.miner.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_rejection_still_marks_solved() {
    let rig = test_rig(
        "duplicate",
        ChallengeStatus::Active(test_challenge("C1")),
        ADDR0,
        None,
    );
    rig.gateway.duplicate_addresses.lock().insert(ADDR0.to_string());
    rig.miner.update_config(&two_workers()).await.unwrap();
    rig.miner.start("").await.unwrap();

    assert!(
        wait_for(Duration::from_secs(20), || {
            rig.miner.status().addresses.solved >= 1
        })
        .await,
        "duplicate was not marked solved"
    );
    // Nothing was actually accepted by the gateway, and nothing was paused.
    assert_eq!(rig.gateway.accepted_count(), 0);
    assert_eq!(rig.miner.status().addresses.paused, 0);

    rig.miner.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dev_fee_interleaves_after_sixteen_accepted() {
    let rig = test_rig(
        "devfee",
        ChallengeStatus::Active(test_challenge("C1")),
        // Everything hits: user solutions accumulate fast.
        "",
        Some("addr1qdevfee".to_string()),
    );
    rig.miner.update_config(&two_workers()).await.unwrap();
    rig.miner.start("").await.unwrap();

    assert!(
        wait_for(Duration::from_secs(30), || {
            rig.gateway
                .accepted_addresses()
                .iter()
                .any(|a| a == "addr1qdevfee")
        })
        .await,
        "dev submission never happened"
    );

    let accepted = rig.gateway.accepted_addresses();
    let dev_count = accepted.iter().filter(|a| *a == "addr1qdevfee").count();
    let user_count = accepted.iter().filter(|a| *a != "addr1qdevfee").count();
    assert_eq!(dev_count, 1, "exactly one dev submission expected");
    assert!(user_count >= 16, "dev slot fired before 16 accepted solutions");
    assert!(rig.devfee.requests.load(std::sync::atomic::Ordering::Relaxed) >= 1);

    let status = rig.miner.status();
    assert_eq!(status.totals.dev_solutions_accepted, 1);

    rig.miner.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disabled_dev_fee_never_interleaves() {
    let rig = test_rig(
        "devfee-off",
        ChallengeStatus::Active(test_challenge("C1")),
        "",
        Some("addr1qdevfee".to_string()),
    );
    let patch = SettingsPatch {
        worker_threads: Some(2),
        dev_fee_enabled: Some(false),
        ..Default::default()
    };
    rig.miner.update_config(&patch).await.unwrap();
    rig.miner.start("").await.unwrap();

    assert!(
        wait_for(Duration::from_secs(20), || rig.gateway.accepted_count() >= 20).await,
        "not enough accepted solutions"
    );
    assert!(
        !rig.gateway
            .accepted_addresses()
            .iter()
            .any(|a| a == "addr1qdevfee"),
        "dev submission happened while disabled"
    );

    rig.miner.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_password_fails_start_and_recovers() {
    let rig = test_rig(
        "password",
        ChallengeStatus::Before { starts_at: None },
        NO_HIT,
        None,
    );
    rig.miner.update_config(&two_workers()).await.unwrap();

    assert!(rig.miner.start("wrong").await.is_err());
    assert_eq!(rig.miner.status().state, MinerState::Error);
    assert!(!rig.miner.is_running().await);

    // The control surface stays usable and a correct start succeeds.
    rig.miner.start("").await.unwrap();
    assert!(rig.miner.is_running().await);
    assert!(
        wait_for(Duration::from_secs(10), || {
            // No active challenge: the session parks itself.
            matches!(
                rig.miner.status().state,
                MinerState::Paused | MinerState::Registering
            )
        })
        .await
    );
    rig.miner.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_then_start_is_clean() {
    let rig = test_rig(
        "restart",
        ChallengeStatus::Active(test_challenge("C1")),
        NO_HIT,
        None,
    );
    rig.miner.update_config(&two_workers()).await.unwrap();

    rig.miner.start("").await.unwrap();
    assert!(rig.miner.store().get().was_mining_active);
    assert!(
        wait_for(Duration::from_secs(20), || {
            rig.miner.status().addresses.in_progress >= 1
        })
        .await
    );
    rig.miner.stop().await;
    assert!(!rig.miner.store().get().was_mining_active);
    assert_eq!(rig.miner.status().state, MinerState::Stopped);

    // Second run comes up the same way.
    rig.miner.start("").await.unwrap();
    assert!(
        wait_for(Duration::from_secs(20), || {
            rig.miner.status().addresses.in_progress >= 1
        })
        .await
    );
    rig.miner.stop().await;
}
