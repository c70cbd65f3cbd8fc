// Control surface tests over a real TCP listener: status, config patching
// and start failure reporting, end to end through axum.

use std::time::Duration;

use scavenger_swarm::control;
use scavenger_swarm::remote::ChallengeStatus;
use scavenger_swarm::test_utils::test_rig;

async fn serve_rig(tag: &str) -> (scavenger_swarm::test_utils::TestRig, String) {
    let rig = test_rig(tag, ChallengeStatus::Before { starts_at: None }, "none", None);
    let router = control::router(rig.miner.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (rig, format!("http://{}", addr))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_reports_stopped_and_config() {
    let (_rig, base) = serve_rig("ctl-status").await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["config"]["workerThreads"], 11);
    assert_eq!(body["config"]["batchSize"], 300);
    assert_eq!(body["hash"]["rom_ready"], false);
    assert!(body["hash"]["current_batch"].as_u64().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_updates_round_trip_and_validate() {
    let (_rig, base) = serve_rig("ctl-config").await;
    let client = reqwest::Client::new();

    let ok: serde_json::Value = client
        .post(format!("{}/config", base))
        .json(&serde_json::json!({ "workerThreads": 7, "batchSize": 512 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["ok"], true);
    assert_eq!(ok["config"]["workerThreads"], 7);

    let status: serde_json::Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["config"]["workerThreads"], 7);
    assert_eq!(status["config"]["batchSize"], 512);

    // Out-of-range values are rejected without touching anything.
    let bad: serde_json::Value = client
        .post(format!("{}/config", base))
        .json(&serde_json::json!({ "batchSize": 10 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bad["ok"], false);
    assert!(bad["error"].as_str().unwrap().contains("batchSize"));

    let status: serde_json::Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["config"]["batchSize"], 512);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_with_bad_password_reports_error() {
    let (rig, base) = serve_rig("ctl-start").await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(format!("{}/start", base))
        .json(&serde_json::json!({ "password": "wrong" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], false);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .to_lowercase()
        .contains("password"));

    // A good start from the same surface works, then stop cleans up.
    let body: serde_json::Value = client
        .post(format!("{}/start", base))
        .json(&serde_json::json!({ "password": "" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let body: serde_json::Value = client
        .post(format!("{}/stop", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert!(!rig.miner.is_running().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_stream_delivers_status_events() {
    let (rig, base) = serve_rig("ctl-events").await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/events", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    rig.events.publish(scavenger_swarm::events::EventPayload::Status {
        state: "paused".into(),
        message: "test".into(),
    });

    // Read one SSE chunk and check the typed payload came through.
    let mut resp = resp;
    let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
        .await
        .expect("no SSE data within timeout")
        .unwrap()
        .expect("stream closed");
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("\"type\":\"status\""), "unexpected chunk: {}", text);
}
