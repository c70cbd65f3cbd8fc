// src/control.rs
// HTTP control surface: start/stop/status/config plus the SSE event stream.
// Thin by design; every decision lives in the orchestrator.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::SettingsPatch;
use crate::orchestrator::Miner;

pub fn router(miner: Arc<Miner>) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/status", get(status_handler))
        .route("/config", post(config_handler))
        .route("/events", get(events_handler))
        .with_state(miner)
}

pub async fn serve(listen_addr: &str, miner: Arc<Miner>) -> anyhow::Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌍 Control surface listening on http://{}", addr);
    axum::serve(listener, router(miner)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct StartRequest {
    #[serde(default)]
    password: String,
}

async fn start_handler(
    State(miner): State<Arc<Miner>>,
    payload: Option<Json<StartRequest>>,
) -> Json<Value> {
    let req = payload.map(|Json(r)| r).unwrap_or_default();
    match miner.start(&req.password).await {
        Ok(()) => Json(json!({ "ok": true, "stats": miner.status() })),
        Err(e) => Json(json!({ "ok": false, "error": e.to_string() })),
    }
}

async fn stop_handler(State(miner): State<Arc<Miner>>) -> Json<Value> {
    miner.stop().await;
    Json(json!({ "ok": true }))
}

async fn status_handler(State(miner): State<Arc<Miner>>) -> Json<Value> {
    Json(json!(miner.status()))
}

async fn config_handler(
    State(miner): State<Arc<Miner>>,
    Json(patch): Json<SettingsPatch>,
) -> Json<Value> {
    match miner.update_config(&patch).await {
        Ok(settings) => Json(json!({ "ok": true, "config": settings })),
        Err(e) => Json(json!({ "ok": false, "error": e.to_string() })),
    }
}

/// Server-sent event stream of the typed bus. The subscription handle lives
/// inside the stream, so a dropped connection unsubscribes by itself.
async fn events_handler(
    State(miner): State<Arc<Miner>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = miner.events().subscribe();
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        loop {
            let event = subscription.recv().await?;
            match SseEvent::default().json_data(&event) {
                Ok(sse) => return Some((Ok(sse), subscription)),
                Err(_) => continue,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}
