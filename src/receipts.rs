// src/receipts.rs
// Receipt persistence lives outside the core; these are the two stock sinks:
// an append-only JSON log on disk and a fire-and-forget HTTP poster for the
// backend collector service.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::remote::{HashrateSample, ReceiptSink, SolutionReceipt};

/// ------------------ File log ------------------

#[derive(Serialize, Deserialize, Default)]
struct ReceiptFile {
    receipts: Vec<SolutionReceipt>,
}

/// JSON receipt log with atomic saves.
pub struct FileReceiptLog {
    path: PathBuf,
    entries: Mutex<ReceiptFile>,
}

impl FileReceiptLog {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => ReceiptFile::default(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, receipt: SolutionReceipt) {
        let mut entries = self.entries.lock();
        entries.receipts.push(receipt);
        let text = match serde_json::to_string_pretty(&*entries) {
            Ok(t) => t,
            Err(e) => {
                warn!("Could not serialize receipt log: {}", e);
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, text).and_then(|_| std::fs::rename(&tmp, &self.path)) {
            warn!("Could not write receipt log {}: {}", self.path.display(), e);
        }
    }
}

#[async_trait]
impl ReceiptSink for FileReceiptLog {
    async fn record_solution(&self, receipt: &SolutionReceipt) {
        self.append(receipt.clone());
        info!(
            "🧾 Receipt logged: address={} challenge={} nonce={}",
            receipt.address, receipt.challenge_id, receipt.nonce
        );
    }

    async fn record_hashrate(&self, _sample: &HashrateSample) {
        // Rate samples are not worth a disk write.
    }
}

/// ------------------ HTTP sink ------------------

/// Posts receipts and rate samples to the backend collector. Sends are
/// fire-and-forget with a short timeout so a slow collector can never hold
/// up the scheduler.
pub struct HttpReceiptSink {
    client: Client,
    base_url: String,
    bearer_token: String,
}

impl HttpReceiptSink {
    pub fn new(base_url: &str, bearer_token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.unwrap_or_default(),
        })
    }

    fn post_json(&self, path: &str, body: Vec<u8>) {
        let url = format!("{}{}", self.base_url, path);
        let client = self.client.clone();
        let bearer = self.bearer_token.clone();
        tokio::spawn(async move {
            let req = client
                .post(&url)
                .header("content-type", "application/json")
                .header("Authorization", format!("Bearer {}", bearer))
                .body(body);
            match tokio::time::timeout(Duration::from_secs(1), req.send()).await {
                Ok(Ok(resp)) if !resp.status().is_success() => {
                    warn!("Sink {} returned status={}", url, resp.status());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("HTTP error posting to {}: {}", url, e),
                Err(_) => warn!("Post to {} timed out", url),
            }
        });
    }
}

#[async_trait]
impl ReceiptSink for HttpReceiptSink {
    async fn record_solution(&self, receipt: &SolutionReceipt) {
        match serde_json::to_vec(receipt) {
            Ok(body) => self.post_json("/insert_receipt", body),
            Err(e) => warn!("Could not serialize receipt: {}", e),
        }
    }

    async fn record_hashrate(&self, sample: &HashrateSample) {
        match serde_json::to_vec(sample) {
            Ok(body) => self.post_json("/insert_stat", body),
            Err(e) => warn!("Could not serialize stat sample: {}", e),
        }
    }
}

/// Fans one record out to several sinks (typically file + HTTP).
pub struct CompositeSink {
    sinks: Vec<Box<dyn ReceiptSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Box<dyn ReceiptSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ReceiptSink for CompositeSink {
    async fn record_solution(&self, receipt: &SolutionReceipt) {
        for sink in &self.sinks {
            sink.record_solution(receipt).await;
        }
    }

    async fn record_hashrate(&self, sample: &HashrateSample) {
        for sink in &self.sinks {
            sink.record_hashrate(sample).await;
        }
    }
}
