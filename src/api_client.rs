// src/api_client.rs
// reqwest adapter for the Scavenger Mine API, implementing the remote
// capabilities. Response classification lives here so the scheduler and
// submitter only ever see typed outcomes.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::error::RemoteError;
use crate::remote::{
    AddressSubmissions, Challenge, ChallengeStatus, CryptoReceipt, DevFeeSource, RegisterOutcome,
    Registrar, RejectKind, RemoteGateway, SubmitOutcome, TransientKind,
};

const USER_AGENT: &str = "scavenger_swarm/0.1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
/// Dev-fee destination cache lifetime.
const DEVFEE_TTL: Duration = Duration::from_secs(3600);

/// ------------------ Wire types ------------------

#[derive(Debug, Deserialize, Clone)]
struct ChallengeWire {
    #[serde(rename = "challenge_id")]
    challenge_id: String,
    day: Option<u32>,
    #[serde(rename = "challenge_number")]
    challenge_number: Option<u32>,
    #[serde(rename = "latest_submission")]
    latest_submission: Option<String>,
    difficulty: Option<String>,
    #[serde(rename = "no_pre_mine")]
    no_pre_mine: Option<String>,
    #[serde(rename = "no_pre_mine_hour")]
    no_pre_mine_hour: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponse {
    code: String,
    challenge: Option<ChallengeWire>,
    #[serde(rename = "starts_at")]
    starts_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TermsResponse {
    pub version: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "crypto_receipt")]
    crypto_receipt: Option<CryptoReceipt>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(rename = "crypto_receipts")]
    crypto_receipts: Option<u64>,
    #[serde(rename = "last_submission")]
    last_submission: Option<String>,
    #[serde(default)]
    challenges: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DevFeeResponse {
    address: Option<String>,
}

/// ------------------ ApiClient ------------------

pub struct ApiClient {
    base_url: String,
    devfee_url: Option<String>,
    http_client: Client,
    terms: OnceCell<String>,
    devfee_cache: Mutex<Option<(String, std::time::Instant)>>,
}

impl ApiClient {
    pub fn new(base_url: &str, devfee_url: Option<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            devfee_url,
            http_client: client,
            terms: OnceCell::new(),
            devfee_cache: Mutex::new(None),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .get(format!("{}{}", self.base_url, path))
            .header("User-Agent", USER_AGENT)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .post(format!("{}{}", self.base_url, path))
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({}))
    }

    async fn fetch_terms(&self) -> Result<String, RemoteError> {
        let resp = self
            .get("/TandC")
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("GET /TandC: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let terms: TermsResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Permanent(format!("T&C parse error: {}", e)))?;
        info!("Fetched T&C version {}", terms.version);
        Ok(terms.message)
    }
}

fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        RemoteError::Transient(format!("{}: {}", status, body))
    } else {
        RemoteError::Permanent(format!("{}: {}", status, body))
    }
}

#[async_trait]
impl RemoteGateway for ApiClient {
    /// GET /challenge
    async fn get_challenge(&self) -> Result<ChallengeStatus, RemoteError> {
        let resp = self
            .get("/challenge")
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("GET /challenge: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let body: ChallengeResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Transient(format!("challenge parse error: {}", e)))?;

        match body.code.as_str() {
            "before" => Ok(ChallengeStatus::Before {
                starts_at: body.starts_at,
            }),
            "after" => Ok(ChallengeStatus::After),
            "active" => {
                let Some(wire) = body.challenge else {
                    return Ok(ChallengeStatus::ActiveIncomplete);
                };
                let (Some(difficulty), Some(no_pre_mine), Some(latest_submission), Some(hour)) = (
                    wire.difficulty,
                    wire.no_pre_mine,
                    wire.latest_submission,
                    wire.no_pre_mine_hour,
                ) else {
                    debug!("Active challenge with missing fields");
                    return Ok(ChallengeStatus::ActiveIncomplete);
                };
                Ok(ChallengeStatus::Active(Challenge {
                    challenge_id: wire.challenge_id,
                    difficulty,
                    no_pre_mine,
                    latest_submission,
                    no_pre_mine_hour: hour,
                    day: wire.day,
                    challenge_number: wire.challenge_number,
                }))
            }
            other => Err(RemoteError::Permanent(format!(
                "unexpected challenge code {:?}",
                other
            ))),
        }
    }

    /// POST /solution/{address}/{challenge_id}/{nonce}
    async fn submit_solution(&self, address: &str, challenge_id: &str, nonce: &str) -> SubmitOutcome {
        let path = format!("/solution/{}/{}/{}", address, challenge_id, nonce);
        let resp = match self.post(&path).send().await {
            Ok(resp) => resp,
            Err(e) => return SubmitOutcome::Transient(TransientKind::Network(e.to_string())),
        };
        let status = resp.status();

        if status.is_success() {
            return match resp.json::<SubmitResponse>().await {
                Ok(body) => {
                    if body.crypto_receipt.is_none() {
                        let lowered = body.message.as_deref().unwrap_or("").to_lowercase();
                        if lowered.contains("already") {
                            return SubmitOutcome::Rejected(RejectKind::Duplicate);
                        }
                        debug!("Accepted submission without crypto_receipt: {:?}", body.message);
                    }
                    SubmitOutcome::Accepted {
                        receipt: body.crypto_receipt,
                    }
                }
                Err(e) => SubmitOutcome::Transient(TransientKind::Network(format!(
                    "submit parse error: {}",
                    e
                ))),
            };
        }

        if status == StatusCode::REQUEST_TIMEOUT {
            return SubmitOutcome::Transient(TransientKind::Timeout);
        }
        if status.is_server_error() {
            return SubmitOutcome::Transient(TransientKind::ServerError(status.as_u16()));
        }

        let text = resp.text().await.unwrap_or_default();
        let lowered = text.to_lowercase();
        error!("❌ POST {} failed [{}]: {}", path, status, text);
        if lowered.contains("already") {
            SubmitOutcome::Rejected(RejectKind::Duplicate)
        } else if lowered.contains("expired") {
            SubmitOutcome::Rejected(RejectKind::ExpiredChallenge)
        } else if lowered.contains("nonce") {
            SubmitOutcome::Rejected(RejectKind::InvalidNonce)
        } else {
            SubmitOutcome::Rejected(RejectKind::Other(format!("{}: {}", status, text)))
        }
    }

    /// GET /statistics/{address}
    async fn get_address_submissions(&self, address: &str) -> Result<AddressSubmissions, RemoteError> {
        let resp = self
            .get(&format!("/statistics/{}", address))
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("GET /statistics: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let stats: StatsResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Transient(format!("statistics parse error: {}", e)))?;
        Ok(AddressSubmissions {
            count: stats.crypto_receipts.unwrap_or(0),
            last: stats.last_submission,
            challenges: stats.challenges,
        })
    }
}

#[async_trait]
impl Registrar for ApiClient {
    /// GET /TandC, fetched once per process.
    async fn tandc_message(&self) -> Result<String, RemoteError> {
        self.terms
            .get_or_try_init(|| self.fetch_terms())
            .await
            .map(String::clone)
    }

    /// POST /register/{address}/{signature}/{pubkey}
    async fn register(
        &self,
        address: &str,
        signature_hex: &str,
        pubkey_hex: &str,
    ) -> Result<RegisterOutcome, RemoteError> {
        let path = format!("/register/{}/{}/{}", address, signature_hex, pubkey_hex);
        let resp = self
            .post(&path)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(format!("POST /register: {}", e)))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(RegisterOutcome::Registered);
        }
        let text = resp.text().await.unwrap_or_default();
        if text.to_lowercase().contains("already") {
            return Ok(RegisterOutcome::AlreadyRegistered);
        }
        Err(classify_status(status, &text))
    }
}

#[async_trait]
impl DevFeeSource for ApiClient {
    /// Fetches the dev destination, cached for one hour. Any failure (or a
    /// missing endpoint) leaves the dev-fee slot skipped.
    async fn dev_address(&self) -> Option<String> {
        let url = self.devfee_url.as_ref()?;

        {
            let cache = self.devfee_cache.lock();
            if let Some((address, fetched_at)) = cache.as_ref() {
                if fetched_at.elapsed() < DEVFEE_TTL {
                    return Some(address.clone());
                }
            }
        }

        let resp = self
            .http_client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await;
        let resp = match resp {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!("Dev-fee endpoint returned {}", resp.status());
                return None;
            }
            Err(e) => {
                warn!("Dev-fee endpoint unreachable: {}", e);
                return None;
            }
        };
        let body: DevFeeResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Dev-fee response parse error: {}", e);
                return None;
            }
        };
        let address = body.address.filter(|a| !a.trim().is_empty())?;
        *self.devfee_cache.lock() = Some((address.clone(), std::time::Instant::now()));
        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(&server.base_url(), None).unwrap()
    }

    #[tokio::test]
    async fn parses_active_challenge() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/challenge");
                then.status(200).json_body(serde_json::json!({
                    "code": "active",
                    "challenge": {
                        "challenge_id": "C1",
                        "day": 3,
                        "challenge_number": 7,
                        "difficulty": "000fffff",
                        "no_pre_mine": "aabbcc",
                        "latest_submission": "2026-01-01T00:00:00Z",
                        "no_pre_mine_hour": "ddeeff"
                    }
                }));
            })
            .await;

        let status = client(&server).get_challenge().await.unwrap();
        match status {
            ChallengeStatus::Active(c) => {
                assert_eq!(c.challenge_id, "C1");
                assert_eq!(c.difficulty, "000fffff");
                assert_eq!(c.day, Some(3));
            }
            other => panic!("expected active, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn partial_active_payload_is_incomplete() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/challenge");
                then.status(200).json_body(serde_json::json!({
                    "code": "active",
                    "challenge": { "challenge_id": "C1" }
                }));
            })
            .await;

        let status = client(&server).get_challenge().await.unwrap();
        assert_eq!(status, ChallengeStatus::ActiveIncomplete);
    }

    #[tokio::test]
    async fn before_phase_passes_starts_at() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/challenge");
                then.status(200).json_body(serde_json::json!({
                    "code": "before",
                    "starts_at": "2026-02-01T00:00:00Z"
                }));
            })
            .await;

        let status = client(&server).get_challenge().await.unwrap();
        assert_eq!(
            status,
            ChallengeStatus::Before {
                starts_at: Some("2026-02-01T00:00:00Z".into())
            }
        );
    }

    #[tokio::test]
    async fn submit_accepted_with_receipt() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/solution/addr1/C1/0000000000003039");
                then.status(200).json_body(serde_json::json!({
                    "crypto_receipt": {
                        "preimage": "p",
                        "timestamp": "t",
                        "signature": "s"
                    }
                }));
            })
            .await;

        let outcome = client(&server)
            .submit_solution("addr1", "C1", "0000000000003039")
            .await;
        match outcome {
            SubmitOutcome::Accepted { receipt } => {
                assert_eq!(receipt.unwrap().signature, "s");
            }
            other => panic!("expected accepted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_duplicate_and_expired_classification() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/solution/dup/C1/00");
                then.status(409).body("Solution already exists for this address");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/solution/exp/C1/00");
                then.status(400).body("challenge expired");
            })
            .await;

        let c = client(&server);
        assert!(matches!(
            c.submit_solution("dup", "C1", "00").await,
            SubmitOutcome::Rejected(RejectKind::Duplicate)
        ));
        assert!(matches!(
            c.submit_solution("exp", "C1", "00").await,
            SubmitOutcome::Rejected(RejectKind::ExpiredChallenge)
        ));
    }

    #[tokio::test]
    async fn submit_transient_classification() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/solution/s503/C1/00");
                then.status(503).body("try later");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/solution/s408/C1/00");
                then.status(408).body("timeout");
            })
            .await;

        let c = client(&server);
        assert!(matches!(
            c.submit_solution("s503", "C1", "00").await,
            SubmitOutcome::Transient(TransientKind::ServerError(503))
        ));
        assert!(matches!(
            c.submit_solution("s408", "C1", "00").await,
            SubmitOutcome::Transient(TransientKind::Timeout)
        ));
    }

    #[tokio::test]
    async fn terms_are_cached() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/TandC");
                then.status(200).json_body(serde_json::json!({
                    "version": "1",
                    "content": "...",
                    "message": "I accept the terms"
                }));
            })
            .await;

        let c = client(&server);
        assert_eq!(c.tandc_message().await.unwrap(), "I accept the terms");
        assert_eq!(c.tandc_message().await.unwrap(), "I accept the terms");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn register_classifies_already_registered() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/register/new/sig/pk");
                then.status(200).json_body(serde_json::json!({
                    "registrationReceipt": {
                        "preimage": "p", "signature": "s", "timestamp": "t"
                    }
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/register/old/sig/pk");
                then.status(409).body("address already registered");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/register/bad/sig/pk");
                then.status(500).body("boom");
            })
            .await;

        let c = client(&server);
        assert_eq!(
            c.register("new", "sig", "pk").await.unwrap(),
            RegisterOutcome::Registered
        );
        assert_eq!(
            c.register("old", "sig", "pk").await.unwrap(),
            RegisterOutcome::AlreadyRegistered
        );
        assert!(matches!(
            c.register("bad", "sig", "pk").await,
            Err(RemoteError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn devfee_fetch_and_cache() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/devfee");
                then.status(200)
                    .json_body(serde_json::json!({ "address": "addr1qdev" }));
            })
            .await;

        let c = ApiClient::new(&server.base_url(), Some(server.url("/devfee"))).unwrap();
        assert_eq!(c.dev_address().await.as_deref(), Some("addr1qdev"));
        assert_eq!(c.dev_address().await.as_deref(), Some("addr1qdev"));
        mock.assert_hits_async(1).await;

        // No endpoint configured means the feature is simply off.
        let off = ApiClient::new(&server.base_url(), None).unwrap();
        assert_eq!(off.dev_address().await, None);
    }
}
