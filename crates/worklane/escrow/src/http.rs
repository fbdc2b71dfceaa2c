//! HTTP adapter for the escrow gateway.
//!
//! Transient failures (timeouts, connection errors, 5xx) are retried a
//! bounded number of times with exponential backoff and then surfaced as
//! [`GatewayError::Unavailable`]; 4xx responses are business rejections and
//! are never retried. Every mutating call carries an `Idempotency-Key`
//! header so retries are idempotent on the gateway side.

use crate::{CreateHold, EscrowGateway, GatewayError, HoldOutcome, HoldReceipt};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use worklane_types::{HoldId, RefundId, TransferId};

/// Connection settings for [`HttpEscrowGateway`].
#[derive(Clone, Debug)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retries after the first attempt, transient failures only.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9900".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// HTTP client for the external payment processor.
pub struct HttpEscrowGateway {
    client: Client,
    config: HttpGatewayConfig,
}

#[derive(Serialize)]
struct CreateHoldRequest<'a> {
    amount: f64,
    currency: &'a str,
    metadata: &'a std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct CreateHoldResponse {
    hold_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct HoldStatusResponse {
    status: HoldOutcome,
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    payee_account: &'a str,
    amount: f64,
}

#[derive(Deserialize)]
struct TransferResponse {
    transfer_id: String,
}

#[derive(Deserialize)]
struct RefundResponse {
    refund_id: String,
}

#[derive(Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpEscrowGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("failed to build client: {e}")))?;
        Ok(Self {
            client,
            config: HttpGatewayConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<R, GatewayError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut attempt = 0;
        let mut backoff = self.config.retry_backoff;
        loop {
            let mut request = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(body);
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }

            match request.send().await {
                Ok(response) => match classify(response).await {
                    Ok(response) => {
                        return response
                            .json::<R>()
                            .await
                            .map_err(|e| GatewayError::Unavailable(format!("bad response: {e}")))
                    }
                    Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                        warn!(%url, attempt, error = %err, "gateway call failed, retrying");
                    }
                    Err(err) => return Err(err),
                },
                Err(err) if attempt < self.config.max_retries => {
                    warn!(%url, attempt, error = %err, "gateway call failed, retrying");
                }
                Err(err) => {
                    return Err(GatewayError::Unavailable(format!("request failed: {err}")))
                }
            }

            attempt += 1;
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    async fn get_json<R: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<R, GatewayError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut attempt = 0;
        let mut backoff = self.config.retry_backoff;
        loop {
            let result = self
                .client
                .get(&url)
                .bearer_auth(&self.config.api_key)
                .send()
                .await;
            match result {
                Ok(response) => match classify(response).await {
                    Ok(response) => {
                        return response
                            .json::<R>()
                            .await
                            .map_err(|e| GatewayError::Unavailable(format!("bad response: {e}")))
                    }
                    Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                        warn!(%url, attempt, error = %err, "gateway call failed, retrying");
                    }
                    Err(err) => return Err(err),
                },
                Err(err) if attempt < self.config.max_retries => {
                    warn!(%url, attempt, error = %err, "gateway call failed, retrying");
                }
                Err(err) => {
                    return Err(GatewayError::Unavailable(format!("request failed: {err}")))
                }
            }

            attempt += 1;
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}

/// Split responses into success, business rejection, and transient failure.
async fn classify(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(GatewayError::Unavailable("rate limited".to_string()));
    }
    if status.is_client_error() {
        let body = response
            .json::<GatewayErrorBody>()
            .await
            .unwrap_or(GatewayErrorBody {
                code: None,
                message: None,
            });
        return Err(GatewayError::Rejected {
            code: body.code.unwrap_or_else(|| status.as_u16().to_string()),
            message: body
                .message
                .unwrap_or_else(|| "request rejected".to_string()),
        });
    }
    Err(GatewayError::Unavailable(format!(
        "gateway returned {status}"
    )))
}

#[async_trait]
impl EscrowGateway for HttpEscrowGateway {
    async fn create_hold(&self, request: CreateHold) -> Result<HoldReceipt, GatewayError> {
        debug!(amount = request.amount, currency = %request.currency, "creating escrow hold");
        let response: CreateHoldResponse = self
            .post_json(
                "/v1/holds",
                &CreateHoldRequest {
                    amount: request.amount,
                    currency: &request.currency,
                    metadata: &request.metadata,
                },
                Some(&request.idempotency_key),
            )
            .await?;
        Ok(HoldReceipt {
            hold_id: HoldId::new(response.hold_id),
            client_secret: response.client_secret,
        })
    }

    async fn verify_hold(&self, hold_id: &HoldId) -> Result<HoldOutcome, GatewayError> {
        let response: HoldStatusResponse = self.get_json(&format!("/v1/holds/{hold_id}")).await?;
        Ok(response.status)
    }

    async fn transfer(
        &self,
        hold_id: &HoldId,
        payee_account: &str,
        amount: f64,
    ) -> Result<TransferId, GatewayError> {
        debug!(%hold_id, payee_account, amount, "transferring held funds");
        let response: TransferResponse = self
            .post_json(
                &format!("/v1/holds/{hold_id}/transfer"),
                &TransferRequest {
                    payee_account,
                    amount,
                },
                Some(&hold_id.0),
            )
            .await?;
        Ok(TransferId::new(response.transfer_id))
    }

    async fn refund(&self, hold_id: &HoldId) -> Result<RefundId, GatewayError> {
        debug!(%hold_id, "refunding escrow hold");
        let response: RefundResponse = self
            .post_json(
                &format!("/v1/holds/{hold_id}/refund"),
                &serde_json::json!({}),
                Some(&hold_id.0),
            )
            .await?;
        Ok(RefundId::new(response.refund_id))
    }
}
