//! REST client for a custodial wallet provider.
//!
//! `POST {base}/v1/transfers` creates a transfer keyed by the obligation id,
//! `GET {base}/v1/transfers/{id}` reports its status and
//! `GET {base}/v1/transfers/by-key/{key}` finds it by idempotency key.
//!
//! Only a 4xx answer is a rejection. Timeouts, dropped connections, 5xx and
//! unreadable success bodies leave the transfer's existence unknown and are
//! reported as [`RentflowError::RailUnavailable`].

use crate::validate_base58_wallet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rentflow_core::error::{RentflowError, RentflowResult};
use rentflow_core::rail::{
    PaymentRailAdapter, RailStatus, RailSubmission, RailTransferState, TransferRequest,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub(crate) const RAIL_ID: &str = "custodial";

#[derive(Debug, Serialize)]
struct CreateTransferBody<'a> {
    idempotency_key: &'a str,
    amount: String,
    currency: &'a str,
    source_wallet: &'a str,
    destination_wallet: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferResource {
    id: String,
    status: String,
    #[serde(default)]
    settled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    failure_reason: Option<String>,
}

impl TransferResource {
    fn state(&self) -> RailTransferState {
        match self.status.to_ascii_lowercase().as_str() {
            "complete" | "completed" | "settled" => RailTransferState::Settled,
            "failed" | "rejected" | "cancelled" => RailTransferState::Failed,
            _ => RailTransferState::InFlight,
        }
    }
}

/// Custodial provider rail over HTTPS with a bearer API key.
#[derive(Debug, Clone)]
pub struct HttpCustodialRail {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpCustodialRail {
    pub fn new(base_url: &str, api_key: &str, request_timeout_secs: u64) -> RentflowResult<Self> {
        if base_url.trim().is_empty() {
            return Err(RentflowError::Configuration(
                "custodial rail base_url is empty".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs.max(1)))
            .build()
            .map_err(|e| RentflowError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn decode(response: reqwest::Response) -> RentflowResult<TransferResource> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| {
                RentflowError::rail_unavailable(RAIL_ID, format!("malformed response: {e}"))
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(RentflowError::rail_unavailable(
                RAIL_ID,
                format!("HTTP {status}: {body}"),
            ));
        }
        let message = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                format!("credentials rejected (HTTP {status})")
            }
            StatusCode::NOT_FOUND => format!("transfer not found (HTTP {status})"),
            _ => format!("HTTP {status}: {body}"),
        };
        Err(RentflowError::rail(RAIL_ID, message))
    }
}

/// A refused connection never carried the request; anything later might have.
fn transport_error(stage: &str, err: reqwest::Error) -> RentflowError {
    if err.is_connect() {
        RentflowError::rail(RAIL_ID, format!("{stage}: provider unreachable: {err}"))
    } else {
        RentflowError::rail_unavailable(RAIL_ID, format!("{stage}: {err}"))
    }
}

impl From<TransferResource> for RailStatus {
    fn from(transfer: TransferResource) -> Self {
        Self {
            state: transfer.state(),
            settled_at: transfer.settled_at,
            reason: transfer.failure_reason,
            reference: Some(transfer.id),
        }
    }
}

#[async_trait]
impl PaymentRailAdapter for HttpCustodialRail {
    fn rail_id(&self) -> &str {
        RAIL_ID
    }

    fn validate_wallet(&self, wallet_id: &str) -> RentflowResult<()> {
        validate_base58_wallet(wallet_id)
    }

    async fn submit(&self, request: &TransferRequest) -> RentflowResult<RailSubmission> {
        let body = CreateTransferBody {
            idempotency_key: &request.obligation_id,
            amount: request.decimal_amount(),
            currency: &request.currency.code,
            source_wallet: &request.source_wallet,
            destination_wallet: &request.destination_wallet,
        };
        let response = self
            .client
            .post(format!("{}/v1/transfers", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("submit", e))?;

        let transfer = Self::decode(response).await?;
        debug!(
            obligation_id = %request.obligation_id,
            reference = %transfer.id,
            status = %transfer.status,
            "custodial transfer created"
        );
        Ok(RailSubmission {
            initial_state: transfer.state(),
            reference: transfer.id,
        })
    }

    async fn status(&self, reference: &str) -> RentflowResult<RailStatus> {
        let response = self
            .client
            .get(format!("{}/v1/transfers/{reference}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport_error("status fetch", e))?;

        Ok(Self::decode(response).await?.into())
    }

    async fn lookup(&self, idempotency_key: &str) -> RentflowResult<Option<RailStatus>> {
        let response = self
            .client
            .get(format!(
                "{}/v1/transfers/by-key/{idempotency_key}",
                self.base_url
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| transport_error("lookup", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::decode(response).await?.into()))
    }
}
