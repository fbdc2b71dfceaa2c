//! Worklane Escrow - payment gateway client
//!
//! Thin adapter over the external payment processor: create a hold, verify
//! it, transfer held funds to a payee, refund. No business logic lives here;
//! this crate never touches contract or milestone records. Confirmation of a
//! hold arrives out-of-band through the processor's event channel and is
//! handled by the engine's reconciler.

#![deny(unsafe_code)]

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use worklane_types::{HoldId, RefundId, TransferId};

/// Gateway call failures.
///
/// `Rejected` is a business decision by the processor and must not be
/// retried; `Unavailable` is a transport-level failure where the remote
/// outcome is unknown — the event channel, not this response, is the source
/// of truth for whether the call took effect.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Settlement state of a hold as reported by the processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldOutcome {
    Succeeded,
    Pending,
    Failed,
}

/// Request to reserve funds against a milestone payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateHold {
    pub amount: f64,
    pub currency: String,
    /// Stable key (the Payment id) so a caller-side retry cannot create a
    /// second hold.
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

/// Gateway acknowledgement of a created hold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoldReceipt {
    pub hold_id: HoldId,
    /// Client-side confirmation secret, passed through to the paying client.
    pub client_secret: String,
}

/// External payment processor capability.
#[async_trait]
pub trait EscrowGateway: Send + Sync {
    async fn create_hold(&self, request: CreateHold) -> Result<HoldReceipt, GatewayError>;

    async fn verify_hold(&self, hold_id: &HoldId) -> Result<HoldOutcome, GatewayError>;

    async fn transfer(
        &self,
        hold_id: &HoldId,
        payee_account: &str,
        amount: f64,
    ) -> Result<TransferId, GatewayError>;

    async fn refund(&self, hold_id: &HoldId) -> Result<RefundId, GatewayError>;
}

pub use http::{HttpEscrowGateway, HttpGatewayConfig};
pub use mock::MockEscrowGateway;
