//! Scriptable in-memory gateway double for engine and service tests.

use crate::{CreateHold, EscrowGateway, GatewayError, HoldOutcome, HoldReceipt};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use worklane_types::{HoldId, RefundId, TransferId};

/// Recorded gateway call, for assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayCall {
    CreateHold { idempotency_key: String },
    VerifyHold { hold_id: HoldId },
    Transfer { hold_id: HoldId, payee_account: String },
    Refund { hold_id: HoldId },
}

#[derive(Clone, Debug)]
struct MockHold {
    hold_id: HoldId,
    outcome: HoldOutcome,
    transferred: bool,
    refunded: bool,
}

#[derive(Default)]
struct MockState {
    holds_by_key: HashMap<String, MockHold>,
    holds: HashMap<HoldId, String>,
    calls: Vec<GatewayCall>,
    /// Number of upcoming calls that fail as transient.
    unavailable_for: u32,
    /// Next create_hold is rejected with this code.
    reject_next: Option<String>,
}

/// In-memory escrow gateway.
///
/// Holds start `Pending`; tests flip them with [`MockEscrowGateway::confirm_hold`]
/// to simulate the processor settling, then drive the engine's webhook path.
#[derive(Default)]
pub struct MockEscrowGateway {
    state: Mutex<MockState>,
    counter: AtomicU64,
}

impl MockEscrowGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().unavailable_for = n;
    }

    /// Make the next `create_hold` fail as a business rejection.
    pub fn reject_next_hold(&self, code: impl Into<String>) {
        self.state.lock().unwrap().reject_next = Some(code.into());
    }

    /// Mark a hold settled, as the processor would before emitting its event.
    pub fn confirm_hold(&self, hold_id: &HoldId) {
        let mut state = self.state.lock().unwrap();
        if let Some(key) = state.holds.get(hold_id).cloned() {
            if let Some(hold) = state.holds_by_key.get_mut(&key) {
                hold.outcome = HoldOutcome::Succeeded;
            }
        }
    }

    /// Mark a hold failed at the processor.
    pub fn fail_hold(&self, hold_id: &HoldId) {
        let mut state = self.state.lock().unwrap();
        if let Some(key) = state.holds.get(hold_id).cloned() {
            if let Some(hold) = state.holds_by_key.get_mut(&key) {
                hold.outcome = HoldOutcome::Failed;
            }
        }
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| matches!(call, GatewayCall::Transfer { .. }))
            .count()
    }

    fn take_outage(state: &mut MockState) -> Result<(), GatewayError> {
        if state.unavailable_for > 0 {
            state.unavailable_for -= 1;
            return Err(GatewayError::Unavailable("scripted outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EscrowGateway for MockEscrowGateway {
    async fn create_hold(&self, request: CreateHold) -> Result<HoldReceipt, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::CreateHold {
            idempotency_key: request.idempotency_key.clone(),
        });
        Self::take_outage(&mut state)?;
        if let Some(code) = state.reject_next.take() {
            return Err(GatewayError::Rejected {
                code,
                message: "scripted rejection".to_string(),
            });
        }

        // Idempotency: the same key always resolves to the same hold.
        if let Some(hold) = state.holds_by_key.get(&request.idempotency_key) {
            return Ok(HoldReceipt {
                hold_id: hold.hold_id.clone(),
                client_secret: format!("secret-{}", hold.hold_id),
            });
        }

        let hold_id = HoldId::new(format!(
            "hold-{}",
            self.counter.fetch_add(1, Ordering::SeqCst) + 1
        ));
        state.holds_by_key.insert(
            request.idempotency_key.clone(),
            MockHold {
                hold_id: hold_id.clone(),
                outcome: HoldOutcome::Pending,
                transferred: false,
                refunded: false,
            },
        );
        state.holds.insert(hold_id.clone(), request.idempotency_key);
        Ok(HoldReceipt {
            hold_id: hold_id.clone(),
            client_secret: format!("secret-{hold_id}"),
        })
    }

    async fn verify_hold(&self, hold_id: &HoldId) -> Result<HoldOutcome, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::VerifyHold {
            hold_id: hold_id.clone(),
        });
        Self::take_outage(&mut state)?;
        let key = state.holds.get(hold_id).ok_or_else(|| GatewayError::Rejected {
            code: "unknown_hold".to_string(),
            message: format!("no hold {hold_id}"),
        })?;
        Ok(state.holds_by_key[key].outcome)
    }

    async fn transfer(
        &self,
        hold_id: &HoldId,
        payee_account: &str,
        _amount: f64,
    ) -> Result<TransferId, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::Transfer {
            hold_id: hold_id.clone(),
            payee_account: payee_account.to_string(),
        });
        Self::take_outage(&mut state)?;
        let key = state
            .holds
            .get(hold_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: "unknown_hold".to_string(),
                message: format!("no hold {hold_id}"),
            })?;
        let hold = state.holds_by_key.get_mut(&key).ok_or_else(|| {
            GatewayError::Unavailable("mock state desynced".to_string())
        })?;
        if hold.refunded {
            return Err(GatewayError::Rejected {
                code: "already_refunded".to_string(),
                message: format!("hold {hold_id} was refunded"),
            });
        }
        hold.transferred = true;
        Ok(TransferId::new(format!("transfer-{hold_id}")))
    }

    async fn refund(&self, hold_id: &HoldId) -> Result<RefundId, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::Refund {
            hold_id: hold_id.clone(),
        });
        Self::take_outage(&mut state)?;
        let key = state
            .holds
            .get(hold_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                code: "unknown_hold".to_string(),
                message: format!("no hold {hold_id}"),
            })?;
        let hold = state.holds_by_key.get_mut(&key).ok_or_else(|| {
            GatewayError::Unavailable("mock state desynced".to_string())
        })?;
        if hold.transferred {
            return Err(GatewayError::Rejected {
                code: "already_transferred".to_string(),
                message: format!("hold {hold_id} was disbursed"),
            });
        }
        hold.refunded = true;
        Ok(RefundId::new(format!("refund-{hold_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn hold_request(key: &str) -> CreateHold {
        CreateHold {
            amount: 400.0,
            currency: "USD".to_string(),
            idempotency_key: key.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn idempotency_key_dedupes_holds() {
        let gateway = MockEscrowGateway::new();
        let first = gateway.create_hold(hold_request("pay-1")).await.unwrap();
        let second = gateway.create_hold(hold_request("pay-1")).await.unwrap();
        assert_eq!(first.hold_id, second.hold_id);

        let other = gateway.create_hold(hold_request("pay-2")).await.unwrap();
        assert_ne!(first.hold_id, other.hold_id);
    }

    #[tokio::test]
    async fn scripted_outage_consumes_calls() {
        let gateway = MockEscrowGateway::new();
        gateway.fail_next(1);
        let err = gateway.create_hold(hold_request("pay-1")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(gateway.create_hold(hold_request("pay-1")).await.is_ok());
    }

    #[tokio::test]
    async fn refund_after_transfer_is_rejected() {
        let gateway = MockEscrowGateway::new();
        let receipt = gateway.create_hold(hold_request("pay-1")).await.unwrap();
        gateway.confirm_hold(&receipt.hold_id);
        gateway
            .transfer(&receipt.hold_id, "freelancer-1", 400.0)
            .await
            .unwrap();
        let err = gateway.refund(&receipt.hold_id).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
