//! Escrow orchestration and reconciliation.
//!
//! One hold per milestone: each Payment maps to at most one gateway hold and
//! the Payment id is the idempotency key for creating it. The gateway's
//! event channel is the source of truth for whether a hold settled; the
//! synchronous responses only drive optimistic local updates.

use crate::contract::both_parties;
use crate::{EngineError, EngineResult};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use worklane_escrow::{CreateHold, EscrowGateway, HoldOutcome};
use worklane_storage::{
    ContractStore, LedgerStore, MilestoneStore, NotificationStore, PaymentStore, StorageError,
};
use worklane_types::{
    Contract, ContractId, ContractStage, HoldId, Milestone, MilestoneId, MilestoneStatus,
    Notification, NotificationKind, Payment, PaymentStatus, Principal,
};

/// Result of funding a milestone's escrow: the updated payment plus the
/// gateway's client-side confirmation secret.
#[derive(Clone, Debug)]
pub struct EscrowFunding {
    pub payment: Payment,
    pub client_secret: String,
}

/// Coordinates the payment processor with the ledger: funding, release,
/// refund, and the asynchronous hold-confirmation path.
pub struct EscrowReconciler {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn EscrowGateway>,
    currency: String,
}

impl EscrowReconciler {
    pub fn new(store: Arc<dyn LedgerStore>, gateway: Arc<dyn EscrowGateway>, currency: impl Into<String>) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into(),
        }
    }

    /// Client funds a requested milestone payment: create the hold, then
    /// record it. On a transient gateway failure nothing local changes; a
    /// retry reuses the same idempotency key and cannot double-hold.
    pub async fn fund_escrow(
        &self,
        principal: &Principal,
        contract_id: &ContractId,
        milestone_id: &MilestoneId,
    ) -> EngineResult<EscrowFunding> {
        let contract = self.get_contract(contract_id).await?;
        worklane_policy::authorize_funding(principal, &contract)?;
        self.require_active(&contract)?;
        let milestone = self.get_contract_milestone(&contract, milestone_id).await?;
        if milestone.status != MilestoneStatus::PaymentRequested {
            return Err(EngineError::InvalidState(format!(
                "milestone {milestone_id} is {}, payment has not been requested",
                milestone.status
            )));
        }
        let payment = self.get_milestone_payment(milestone_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "payment {} is {}, expected pending",
                payment.id, payment.status
            )));
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("contract_id".to_string(), contract.id.0.clone());
        metadata.insert("milestone_id".to_string(), milestone.id.0.clone());
        metadata.insert("payment_id".to_string(), payment.id.0.clone());
        let receipt = self
            .gateway
            .create_hold(CreateHold {
                amount: payment.amount,
                currency: self.currency.clone(),
                idempotency_key: payment.id.0.clone(),
                metadata,
            })
            .await?;

        let updated = self
            .store
            .mark_payment_processing(&payment.id, receipt.hold_id.clone(), Utc::now())
            .await?;
        info!(
            payment_id = %updated.id,
            hold_id = %receipt.hold_id,
            amount = updated.amount,
            "escrow hold created"
        );
        Ok(EscrowFunding {
            payment: updated,
            client_secret: receipt.client_secret,
        })
    }

    /// Client releases a funded milestone synchronously: verify the hold,
    /// transfer to the freelancer, settle. Does not wait for the webhook.
    pub async fn release_escrow(
        &self,
        principal: &Principal,
        contract_id: &ContractId,
        milestone_id: &MilestoneId,
    ) -> EngineResult<()> {
        let contract = self.get_contract(contract_id).await?;
        worklane_policy::authorize_release(principal, &contract)?;
        self.require_active(&contract)?;
        let milestone = self.get_contract_milestone(&contract, milestone_id).await?;
        if milestone.status != MilestoneStatus::PaymentRequested {
            return Err(EngineError::InvalidState(format!(
                "milestone {milestone_id} is {}, nothing to release",
                milestone.status
            )));
        }
        let payment = self.get_milestone_payment(milestone_id).await?;
        if payment.status != PaymentStatus::Processing {
            return Err(EngineError::InvalidState(format!(
                "payment {} is {}, escrow has not been funded",
                payment.id, payment.status
            )));
        }
        let hold_id = payment.payment_intent_id.clone().ok_or_else(|| {
            EngineError::Conflict(format!("payment {} has no hold recorded", payment.id))
        })?;

        match self.gateway.verify_hold(&hold_id).await? {
            HoldOutcome::Succeeded => {}
            HoldOutcome::Pending => {
                return Err(EngineError::InvalidState(format!(
                    "hold {hold_id} has not settled yet"
                )))
            }
            HoldOutcome::Failed => {
                return Err(EngineError::Validation(format!(
                    "hold {hold_id} failed at the gateway"
                )))
            }
        }

        let transfer_id = self
            .gateway
            .transfer(&hold_id, &payment.freelancer_id.0, payment.amount)
            .await?;
        match self.settle(&payment, &milestone).await {
            Ok(()) => {}
            // The gateway event settled it between our read and this write.
            Err(EngineError::Conflict(msg)) => {
                debug!(payment_id = %payment.id, %msg, "settle raced the gateway event");
            }
            Err(err) => return Err(err),
        }
        info!(
            payment_id = %payment.id,
            transfer_id = %transfer_id,
            "escrow released to freelancer"
        );
        self.try_complete_contract(&contract.id).await
    }

    /// Refund all held escrow on a contract and cancel it. Retry-safe:
    /// already-refunded payments are skipped, disbursed milestones stay
    /// Paid.
    pub async fn refund_escrow(
        &self,
        principal: &Principal,
        contract_id: &ContractId,
    ) -> EngineResult<()> {
        let contract = self.get_contract(contract_id).await?;
        worklane_policy::authorize_refund(principal, &contract)?;
        if contract.stage == ContractStage::Completed {
            return Err(EngineError::InvalidState(
                "contract is completed, funds are already disbursed".to_string(),
            ));
        }
        if contract.stage == ContractStage::Cancelled {
            return Err(EngineError::InvalidState(
                "contract is already cancelled".to_string(),
            ));
        }

        let now = Utc::now();
        for payment in self.store.list_payments(contract_id).await? {
            match payment.status {
                PaymentStatus::Processing => {
                    let hold_id = payment.payment_intent_id.clone().ok_or_else(|| {
                        EngineError::Conflict(format!(
                            "payment {} has no hold recorded",
                            payment.id
                        ))
                    })?;
                    let refund_id = self.gateway.refund(&hold_id).await?;
                    self.store.mark_payment_refunded(&payment.id, now).await?;
                    info!(payment_id = %payment.id, refund_id = %refund_id, "escrow hold refunded");
                }
                PaymentStatus::Pending => {
                    self.store.mark_payment_failed(&payment.id, now).await?;
                }
                // Completed stays completed: the milestone was delivered and
                // paid. Failed/Refunded need nothing.
                _ => {}
            }
        }

        let notifications = both_parties(&contract, NotificationKind::ContractCancelled, "contract cancelled");
        self.store
            .cancel_contract(contract_id, contract.stage, now, notifications)
            .await?;
        info!(contract_id = %contract_id, "contract cancelled with escrow refunded");
        Ok(())
    }

    /// Webhook entry point: the processor confirmed a hold.
    ///
    /// Delivery is at-least-once and unordered; this path is idempotent. A
    /// replayed event finds the payment already Completed and no-ops; a
    /// concurrent duplicate loses the optimistic settle write and no-ops.
    pub async fn on_hold_succeeded(&self, hold_id: &HoldId) -> EngineResult<()> {
        let Some(payment) = self.store.find_payment_by_intent(hold_id).await? else {
            error!(%hold_id, "orphan escrow event: no payment matches this hold");
            return Err(EngineError::OrphanEvent(hold_id.0.clone()));
        };

        match payment.status {
            PaymentStatus::Completed => {
                debug!(payment_id = %payment.id, "hold confirmation replayed, already settled");
                return Ok(());
            }
            PaymentStatus::Refunded | PaymentStatus::Failed => {
                warn!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    "hold confirmation for a closed payment, ignoring"
                );
                return Ok(());
            }
            PaymentStatus::Pending => {
                // The hold id is recorded when the payment enters
                // Processing, so a Pending match means a lost write.
                warn!(payment_id = %payment.id, "hold confirmation for an unfunded payment, ignoring");
                return Ok(());
            }
            PaymentStatus::Processing => {}
        }

        let milestone = self
            .store
            .get_milestone(&payment.milestone_id)
            .await?
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "payment {} references missing milestone {}",
                    payment.id, payment.milestone_id
                ))
            })?;
        match self.settle(&payment, &milestone).await {
            Ok(()) => {}
            // Lost the race against a duplicate delivery or a concurrent
            // release; the winner already settled.
            Err(EngineError::Conflict(msg)) => {
                debug!(payment_id = %payment.id, %msg, "settle raced, treating as replay");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        info!(payment_id = %payment.id, %hold_id, "escrow hold settled from gateway event");

        self.try_complete_contract(&payment.contract_id).await
    }

    async fn settle(&self, payment: &Payment, milestone: &Milestone) -> EngineResult<()> {
        let notification = Notification::new(
            payment.freelancer_id.clone(),
            NotificationKind::MilestonePaid,
            format!("milestone \"{}\" paid ({})", milestone.title, payment.amount),
        )
        .about_contract(payment.contract_id.clone())
        .about_milestone(payment.milestone_id.clone());
        self.store
            .settle_payment(&payment.id, Utc::now(), notification)
            .await?;
        Ok(())
    }

    /// Aggregate completion: once every milestone is Paid, a contract
    /// already under Review completes. Earlier stages are left alone so the
    /// stage sequence stays observable; the client completes via the
    /// contract engine.
    async fn try_complete_contract(&self, contract_id: &ContractId) -> EngineResult<()> {
        let Some(contract) = self.store.get_contract(contract_id).await? else {
            return Ok(());
        };
        if contract.stage.is_terminal() {
            return Ok(());
        }
        let milestones = self.store.list_milestones(contract_id).await?;
        let all_paid = !milestones.is_empty()
            && milestones.iter().all(|m| m.status == MilestoneStatus::Paid);
        if !all_paid {
            return Ok(());
        }
        if contract.stage != ContractStage::Review {
            info!(
                contract_id = %contract.id,
                stage = %contract.stage,
                "all milestones paid, awaiting review before completion"
            );
            return Ok(());
        }

        match self
            .store
            .transition_contract_stage(contract_id, ContractStage::Review, ContractStage::Completed, Utc::now())
            .await
        {
            Ok(updated) => {
                for notification in
                    both_parties(&updated, NotificationKind::ContractCompleted, "contract completed")
                {
                    self.store.append_notification(notification).await?;
                }
                info!(contract_id = %updated.id, "contract completed, all milestones paid");
                Ok(())
            }
            // A concurrent event or caller completed it first.
            Err(StorageError::Conflict(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn require_active(&self, contract: &Contract) -> EngineResult<()> {
        if matches!(contract.stage, ContractStage::Payment | ContractStage::Review) {
            Ok(())
        } else {
            Err(EngineError::InvalidState(format!(
                "contract {} is {}, escrow operations need an active contract",
                contract.id, contract.stage
            )))
        }
    }

    async fn get_contract(&self, contract_id: &ContractId) -> EngineResult<Contract> {
        self.store
            .get_contract(contract_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("contract {contract_id} not found")))
    }

    async fn get_contract_milestone(
        &self,
        contract: &Contract,
        milestone_id: &MilestoneId,
    ) -> EngineResult<Milestone> {
        let milestone = self
            .store
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id} not found")))?;
        if milestone.contract_id != contract.id {
            return Err(EngineError::Validation(format!(
                "milestone {milestone_id} does not belong to contract {}",
                contract.id
            )));
        }
        Ok(milestone)
    }

    async fn get_milestone_payment(&self, milestone_id: &MilestoneId) -> EngineResult<Payment> {
        self.store
            .find_payment_by_milestone(milestone_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("no payment exists for milestone {milestone_id}"))
            })
    }
}
