//! Milestone state machine.

use crate::{EngineError, EngineResult};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use worklane_storage::{ContractStore, LedgerStore, MilestoneStore, PaymentStore};
use worklane_types::{
    Contract, ContractStage, Milestone, MilestoneEdit, MilestoneEvent, MilestoneId,
    MilestoneStatus, Notification, NotificationKind, Payment, PaymentId, PaymentStatus, Principal,
    ProgressUpdate, ProgressUpdateId,
};

/// Owns milestone status transitions: Pending -> InProgress -> Completed ->
/// PaymentRequested -> Paid, with Cancelled reachable from any non-terminal
/// status. Paid is written by the escrow reconciler only.
pub struct MilestoneEngine {
    store: Arc<dyn LedgerStore>,
}

impl MilestoneEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Append a progress update, optionally moving the milestone along one
    /// status edge.
    ///
    /// Requesting payment atomically creates the Payment (Pending) and
    /// notifies the client; this is the sole creation point of a Payment,
    /// and the status precondition is the guard against duplicates.
    pub async fn record_progress(
        &self,
        principal: &Principal,
        milestone_id: &MilestoneId,
        description: String,
        target: Option<MilestoneStatus>,
    ) -> EngineResult<Milestone> {
        let milestone = self.get_milestone(milestone_id).await?;
        let contract = self.get_contract(&milestone).await?;

        let Some(target) = target else {
            // Narration only.
            worklane_policy::authorize_milestone(
                principal,
                &contract,
                &milestone,
                MilestoneEvent::RecordProgress,
            )?;
            self.store
                .append_progress_update(progress(principal, &milestone, description))
                .await?;
            return Ok(milestone);
        };

        if target == milestone.status {
            return Err(EngineError::InvalidTransition(format!(
                "milestone {milestone_id} is already {target}"
            )));
        }
        if !milestone.status.can_move_to(target) {
            return Err(EngineError::InvalidTransition(format!(
                "{} -> {} is not a defined edge",
                milestone.status, target
            )));
        }
        // Work only happens on an active contract; cancellation is allowed
        // from any non-terminal stage.
        if target != MilestoneStatus::Cancelled && !stage_is_active(contract.stage) {
            return Err(EngineError::InvalidState(format!(
                "contract {} is {}, milestones cannot progress",
                contract.id, contract.stage
            )));
        }
        worklane_policy::authorize_milestone(
            principal,
            &contract,
            &milestone,
            MilestoneEvent::SetStatus(target),
        )?;

        let now = Utc::now();
        let updated = match target {
            MilestoneStatus::PaymentRequested => {
                let payment = Payment {
                    id: PaymentId::generate(),
                    contract_id: contract.id.clone(),
                    milestone_id: milestone.id.clone(),
                    client_id: contract.client_id.clone(),
                    freelancer_id: contract.freelancer_id.clone(),
                    amount: milestone.amount,
                    status: PaymentStatus::Pending,
                    payment_intent_id: None,
                    completed_at: None,
                    created_at: now,
                    updated_at: now,
                };
                let notification = Notification::new(
                    contract.client_id.clone(),
                    NotificationKind::PaymentRequested,
                    format!("payment of {} requested for \"{}\"", milestone.amount, milestone.title),
                )
                .about_contract(contract.id.clone())
                .about_milestone(milestone.id.clone());

                let (updated, payment) = self
                    .store
                    .request_payment(
                        milestone_id,
                        payment,
                        progress_with_status(
                            principal,
                            &milestone,
                            description,
                            MilestoneStatus::PaymentRequested,
                        ),
                        notification,
                        now,
                    )
                    .await?;
                info!(
                    milestone_id = %updated.id,
                    payment_id = %payment.id,
                    amount = payment.amount,
                    "payment requested"
                );
                updated
            }
            _ => {
                let notification = (target == MilestoneStatus::Completed).then(|| {
                    Notification::new(
                        contract.client_id.clone(),
                        NotificationKind::MilestoneCompleted,
                        format!("milestone \"{}\" completed", milestone.title),
                    )
                    .about_contract(contract.id.clone())
                    .about_milestone(milestone.id.clone())
                });
                let updated = self
                    .store
                    .transition_milestone_status(
                        milestone_id,
                        milestone.status,
                        target,
                        now,
                        progress_with_status(principal, &milestone, description, target),
                        notification,
                    )
                    .await?;
                info!(milestone_id = %updated.id, status = %updated.status, "milestone status changed");
                updated
            }
        };
        Ok(updated)
    }

    /// Client edit of a Pending milestone's details. Amount edits require
    /// the contract to still be in Proposal and rebalance the contract
    /// total atomically.
    pub async fn update_details(
        &self,
        principal: &Principal,
        milestone_id: &MilestoneId,
        edit: MilestoneEdit,
    ) -> EngineResult<Milestone> {
        let milestone = self.get_milestone(milestone_id).await?;
        let contract = self.get_contract(&milestone).await?;

        if milestone.status != MilestoneStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "details are frozen once status leaves pending (milestone is {})",
                milestone.status
            )));
        }
        if edit.is_empty() {
            return Err(EngineError::Validation("nothing to update".to_string()));
        }
        if let Some(amount) = edit.amount {
            if amount <= 0.0 {
                return Err(EngineError::Validation(
                    "milestone amount must be positive".to_string(),
                ));
            }
            if contract.stage != ContractStage::Proposal {
                return Err(EngineError::InvalidState(format!(
                    "amounts are frozen once the contract leaves proposal (contract is {})",
                    contract.stage
                )));
            }
        }
        worklane_policy::authorize_milestone(
            principal,
            &contract,
            &milestone,
            MilestoneEvent::EditDetails,
        )?;

        let updated = self
            .store
            .update_milestone_details(milestone_id, MilestoneStatus::Pending, edit, Utc::now())
            .await?;
        Ok(updated)
    }

    /// Progress trail for a milestone, oldest first.
    pub async fn progress_updates(
        &self,
        milestone_id: &MilestoneId,
    ) -> EngineResult<Vec<ProgressUpdate>> {
        Ok(self.store.list_progress_updates(milestone_id).await?)
    }

    async fn get_milestone(&self, milestone_id: &MilestoneId) -> EngineResult<Milestone> {
        self.store
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id} not found")))
    }

    async fn get_contract(&self, milestone: &Milestone) -> EngineResult<Contract> {
        self.store
            .get_contract(&milestone.contract_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("contract {} not found", milestone.contract_id))
            })
    }
}

fn stage_is_active(stage: ContractStage) -> bool {
    matches!(stage, ContractStage::Payment | ContractStage::Review)
}

fn progress(principal: &Principal, milestone: &Milestone, description: String) -> ProgressUpdate {
    progress_with_status(principal, milestone, description, milestone.status)
}

fn progress_with_status(
    principal: &Principal,
    milestone: &Milestone,
    description: String,
    status: MilestoneStatus,
) -> ProgressUpdate {
    ProgressUpdate {
        id: ProgressUpdateId::generate(),
        milestone_id: milestone.id.clone(),
        author_id: principal.id.clone(),
        description,
        status,
        created_at: Utc::now(),
    }
}
