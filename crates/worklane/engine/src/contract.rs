//! Contract state machine.

use crate::{EngineError, EngineResult};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use worklane_storage::{
    ContractStore, DirectoryStore, LedgerStore, MilestoneStore, NotificationStore, PaymentStore,
};
use worklane_types::{
    amounts_match, BidId, BidStatus, Contract, ContractEvent, ContractId, ContractStage,
    Milestone, MilestoneDraft, MilestoneId, MilestoneStatus, Notification, NotificationKind,
    PaymentStatus, Principal,
};

/// Input for contract creation.
#[derive(Clone, Debug)]
pub struct CreateContract {
    pub bid_id: BidId,
    pub title: String,
    pub terms: String,
    pub amount: f64,
    pub milestones: Vec<MilestoneDraft>,
}

/// Term edit for a contract still in Proposal.
#[derive(Clone, Debug, Default)]
pub struct TermsUpdate {
    pub title: Option<String>,
    pub terms: Option<String>,
}

/// Contract plus its milestones, the unit the API layer reads and returns.
#[derive(Clone, Debug)]
pub struct ContractAggregate {
    pub contract: Contract,
    pub milestones: Vec<Milestone>,
}

/// Owns contract stage transitions: Proposal -> Approval -> Payment ->
/// Review -> Completed, with Cancelled and Disputed reachable from any
/// non-terminal stage.
pub struct ContractEngine {
    store: Arc<dyn LedgerStore>,
}

impl ContractEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Create a contract from an accepted bid, inserting the contract and
    /// all milestones in one transaction.
    pub async fn create(
        &self,
        principal: &Principal,
        request: CreateContract,
    ) -> EngineResult<ContractAggregate> {
        let bid = self
            .store
            .get_bid(&request.bid_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("bid {} not found", request.bid_id)))?;
        let project = self.store.get_project(&bid.project_id).await?.ok_or_else(|| {
            EngineError::NotFound(format!("project {} not found", bid.project_id))
        })?;

        worklane_policy::authorize_contract_create(principal, &project)?;

        if bid.status != BidStatus::Accepted {
            return Err(EngineError::Validation(format!(
                "bid {} has not been accepted",
                bid.id
            )));
        }
        if request.milestones.is_empty() {
            return Err(EngineError::Validation(
                "a contract needs at least one milestone".to_string(),
            ));
        }
        if request.amount <= 0.0 {
            return Err(EngineError::Validation(
                "contract amount must be positive".to_string(),
            ));
        }
        for (index, draft) in request.milestones.iter().enumerate() {
            if draft.amount <= 0.0 {
                return Err(EngineError::Validation(format!(
                    "milestone {} amount must be positive",
                    index + 1
                )));
            }
        }
        let total: f64 = request.milestones.iter().map(|m| m.amount).sum();
        if !amounts_match(request.amount, total) {
            return Err(EngineError::Validation(format!(
                "milestone amounts sum to {total}, contract amount is {}",
                request.amount
            )));
        }
        if let Some(existing) = self.store.find_contract_by_bid(&bid.id).await? {
            return Err(EngineError::Conflict(format!(
                "bid {} already has contract {}",
                bid.id, existing.id
            )));
        }

        let now = Utc::now();
        let contract = Contract {
            id: ContractId::generate(),
            project_id: project.id.clone(),
            client_id: project.client_id.clone(),
            freelancer_id: bid.freelancer_id.clone(),
            bid_id: bid.id.clone(),
            title: request.title,
            terms: request.terms,
            amount: request.amount,
            stage: ContractStage::Proposal,
            terms_accepted: false,
            start_date: None,
            end_date: None,
            created_at: now,
            updated_at: now,
        };
        let milestones: Vec<Milestone> = request
            .milestones
            .into_iter()
            .map(|draft| Milestone {
                id: MilestoneId::generate(),
                contract_id: contract.id.clone(),
                project_id: project.id.clone(),
                title: draft.title,
                description: draft.description,
                amount: draft.amount,
                due_date: draft.due_date,
                status: MilestoneStatus::Pending,
                created_at: now,
                updated_at: now,
            })
            .collect();

        self.store
            .create_contract(contract.clone(), milestones.clone())
            .await?;

        info!(
            contract_id = %contract.id,
            bid_id = %contract.bid_id,
            milestones = milestones.len(),
            "contract created"
        );
        Ok(ContractAggregate {
            contract,
            milestones,
        })
    }

    /// Edit title/terms while the contract is still a proposal.
    pub async fn update_terms(
        &self,
        principal: &Principal,
        contract_id: &ContractId,
        update: TermsUpdate,
    ) -> EngineResult<Contract> {
        let contract = self.get_contract(contract_id).await?;
        if contract.stage != ContractStage::Proposal {
            return Err(EngineError::InvalidState(format!(
                "terms are frozen once stage leaves proposal (contract is {})",
                contract.stage
            )));
        }
        worklane_policy::authorize_contract(principal, &contract, ContractEvent::EditTerms)?;
        if update.title.is_none() && update.terms.is_none() {
            return Err(EngineError::Validation("nothing to update".to_string()));
        }

        let updated = self
            .store
            .set_contract_terms(
                contract_id,
                ContractStage::Proposal,
                update.title,
                update.terms,
                Utc::now(),
            )
            .await?;
        Ok(updated)
    }

    /// Advance the contract one stage along the defined sequence.
    ///
    /// Entering Completed requires every milestone to be Paid and stamps the
    /// end date. Cancellation routes through the compound cancellation write
    /// so open milestones and pending payments are closed with it; escrow
    /// that is already held must be refunded through the reconciler first.
    pub async fn advance_stage(
        &self,
        principal: &Principal,
        contract_id: &ContractId,
        target: ContractStage,
    ) -> EngineResult<Contract> {
        let contract = self.get_contract(contract_id).await?;
        if !contract.stage.can_advance_to(target) {
            return Err(EngineError::InvalidTransition(format!(
                "{} -> {} is not a defined edge",
                contract.stage, target
            )));
        }
        worklane_policy::authorize_contract(
            principal,
            &contract,
            ContractEvent::AdvanceStage(target),
        )?;

        match target {
            ContractStage::Completed => {
                let milestones = self.store.list_milestones(contract_id).await?;
                if let Some(unpaid) = milestones
                    .iter()
                    .find(|m| m.status != MilestoneStatus::Paid)
                {
                    return Err(EngineError::InvalidState(format!(
                        "milestone {} is {}, all milestones must be paid",
                        unpaid.id, unpaid.status
                    )));
                }
                let updated = self
                    .store
                    .transition_contract_stage(contract_id, contract.stage, target, Utc::now())
                    .await?;
                self.notify_both(&updated, NotificationKind::ContractCompleted, "contract completed")
                    .await?;
                info!(contract_id = %updated.id, "contract completed");
                Ok(updated)
            }
            ContractStage::Cancelled => self.cancel(&contract).await,
            _ => {
                let updated = self
                    .store
                    .transition_contract_stage(contract_id, contract.stage, target, Utc::now())
                    .await?;
                info!(contract_id = %updated.id, stage = %updated.stage, "contract stage advanced");
                Ok(updated)
            }
        }
    }

    /// Contract plus milestones, for the read side.
    pub async fn get(&self, contract_id: &ContractId) -> EngineResult<ContractAggregate> {
        let contract = self.get_contract(contract_id).await?;
        let milestones = self.store.list_milestones(contract_id).await?;
        Ok(ContractAggregate {
            contract,
            milestones,
        })
    }

    async fn get_contract(&self, contract_id: &ContractId) -> EngineResult<Contract> {
        self.store
            .get_contract(contract_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("contract {contract_id} not found")))
    }

    /// Local cancellation. Held escrow blocks it: refunds go through the
    /// reconciler, which re-enters the same cancellation write afterwards.
    async fn cancel(&self, contract: &Contract) -> EngineResult<Contract> {
        let payments = self.store.list_payments(&contract.id).await?;
        if payments
            .iter()
            .any(|p| p.status == PaymentStatus::Processing)
        {
            return Err(EngineError::InvalidState(
                "escrow is held for this contract; refund it before cancelling".to_string(),
            ));
        }
        let now = Utc::now();
        for payment in payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Pending)
        {
            self.store.mark_payment_failed(&payment.id, now).await?;
        }

        let notifications = both_parties(contract, NotificationKind::ContractCancelled, "contract cancelled");
        let updated = self
            .store
            .cancel_contract(&contract.id, contract.stage, now, notifications)
            .await?;
        info!(contract_id = %updated.id, "contract cancelled");
        Ok(updated)
    }

    async fn notify_both(
        &self,
        contract: &Contract,
        kind: NotificationKind,
        message: &str,
    ) -> EngineResult<()> {
        for notification in both_parties(contract, kind, message) {
            self.store.append_notification(notification).await?;
        }
        Ok(())
    }
}

pub(crate) fn both_parties(
    contract: &Contract,
    kind: NotificationKind,
    message: &str,
) -> Vec<Notification> {
    vec![
        Notification::new(contract.client_id.clone(), kind, message)
            .about_contract(contract.id.clone()),
        Notification::new(contract.freelancer_id.clone(), kind, message)
            .about_contract(contract.id.clone()),
    ]
}
