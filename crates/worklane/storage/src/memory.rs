//! In-memory reference implementation of the ledger traits.
//!
//! Deterministic and test-friendly. A single lock guards the whole ledger
//! state so every compound operation is atomic and linearized, matching the
//! transaction boundary the PostgreSQL adapter gets from the database.

use crate::traits::{
    ContractStore, DirectoryStore, MilestoneStore, NotificationStore, PaymentStore, QueryWindow,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use worklane_types::{
    Bid, BidId, Contract, ContractId, ContractStage, HoldId, Milestone, MilestoneEdit,
    MilestoneId, MilestoneStatus, Notification, Payment, PaymentId, PaymentStatus, ProgressUpdate,
    Project, ProjectId, ProjectStatus, UserId,
};

#[derive(Default)]
struct LedgerState {
    projects: HashMap<ProjectId, Project>,
    bids: HashMap<BidId, Bid>,
    contracts: HashMap<ContractId, Contract>,
    milestones: HashMap<MilestoneId, Milestone>,
    progress: Vec<ProgressUpdate>,
    payments: HashMap<PaymentId, Payment>,
    payment_order: Vec<PaymentId>,
    notifications: Vec<Notification>,
}

/// In-memory ledger adapter.
#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err() -> StorageError {
    StorageError::Backend("ledger lock poisoned".to_string())
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

#[async_trait]
impl DirectoryStore for InMemoryLedger {
    async fn insert_project(&self, project: Project) -> StorageResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        if state.projects.contains_key(&project.id) {
            return Err(StorageError::Conflict(format!(
                "project {} already exists",
                project.id
            )));
        }
        state.projects.insert(project.id.clone(), project);
        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> StorageResult<Option<Project>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state.projects.get(id).cloned())
    }

    async fn insert_bid(&self, bid: Bid) -> StorageResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        if state.bids.contains_key(&bid.id) {
            return Err(StorageError::Conflict(format!("bid {} already exists", bid.id)));
        }
        let duplicate = state.bids.values().any(|existing| {
            existing.project_id == bid.project_id && existing.freelancer_id == bid.freelancer_id
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "freelancer {} already bid on project {}",
                bid.freelancer_id, bid.project_id
            )));
        }
        state.bids.insert(bid.id.clone(), bid);
        Ok(())
    }

    async fn get_bid(&self, id: &BidId) -> StorageResult<Option<Bid>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state.bids.get(id).cloned())
    }
}

#[async_trait]
impl ContractStore for InMemoryLedger {
    async fn create_contract(
        &self,
        contract: Contract,
        milestones: Vec<Milestone>,
    ) -> StorageResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err())?;

        if state.contracts.contains_key(&contract.id) {
            return Err(StorageError::Conflict(format!(
                "contract {} already exists",
                contract.id
            )));
        }
        if state
            .contracts
            .values()
            .any(|existing| existing.bid_id == contract.bid_id)
        {
            return Err(StorageError::Conflict(format!(
                "bid {} already has a contract",
                contract.bid_id
            )));
        }
        for milestone in &milestones {
            if milestone.contract_id != contract.id {
                return Err(StorageError::InvalidInput(format!(
                    "milestone {} does not belong to contract {}",
                    milestone.id, contract.id
                )));
            }
        }
        let project = state
            .projects
            .get_mut(&contract.project_id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("project {} not found", contract.project_id))
            })?;
        project.status = ProjectStatus::InProgress;

        for milestone in milestones {
            state.milestones.insert(milestone.id.clone(), milestone);
        }
        state.contracts.insert(contract.id.clone(), contract);
        Ok(())
    }

    async fn get_contract(&self, id: &ContractId) -> StorageResult<Option<Contract>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state.contracts.get(id).cloned())
    }

    async fn find_contract_by_bid(&self, bid_id: &BidId) -> StorageResult<Option<Contract>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state
            .contracts
            .values()
            .find(|contract| &contract.bid_id == bid_id)
            .cloned())
    }

    async fn list_contracts(&self, window: QueryWindow) -> StorageResult<Vec<Contract>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        let mut values = state.contracts.values().cloned().collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apply_window(values, window))
    }

    async fn set_contract_terms(
        &self,
        id: &ContractId,
        expected_stage: ContractStage,
        title: Option<String>,
        terms: Option<String>,
        at: DateTime<Utc>,
    ) -> StorageResult<Contract> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let contract = state
            .contracts
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("contract {id} not found")))?;
        if contract.stage != expected_stage {
            return Err(StorageError::Conflict(format!(
                "contract {id} moved to {} since it was read",
                contract.stage
            )));
        }
        if let Some(title) = title {
            contract.title = title;
        }
        if let Some(terms) = terms {
            contract.terms = terms;
        }
        contract.updated_at = at;
        Ok(contract.clone())
    }

    async fn transition_contract_stage(
        &self,
        id: &ContractId,
        expected_from: ContractStage,
        to: ContractStage,
        at: DateTime<Utc>,
    ) -> StorageResult<Contract> {
        if to == ContractStage::Cancelled {
            return Err(StorageError::InvalidInput(
                "cancellation must go through cancel_contract".to_string(),
            ));
        }
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let contract = state
            .contracts
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("contract {id} not found")))?;
        if contract.stage != expected_from {
            return Err(StorageError::Conflict(format!(
                "contract {id} is {}, expected {expected_from}",
                contract.stage
            )));
        }
        contract.stage = to;
        contract.updated_at = at;
        match to {
            ContractStage::Approval => contract.terms_accepted = true,
            ContractStage::Completed => contract.end_date = Some(at),
            _ => {}
        }
        let contract = contract.clone();
        if to == ContractStage::Completed {
            if let Some(project) = state.projects.get_mut(&contract.project_id) {
                project.status = ProjectStatus::Completed;
            }
        }
        Ok(contract)
    }

    async fn cancel_contract(
        &self,
        id: &ContractId,
        expected_from: ContractStage,
        at: DateTime<Utc>,
        notifications: Vec<Notification>,
    ) -> StorageResult<Contract> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let contract = state
            .contracts
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("contract {id} not found")))?;
        if contract.stage != expected_from {
            return Err(StorageError::Conflict(format!(
                "contract {id} is {}, expected {expected_from}",
                contract.stage
            )));
        }
        contract.stage = ContractStage::Cancelled;
        contract.updated_at = at;
        let contract = contract.clone();

        for milestone in state
            .milestones
            .values_mut()
            .filter(|m| m.contract_id == *id && !m.status.is_terminal())
        {
            milestone.status = MilestoneStatus::Cancelled;
            milestone.updated_at = at;
        }
        if let Some(project) = state.projects.get_mut(&contract.project_id) {
            project.status = ProjectStatus::Open;
        }
        state.notifications.extend(notifications);
        Ok(contract)
    }
}

#[async_trait]
impl MilestoneStore for InMemoryLedger {
    async fn get_milestone(&self, id: &MilestoneId) -> StorageResult<Option<Milestone>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state.milestones.get(id).cloned())
    }

    async fn list_milestones(&self, contract_id: &ContractId) -> StorageResult<Vec<Milestone>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        let mut values = state
            .milestones
            .values()
            .filter(|m| m.contract_id == *contract_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));
        Ok(values)
    }

    async fn update_milestone_details(
        &self,
        id: &MilestoneId,
        expected_status: MilestoneStatus,
        edit: MilestoneEdit,
        at: DateTime<Utc>,
    ) -> StorageResult<Milestone> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let milestone = state
            .milestones
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("milestone {id} not found")))?;
        if milestone.status != expected_status {
            return Err(StorageError::Conflict(format!(
                "milestone {id} is {}, expected {expected_status}",
                milestone.status
            )));
        }
        if matches!(edit.amount, Some(amount) if amount <= 0.0) {
            return Err(StorageError::InvalidInput(
                "milestone amount must be positive".to_string(),
            ));
        }
        if let Some(title) = edit.title {
            milestone.title = title;
        }
        if let Some(description) = edit.description {
            milestone.description = description;
        }
        if let Some(due_date) = edit.due_date {
            milestone.due_date = Some(due_date);
        }
        let mut amount_delta = 0.0;
        if let Some(amount) = edit.amount {
            amount_delta = amount - milestone.amount;
            milestone.amount = amount;
        }
        milestone.updated_at = at;
        let milestone = milestone.clone();

        // Keep the contract total equal to the milestone sum.
        if amount_delta != 0.0 {
            let contract = state
                .contracts
                .get_mut(&milestone.contract_id)
                .ok_or_else(|| {
                    StorageError::InvariantViolation(format!(
                        "milestone {id} references missing contract {}",
                        milestone.contract_id
                    ))
                })?;
            contract.amount += amount_delta;
            contract.updated_at = at;
        }
        Ok(milestone)
    }

    async fn transition_milestone_status(
        &self,
        id: &MilestoneId,
        expected_from: MilestoneStatus,
        to: MilestoneStatus,
        at: DateTime<Utc>,
        progress: ProgressUpdate,
        notification: Option<Notification>,
    ) -> StorageResult<Milestone> {
        if matches!(
            to,
            MilestoneStatus::PaymentRequested | MilestoneStatus::Paid
        ) {
            return Err(StorageError::InvalidInput(format!(
                "{to} must go through the payment store"
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let milestone = state
            .milestones
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("milestone {id} not found")))?;
        if milestone.status != expected_from {
            return Err(StorageError::Conflict(format!(
                "milestone {id} is {}, expected {expected_from}",
                milestone.status
            )));
        }
        milestone.status = to;
        milestone.updated_at = at;
        let milestone = milestone.clone();

        if to == MilestoneStatus::InProgress {
            if let Some(contract) = state.contracts.get_mut(&milestone.contract_id) {
                if contract.start_date.is_none() {
                    contract.start_date = Some(at);
                    contract.updated_at = at;
                }
            }
        }
        state.progress.push(progress);
        if let Some(notification) = notification {
            state.notifications.push(notification);
        }
        Ok(milestone)
    }

    async fn append_progress_update(&self, update: ProgressUpdate) -> StorageResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        state.progress.push(update);
        Ok(())
    }

    async fn list_progress_updates(
        &self,
        milestone_id: &MilestoneId,
    ) -> StorageResult<Vec<ProgressUpdate>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state
            .progress
            .iter()
            .filter(|update| update.milestone_id == *milestone_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PaymentStore for InMemoryLedger {
    async fn request_payment(
        &self,
        milestone_id: &MilestoneId,
        payment: Payment,
        progress: ProgressUpdate,
        notification: Notification,
        at: DateTime<Utc>,
    ) -> StorageResult<(Milestone, Payment)> {
        if payment.status != PaymentStatus::Pending {
            return Err(StorageError::InvalidInput(
                "a new payment must be pending".to_string(),
            ));
        }
        if payment.milestone_id != *milestone_id {
            return Err(StorageError::InvalidInput(format!(
                "payment {} does not reference milestone {milestone_id}",
                payment.id
            )));
        }
        let mut state = self.state.write().map_err(|_| lock_err())?;
        if state.payments.contains_key(&payment.id) {
            return Err(StorageError::Conflict(format!(
                "payment {} already exists",
                payment.id
            )));
        }
        let milestone = state
            .milestones
            .get_mut(milestone_id)
            .ok_or_else(|| StorageError::NotFound(format!("milestone {milestone_id} not found")))?;
        if milestone.status != MilestoneStatus::Completed {
            return Err(StorageError::Conflict(format!(
                "milestone {milestone_id} is {}, expected completed",
                milestone.status
            )));
        }
        milestone.status = MilestoneStatus::PaymentRequested;
        milestone.updated_at = at;
        let milestone = milestone.clone();

        state.payment_order.push(payment.id.clone());
        state.payments.insert(payment.id.clone(), payment.clone());
        state.progress.push(progress);
        state.notifications.push(notification);
        Ok((milestone, payment))
    }

    async fn get_payment(&self, id: &PaymentId) -> StorageResult<Option<Payment>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state.payments.get(id).cloned())
    }

    async fn find_payment_by_milestone(
        &self,
        milestone_id: &MilestoneId,
    ) -> StorageResult<Option<Payment>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state
            .payment_order
            .iter()
            .rev()
            .filter_map(|id| state.payments.get(id))
            .find(|payment| payment.milestone_id == *milestone_id)
            .cloned())
    }

    async fn find_payment_by_intent(&self, hold_id: &HoldId) -> StorageResult<Option<Payment>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        Ok(state
            .payments
            .values()
            .find(|payment| payment.payment_intent_id.as_ref() == Some(hold_id))
            .cloned())
    }

    async fn list_payments(&self, contract_id: &ContractId) -> StorageResult<Vec<Payment>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        let mut values = state
            .payments
            .values()
            .filter(|payment| payment.contract_id == *contract_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(values)
    }

    async fn mark_payment_processing(
        &self,
        id: &PaymentId,
        hold_id: HoldId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let payment = state
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id} not found")))?;
        if payment.status != PaymentStatus::Pending {
            return Err(StorageError::Conflict(format!(
                "payment {id} is {}, expected pending",
                payment.status
            )));
        }
        payment.status = PaymentStatus::Processing;
        payment.payment_intent_id = Some(hold_id);
        payment.updated_at = at;
        Ok(payment.clone())
    }

    async fn settle_payment(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
        notification: Notification,
    ) -> StorageResult<Payment> {
        let mut state = self.state.write().map_err(|_| lock_err())?;

        // Validate both records before touching either; this method is one
        // transaction and must not partially apply.
        let payment = state
            .payments
            .get(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id} not found")))?;
        if payment.status != PaymentStatus::Processing {
            return Err(StorageError::Conflict(format!(
                "payment {id} is {}, expected processing",
                payment.status
            )));
        }
        let milestone_id = payment.milestone_id.clone();
        let milestone_status = state
            .milestones
            .get(&milestone_id)
            .ok_or_else(|| {
                StorageError::InvariantViolation(format!(
                    "payment {id} references missing milestone {milestone_id}"
                ))
            })?
            .status;
        if milestone_status != MilestoneStatus::PaymentRequested {
            return Err(StorageError::InvariantViolation(format!(
                "milestone {milestone_id} is {milestone_status}, expected payment_requested"
            )));
        }

        if let Some(payment) = state.payments.get_mut(id) {
            payment.status = PaymentStatus::Completed;
            payment.completed_at = Some(at);
            payment.updated_at = at;
        }
        let payment = state
            .payments
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("payment {id} not found")))?;

        if let Some(milestone) = state.milestones.get_mut(&milestone_id) {
            milestone.status = MilestoneStatus::Paid;
            milestone.updated_at = at;
        }
        state.notifications.push(notification);
        Ok(payment)
    }

    async fn mark_payment_refunded(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let payment = state
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id} not found")))?;
        if !matches!(
            payment.status,
            PaymentStatus::Processing | PaymentStatus::Completed
        ) {
            return Err(StorageError::Conflict(format!(
                "payment {id} is {}, cannot refund",
                payment.status
            )));
        }
        payment.status = PaymentStatus::Refunded;
        payment.updated_at = at;
        Ok(payment.clone())
    }

    async fn mark_payment_failed(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        let payment = state
            .payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment {id} not found")))?;
        if payment.status != PaymentStatus::Pending {
            return Err(StorageError::Conflict(format!(
                "payment {id} is {}, expected pending",
                payment.status
            )));
        }
        payment.status = PaymentStatus::Failed;
        payment.updated_at = at;
        Ok(payment.clone())
    }
}

#[async_trait]
impl NotificationStore for InMemoryLedger {
    async fn append_notification(&self, notification: Notification) -> StorageResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err())?;
        state.notifications.push(notification);
        Ok(())
    }

    async fn list_notifications(
        &self,
        recipient: &UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Notification>> {
        let state = self.state.read().map_err(|_| lock_err())?;
        let mut values = state
            .notifications
            .iter()
            .filter(|n| n.recipient_id == *recipient)
            .cloned()
            .collect::<Vec<_>>();
        values.reverse();
        Ok(apply_window(values, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worklane_types::{NotificationKind, ProgressUpdateId};

    fn project() -> Project {
        Project {
            id: ProjectId::new("p-1"),
            client_id: UserId::new("client-1"),
            title: "Site".to_string(),
            description: String::new(),
            budget: 1000.0,
            deadline: None,
            skills: vec![],
            category: "web".to_string(),
            status: ProjectStatus::Open,
            created_at: Utc::now(),
        }
    }

    fn contract(id: &str, bid: &str) -> Contract {
        Contract {
            id: ContractId::new(id),
            project_id: ProjectId::new("p-1"),
            client_id: UserId::new("client-1"),
            freelancer_id: UserId::new("freelancer-1"),
            bid_id: BidId::new(bid),
            title: "Site build".to_string(),
            terms: "two milestones".to_string(),
            amount: 1000.0,
            stage: ContractStage::Proposal,
            terms_accepted: false,
            start_date: None,
            end_date: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn milestone(id: &str, contract_id: &str, amount: f64) -> Milestone {
        Milestone {
            id: MilestoneId::new(id),
            contract_id: ContractId::new(contract_id),
            project_id: ProjectId::new("p-1"),
            title: "Design".to_string(),
            description: String::new(),
            amount,
            due_date: None,
            status: MilestoneStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn progress(milestone_id: &str, status: MilestoneStatus) -> ProgressUpdate {
        ProgressUpdate {
            id: ProgressUpdateId::generate(),
            milestone_id: MilestoneId::new(milestone_id),
            author_id: UserId::new("freelancer-1"),
            description: "update".to_string(),
            status,
            created_at: Utc::now(),
        }
    }

    fn payment(id: &str, milestone_id: &str) -> Payment {
        Payment {
            id: PaymentId::new(id),
            contract_id: ContractId::new("c-1"),
            milestone_id: MilestoneId::new(milestone_id),
            client_id: UserId::new("client-1"),
            freelancer_id: UserId::new("freelancer-1"),
            amount: 400.0,
            status: PaymentStatus::Pending,
            payment_intent_id: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn note(kind: NotificationKind) -> Notification {
        Notification::new(UserId::new("client-1"), kind, "note")
    }

    async fn seeded() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger.insert_project(project()).await.unwrap();
        ledger
            .create_contract(
                contract("c-1", "b-1"),
                vec![milestone("m-1", "c-1", 400.0), milestone("m-2", "c-1", 600.0)],
            )
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn a_bid_admits_at_most_one_contract() {
        let ledger = seeded().await;
        let result = ledger
            .create_contract(contract("c-2", "b-1"), vec![milestone("m-3", "c-2", 100.0)])
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn creating_a_contract_marks_the_project_in_progress() {
        let ledger = seeded().await;
        let project = ledger
            .get_project(&ProjectId::new("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.status, ProjectStatus::InProgress);
    }

    #[tokio::test]
    async fn stale_stage_transitions_conflict() {
        let ledger = seeded().await;
        let id = ContractId::new("c-1");
        ledger
            .transition_contract_stage(&id, ContractStage::Proposal, ContractStage::Approval, Utc::now())
            .await
            .unwrap();
        let result = ledger
            .transition_contract_stage(&id, ContractStage::Proposal, ContractStage::Approval, Utc::now())
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        let stored = ledger.get_contract(&id).await.unwrap().unwrap();
        assert!(stored.terms_accepted);
        assert_eq!(stored.stage, ContractStage::Approval);
    }

    #[tokio::test]
    async fn amount_edits_rebalance_the_contract_total() {
        let ledger = seeded().await;
        let edit = MilestoneEdit {
            amount: Some(500.0),
            ..MilestoneEdit::default()
        };
        ledger
            .update_milestone_details(&MilestoneId::new("m-1"), MilestoneStatus::Pending, edit, Utc::now())
            .await
            .unwrap();

        let stored = ledger
            .get_contract(&ContractId::new("c-1"))
            .await
            .unwrap()
            .unwrap();
        let milestones = ledger
            .list_milestones(&ContractId::new("c-1"))
            .await
            .unwrap();
        let sum: f64 = milestones.iter().map(|m| m.amount).sum();
        assert!((stored.amount - sum).abs() < worklane_types::AMOUNT_TOLERANCE);
        assert!((stored.amount - 1100.0).abs() < worklane_types::AMOUNT_TOLERANCE);
    }

    #[tokio::test]
    async fn first_in_progress_milestone_stamps_the_start_date() {
        let ledger = seeded().await;
        let id = MilestoneId::new("m-1");
        ledger
            .transition_milestone_status(
                &id,
                MilestoneStatus::Pending,
                MilestoneStatus::InProgress,
                Utc::now(),
                progress("m-1", MilestoneStatus::InProgress),
                None,
            )
            .await
            .unwrap();
        let stored = ledger
            .get_contract(&ContractId::new("c-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.start_date.is_some());
    }

    #[tokio::test]
    async fn payment_request_is_guarded_by_milestone_state() {
        let ledger = seeded().await;
        let id = MilestoneId::new("m-1");

        // Still pending: the compound write refuses.
        let result = ledger
            .request_payment(
                &id,
                payment("pay-1", "m-1"),
                progress("m-1", MilestoneStatus::PaymentRequested),
                note(NotificationKind::PaymentRequested),
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        for (from, to) in [
            (MilestoneStatus::Pending, MilestoneStatus::InProgress),
            (MilestoneStatus::InProgress, MilestoneStatus::Completed),
        ] {
            ledger
                .transition_milestone_status(&id, from, to, Utc::now(), progress("m-1", to), None)
                .await
                .unwrap();
        }

        let (stored_milestone, stored_payment) = ledger
            .request_payment(
                &id,
                payment("pay-1", "m-1"),
                progress("m-1", MilestoneStatus::PaymentRequested),
                note(NotificationKind::PaymentRequested),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(stored_milestone.status, MilestoneStatus::PaymentRequested);
        assert_eq!(stored_payment.status, PaymentStatus::Pending);

        // Requesting again cannot create a second payment.
        let result = ledger
            .request_payment(
                &id,
                payment("pay-2", "m-1"),
                progress("m-1", MilestoneStatus::PaymentRequested),
                note(NotificationKind::PaymentRequested),
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn settlement_pays_the_milestone_exactly_once() {
        let ledger = seeded().await;
        let id = MilestoneId::new("m-1");
        for (from, to) in [
            (MilestoneStatus::Pending, MilestoneStatus::InProgress),
            (MilestoneStatus::InProgress, MilestoneStatus::Completed),
        ] {
            ledger
                .transition_milestone_status(&id, from, to, Utc::now(), progress("m-1", to), None)
                .await
                .unwrap();
        }
        ledger
            .request_payment(
                &id,
                payment("pay-1", "m-1"),
                progress("m-1", MilestoneStatus::PaymentRequested),
                note(NotificationKind::PaymentRequested),
                Utc::now(),
            )
            .await
            .unwrap();
        let pay_id = PaymentId::new("pay-1");
        ledger
            .mark_payment_processing(&pay_id, HoldId::new("hold-1"), Utc::now())
            .await
            .unwrap();
        let settled = ledger
            .settle_payment(&pay_id, Utc::now(), note(NotificationKind::MilestonePaid))
            .await
            .unwrap();
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert!(settled.completed_at.is_some());

        let stored = ledger.get_milestone(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, MilestoneStatus::Paid);

        // Replaying the settle write conflicts instead of double-paying.
        let result = ledger
            .settle_payment(&pay_id, Utc::now(), note(NotificationKind::MilestonePaid))
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn cancelling_closes_open_milestones_and_reopens_the_project() {
        let ledger = seeded().await;
        let id = ContractId::new("c-1");
        ledger
            .cancel_contract(
                &id,
                ContractStage::Proposal,
                Utc::now(),
                vec![note(NotificationKind::ContractCancelled)],
            )
            .await
            .unwrap();

        let stored = ledger.get_contract(&id).await.unwrap().unwrap();
        assert_eq!(stored.stage, ContractStage::Cancelled);
        for milestone in ledger.list_milestones(&id).await.unwrap() {
            assert_eq!(milestone.status, MilestoneStatus::Cancelled);
        }
        let project = ledger
            .get_project(&ProjectId::new("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(project.status, ProjectStatus::Open);
    }

    #[tokio::test]
    async fn notifications_page_newest_first() {
        let ledger = seeded().await;
        for i in 0..3 {
            ledger
                .append_notification(Notification::new(
                    UserId::new("client-1"),
                    NotificationKind::MilestoneCompleted,
                    format!("note {i}"),
                ))
                .await
                .unwrap();
        }
        let page = ledger
            .list_notifications(
                &UserId::new("client-1"),
                QueryWindow { limit: 2, offset: 0 },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message, "note 2");
    }
}
