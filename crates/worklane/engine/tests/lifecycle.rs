//! End-to-end lifecycle tests over the in-memory ledger and mock gateway.

use chrono::Utc;
use std::sync::Arc;
use worklane_engine::{
    ContractEngine, CreateContract, EngineError, EscrowReconciler, MilestoneEngine, TermsUpdate,
};
use worklane_escrow::MockEscrowGateway;
use worklane_storage::{
    memory::InMemoryLedger, ContractStore, DirectoryStore, LedgerStore, MilestoneStore,
    NotificationStore, PaymentStore, QueryWindow,
};
use worklane_types::{
    Bid, BidId, BidStatus, ContractId, ContractStage, DenyReason, HoldId, MilestoneDraft,
    MilestoneEdit, MilestoneId, MilestoneStatus, PaymentStatus, Principal, Project, ProjectId,
    ProjectStatus, Role, UserId,
};

struct Harness {
    store: Arc<InMemoryLedger>,
    gateway: Arc<MockEscrowGateway>,
    contracts: ContractEngine,
    milestones: MilestoneEngine,
    escrow: EscrowReconciler,
    client: Principal,
    freelancer: Principal,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryLedger::new());
    let gateway = Arc::new(MockEscrowGateway::new());

    store
        .insert_project(Project {
            id: ProjectId::new("p-1"),
            client_id: UserId::new("client-1"),
            title: "Marketplace site".to_string(),
            description: "build it".to_string(),
            budget: 1500.0,
            deadline: None,
            skills: vec!["rust".to_string()],
            category: "web".to_string(),
            status: ProjectStatus::Open,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .insert_bid(Bid {
            id: BidId::new("b-1"),
            project_id: ProjectId::new("p-1"),
            freelancer_id: UserId::new("freelancer-1"),
            amount: 1000.0,
            delivery_time_days: 30,
            cover_letter: "hire me".to_string(),
            status: BidStatus::Accepted,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let ledger: Arc<dyn LedgerStore> = store.clone();
    Harness {
        contracts: ContractEngine::new(ledger.clone()),
        milestones: MilestoneEngine::new(ledger.clone()),
        escrow: EscrowReconciler::new(ledger, gateway.clone(), "USD"),
        store,
        gateway,
        client: Principal::new("client-1", Role::Client),
        freelancer: Principal::new("freelancer-1", Role::Freelancer),
    }
}

fn two_milestones() -> Vec<MilestoneDraft> {
    vec![
        MilestoneDraft {
            title: "Design".to_string(),
            description: "wireframes and mockups".to_string(),
            amount: 400.0,
            due_date: None,
        },
        MilestoneDraft {
            title: "Build".to_string(),
            description: "implementation".to_string(),
            amount: 600.0,
            due_date: None,
        },
    ]
}

fn create_request(amount: f64) -> CreateContract {
    CreateContract {
        bid_id: BidId::new("b-1"),
        title: "Marketplace site".to_string(),
        terms: "two milestones, net 7".to_string(),
        amount,
        milestones: two_milestones(),
    }
}

impl Harness {
    async fn created_contract(&self) -> ContractId {
        let aggregate = self
            .contracts
            .create(&self.client, create_request(1000.0))
            .await
            .unwrap();
        aggregate.contract.id
    }

    /// Proposal -> Approval (freelancer) -> Payment (client).
    async fn active_contract(&self) -> (ContractId, Vec<MilestoneId>) {
        let id = self.created_contract().await;
        self.contracts
            .advance_stage(&self.freelancer, &id, ContractStage::Approval)
            .await
            .unwrap();
        self.contracts
            .advance_stage(&self.client, &id, ContractStage::Payment)
            .await
            .unwrap();
        let milestones = self.store.list_milestones(&id).await.unwrap();
        (id, milestones.into_iter().map(|m| m.id).collect())
    }

    /// Drive one milestone to PaymentRequested.
    async fn request_payment(&self, milestone_id: &MilestoneId) {
        for status in [
            MilestoneStatus::InProgress,
            MilestoneStatus::Completed,
            MilestoneStatus::PaymentRequested,
        ] {
            self.milestones
                .record_progress(
                    &self.freelancer,
                    milestone_id,
                    format!("moving to {status}"),
                    Some(status),
                )
                .await
                .unwrap();
        }
    }

    /// Fund a requested milestone and return its hold id.
    async fn fund(&self, contract_id: &ContractId, milestone_id: &MilestoneId) -> HoldId {
        let funding = self
            .escrow
            .fund_escrow(&self.client, contract_id, milestone_id)
            .await
            .unwrap();
        funding.payment.payment_intent_id.unwrap()
    }
}

// Scenario A: milestones sum to the contract amount.
#[tokio::test]
async fn creating_a_contract_seeds_proposal_stage_and_pending_milestones() {
    let h = harness().await;
    let aggregate = h
        .contracts
        .create(&h.client, create_request(1000.0))
        .await
        .unwrap();

    assert_eq!(aggregate.contract.stage, ContractStage::Proposal);
    assert!(!aggregate.contract.terms_accepted);
    assert_eq!(aggregate.milestones.len(), 2);
    assert!(aggregate
        .milestones
        .iter()
        .all(|m| m.status == MilestoneStatus::Pending));
    let sum: f64 = aggregate.milestones.iter().map(|m| m.amount).sum();
    assert!((aggregate.contract.amount - sum).abs() < 0.01);
}

// Scenario B: mismatched sum is a validation failure.
#[tokio::test]
async fn mismatched_milestone_sum_is_rejected() {
    let h = harness().await;
    let err = h
        .contracts
        .create(&h.client, create_request(900.0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[tokio::test]
async fn a_bid_admits_at_most_one_contract() {
    let h = harness().await;
    h.created_contract().await;
    let err = h
        .contracts
        .create(&h.client, create_request(1000.0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
}

#[tokio::test]
async fn only_the_project_owner_creates_contracts() {
    let h = harness().await;
    let err = h
        .contracts
        .create(&h.freelancer, create_request(1000.0))
        .await
        .unwrap_err();
    let EngineError::Forbidden(denial) = err else {
        panic!("expected forbidden, got {err:?}");
    };
    assert_eq!(denial.reason, DenyReason::RoleNotAllowed);

    let other_client = Principal::new("client-2", Role::Client);
    let err = h
        .contracts
        .create(&other_client, create_request(1000.0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn terms_edit_is_proposal_only() {
    let h = harness().await;
    let id = h.created_contract().await;
    let update = TermsUpdate {
        terms: Some("net 14".to_string()),
        ..TermsUpdate::default()
    };
    let updated = h
        .contracts
        .update_terms(&h.client, &id, update.clone())
        .await
        .unwrap();
    assert_eq!(updated.terms, "net 14");

    h.contracts
        .advance_stage(&h.freelancer, &id, ContractStage::Approval)
        .await
        .unwrap();
    let err = h
        .contracts
        .update_terms(&h.client, &id, update)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn stage_skips_are_invalid_transitions() {
    let h = harness().await;
    let id = h.created_contract().await;
    for target in [
        ContractStage::Payment,
        ContractStage::Review,
        ContractStage::Completed,
    ] {
        let err = h
            .contracts
            .advance_stage(&h.client, &id, target)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION", "{target}");
    }
}

#[tokio::test]
async fn approval_sets_terms_accepted() {
    let h = harness().await;
    let id = h.created_contract().await;
    let updated = h
        .contracts
        .advance_stage(&h.freelancer, &id, ContractStage::Approval)
        .await
        .unwrap();
    assert_eq!(updated.stage, ContractStage::Approval);
    assert!(updated.terms_accepted);
}

#[tokio::test]
async fn milestones_cannot_progress_before_the_contract_is_active() {
    let h = harness().await;
    let id = h.created_contract().await;
    let milestone_id = h.store.list_milestones(&id).await.unwrap()[0].id.clone();
    let err = h
        .milestones
        .record_progress(
            &h.freelancer,
            &milestone_id,
            "starting".to_string(),
            Some(MilestoneStatus::InProgress),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn first_milestone_start_stamps_the_contract_start_date() {
    let h = harness().await;
    let (id, milestone_ids) = h.active_contract().await;
    assert!(h
        .store
        .get_contract(&id)
        .await
        .unwrap()
        .unwrap()
        .start_date
        .is_none());

    h.milestones
        .record_progress(
            &h.freelancer,
            &milestone_ids[0],
            "starting".to_string(),
            Some(MilestoneStatus::InProgress),
        )
        .await
        .unwrap();
    assert!(h
        .store
        .get_contract(&id)
        .await
        .unwrap()
        .unwrap()
        .start_date
        .is_some());
}

// Scenario C: payment request needs a completed milestone and creates the
// payment exactly once.
#[tokio::test]
async fn payment_request_requires_completion_and_creates_one_pending_payment() {
    let h = harness().await;
    let (_, milestone_ids) = h.active_contract().await;
    let milestone_id = &milestone_ids[0];

    let err = h
        .milestones
        .record_progress(
            &h.freelancer,
            milestone_id,
            "pay me".to_string(),
            Some(MilestoneStatus::PaymentRequested),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");

    h.request_payment(milestone_id).await;
    let payment = h
        .store
        .find_payment_by_milestone(milestone_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!((payment.amount - 400.0).abs() < 0.01);

    // The client was notified.
    let notes = h
        .store
        .list_notifications(&UserId::new("client-1"), QueryWindow::default())
        .await
        .unwrap();
    assert!(!notes.is_empty());

    // A second request cannot create a second payment.
    let err = h
        .milestones
        .record_progress(
            &h.freelancer,
            milestone_id,
            "pay me again".to_string(),
            Some(MilestoneStatus::PaymentRequested),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
}

#[tokio::test]
async fn client_cannot_drive_milestone_work_edges() {
    let h = harness().await;
    let (_, milestone_ids) = h.active_contract().await;
    let err = h
        .milestones
        .record_progress(
            &h.client,
            &milestone_ids[0],
            "starting".to_string(),
            Some(MilestoneStatus::InProgress),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn paid_is_unreachable_for_callers() {
    let h = harness().await;
    let (_, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;
    let err = h
        .milestones
        .record_progress(
            &h.freelancer,
            &milestone_ids[0],
            "mark paid".to_string(),
            Some(MilestoneStatus::Paid),
        )
        .await
        .unwrap_err();
    let EngineError::Forbidden(denial) = err else {
        panic!("expected forbidden, got {err:?}");
    };
    assert_eq!(denial.reason, DenyReason::EngineOnly);
}

#[tokio::test]
async fn funding_creates_a_hold_and_marks_the_payment_processing() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;

    let funding = h
        .escrow
        .fund_escrow(&h.client, &contract_id, &milestone_ids[0])
        .await
        .unwrap();
    assert_eq!(funding.payment.status, PaymentStatus::Processing);
    assert!(funding.payment.payment_intent_id.is_some());
    assert!(!funding.client_secret.is_empty());

    // Funding twice is refused by the payment state.
    let err = h
        .escrow
        .fund_escrow(&h.client, &contract_id, &milestone_ids[0])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn gateway_outage_leaves_local_state_untouched() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;

    h.gateway.fail_next(1);
    let err = h
        .escrow
        .fund_escrow(&h.client, &contract_id, &milestone_ids[0])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "GATEWAY_UNAVAILABLE");

    let payment = h
        .store
        .find_payment_by_milestone(&milestone_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert!(payment.payment_intent_id.is_none());

    // Retrying reuses the idempotency key and succeeds.
    let funding = h
        .escrow
        .fund_escrow(&h.client, &contract_id, &milestone_ids[0])
        .await
        .unwrap();
    assert_eq!(funding.payment.status, PaymentStatus::Processing);
}

#[tokio::test]
async fn hold_confirmation_settles_the_payment_and_is_idempotent() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;
    let hold_id = h.fund(&contract_id, &milestone_ids[0]).await;

    h.escrow.on_hold_succeeded(&hold_id).await.unwrap();

    let payment = h
        .store
        .find_payment_by_milestone(&milestone_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(payment.completed_at.is_some());
    let milestone = h
        .store
        .get_milestone(&milestone_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(milestone.status, MilestoneStatus::Paid);

    let notes_before = h
        .store
        .list_notifications(&UserId::new("freelancer-1"), QueryWindow::default())
        .await
        .unwrap()
        .len();

    // Replay: same end state, no extra notifications, no transfers.
    h.escrow.on_hold_succeeded(&hold_id).await.unwrap();
    let notes_after = h
        .store
        .list_notifications(&UserId::new("freelancer-1"), QueryWindow::default())
        .await
        .unwrap()
        .len();
    assert_eq!(notes_before, notes_after);
    assert_eq!(h.gateway.transfer_count(), 0);
}

#[tokio::test]
async fn unknown_hold_events_are_orphans() {
    let h = harness().await;
    let err = h
        .escrow
        .on_hold_succeeded(&HoldId::new("hold-nope"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ORPHAN_EVENT");
}

// Scenario D: completion needs every milestone paid, then sets the end date.
#[tokio::test]
async fn completion_requires_all_milestones_paid() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;

    // Pay the first milestone only.
    h.request_payment(&milestone_ids[0]).await;
    let hold = h.fund(&contract_id, &milestone_ids[0]).await;
    h.escrow.on_hold_succeeded(&hold).await.unwrap();

    // Second still in progress: the review submission works, completion is
    // refused.
    h.milestones
        .record_progress(
            &h.freelancer,
            &milestone_ids[1],
            "working".to_string(),
            Some(MilestoneStatus::InProgress),
        )
        .await
        .unwrap();
    h.contracts
        .advance_stage(&h.freelancer, &contract_id, ContractStage::Review)
        .await
        .unwrap();
    let err = h
        .contracts
        .advance_stage(&h.client, &contract_id, ContractStage::Completed)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    // Pay the second; the reconciler's aggregate check completes the
    // contract because it is already under review.
    for status in [MilestoneStatus::Completed, MilestoneStatus::PaymentRequested] {
        h.milestones
            .record_progress(&h.freelancer, &milestone_ids[1], "done".to_string(), Some(status))
            .await
            .unwrap();
    }
    let hold = h.fund(&contract_id, &milestone_ids[1]).await;
    h.escrow.on_hold_succeeded(&hold).await.unwrap();

    let contract = h.store.get_contract(&contract_id).await.unwrap().unwrap();
    assert_eq!(contract.stage, ContractStage::Completed);
    assert!(contract.end_date.is_some());
    let project = h
        .store
        .get_project(&ProjectId::new("p-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
}

#[tokio::test]
async fn aggregate_completion_waits_for_review() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;

    for milestone_id in &milestone_ids {
        h.request_payment(milestone_id).await;
        let hold = h.fund(&contract_id, milestone_id).await;
        h.escrow.on_hold_succeeded(&hold).await.unwrap();
    }

    // All paid, but the contract never entered Review: the sequence holds.
    let contract = h.store.get_contract(&contract_id).await.unwrap().unwrap();
    assert_eq!(contract.stage, ContractStage::Payment);

    // The explicit path still works: Review, then client completion.
    h.contracts
        .advance_stage(&h.freelancer, &contract_id, ContractStage::Review)
        .await
        .unwrap();
    let completed = h
        .contracts
        .advance_stage(&h.client, &contract_id, ContractStage::Completed)
        .await
        .unwrap();
    assert_eq!(completed.stage, ContractStage::Completed);
    assert!(completed.end_date.is_some());
}

#[tokio::test]
async fn release_transfers_and_settles_synchronously() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;
    let hold = h.fund(&contract_id, &milestone_ids[0]).await;

    // The hold has not settled yet.
    let err = h
        .escrow
        .release_escrow(&h.client, &contract_id, &milestone_ids[0])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    h.gateway.confirm_hold(&hold);
    h.escrow
        .release_escrow(&h.client, &contract_id, &milestone_ids[0])
        .await
        .unwrap();
    assert_eq!(h.gateway.transfer_count(), 1);

    let milestone = h
        .store
        .get_milestone(&milestone_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(milestone.status, MilestoneStatus::Paid);

    // The late gateway event is a no-op.
    h.escrow.on_hold_succeeded(&hold).await.unwrap();
    assert_eq!(h.gateway.transfer_count(), 1);
}

#[tokio::test]
async fn only_the_client_funds_or_releases() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;

    let err = h
        .escrow
        .fund_escrow(&h.freelancer, &contract_id, &milestone_ids[0])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    let err = h
        .escrow
        .release_escrow(&h.freelancer, &contract_id, &milestone_ids[0])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn refund_returns_held_funds_and_cancels() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;
    h.fund(&contract_id, &milestone_ids[0]).await;

    h.escrow
        .refund_escrow(&h.freelancer, &contract_id)
        .await
        .unwrap();

    let payment = h
        .store
        .find_payment_by_milestone(&milestone_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);

    let contract = h.store.get_contract(&contract_id).await.unwrap().unwrap();
    assert_eq!(contract.stage, ContractStage::Cancelled);
    for milestone in h.store.list_milestones(&contract_id).await.unwrap() {
        assert_eq!(milestone.status, MilestoneStatus::Cancelled);
    }
    let project = h
        .store
        .get_project(&ProjectId::new("p-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(project.status, ProjectStatus::Open);
}

// Scenario E: no refunds once the contract completed.
#[tokio::test]
async fn refund_after_completion_is_invalid() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    for milestone_id in &milestone_ids {
        h.request_payment(milestone_id).await;
        let hold = h.fund(&contract_id, milestone_id).await;
        h.escrow.on_hold_succeeded(&hold).await.unwrap();
    }
    h.contracts
        .advance_stage(&h.freelancer, &contract_id, ContractStage::Review)
        .await
        .unwrap();
    h.contracts
        .advance_stage(&h.client, &contract_id, ContractStage::Completed)
        .await
        .unwrap();

    let err = h
        .escrow
        .refund_escrow(&h.client, &contract_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn direct_cancellation_refuses_while_escrow_is_held() {
    let h = harness().await;
    let (contract_id, milestone_ids) = h.active_contract().await;
    h.request_payment(&milestone_ids[0]).await;
    h.fund(&contract_id, &milestone_ids[0]).await;

    let err = h
        .contracts
        .advance_stage(&h.client, &contract_id, ContractStage::Cancelled)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn amount_edits_rebalance_and_freeze_after_proposal() {
    let h = harness().await;
    let contract_id = h.created_contract().await;
    let milestone_ids: Vec<MilestoneId> = h
        .store
        .list_milestones(&contract_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();

    let edit = MilestoneEdit {
        amount: Some(500.0),
        ..MilestoneEdit::default()
    };
    h.milestones
        .update_details(&h.client, &milestone_ids[0], edit.clone())
        .await
        .unwrap();
    let contract = h.store.get_contract(&contract_id).await.unwrap().unwrap();
    assert!((contract.amount - 1100.0).abs() < 0.01);

    // The freelancer may not edit details.
    let err = h
        .milestones
        .update_details(&h.freelancer, &milestone_ids[1], edit.clone())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");

    // Once the contract leaves Proposal, amounts are frozen.
    h.contracts
        .advance_stage(&h.freelancer, &contract_id, ContractStage::Approval)
        .await
        .unwrap();
    let err = h
        .milestones
        .update_details(&h.client, &milestone_ids[1], edit)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");

    // Non-amount edits stay open for pending milestones.
    h.milestones
        .update_details(
            &h.client,
            &milestone_ids[1],
            MilestoneEdit {
                description: Some("revised scope".to_string()),
                ..MilestoneEdit::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn narration_always_appends_to_the_progress_trail() {
    let h = harness().await;
    let (_, milestone_ids) = h.active_contract().await;
    let milestone_id = &milestone_ids[0];

    h.milestones
        .record_progress(&h.freelancer, milestone_id, "kickoff notes".to_string(), None)
        .await
        .unwrap();
    h.milestones
        .record_progress(
            &h.freelancer,
            milestone_id,
            "starting".to_string(),
            Some(MilestoneStatus::InProgress),
        )
        .await
        .unwrap();

    let trail = h.milestones.progress_updates(milestone_id).await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].status, MilestoneStatus::Pending);
    assert_eq!(trail[1].status, MilestoneStatus::InProgress);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Advance(usize, ContractStage),
        EditAmount(usize, f64),
        Milestone(usize, usize, MilestoneStatus),
    }

    fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
        let stage = prop_oneof![
            Just(ContractStage::Approval),
            Just(ContractStage::Payment),
            Just(ContractStage::Review),
            Just(ContractStage::Completed),
            Just(ContractStage::Disputed),
        ];
        let status = prop_oneof![
            Just(MilestoneStatus::InProgress),
            Just(MilestoneStatus::Completed),
            Just(MilestoneStatus::PaymentRequested),
            Just(MilestoneStatus::Cancelled),
        ];
        let op = prop_oneof![
            (0..2usize, stage).prop_map(|(actor, s)| Op::Advance(actor, s)),
            (0..2usize, 1.0..2000.0f64).prop_map(|(m, a)| Op::EditAmount(m, a)),
            (0..2usize, 0..2usize, status).prop_map(|(actor, m, s)| Op::Milestone(actor, m, s)),
        ];
        proptest::collection::vec(op, 0..25)
    }

    fn legal_stages() -> Vec<ContractStage> {
        vec![
            ContractStage::Proposal,
            ContractStage::Approval,
            ContractStage::Payment,
            ContractStage::Review,
            ContractStage::Completed,
            ContractStage::Cancelled,
            ContractStage::Disputed,
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Whatever interleaving of caller operations runs, the amount
        /// invariant holds and the stage stays inside the defined graph.
        #[test]
        fn random_operations_preserve_invariants(ops in op_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let h = harness().await;
                let contract_id = h.created_contract().await;
                let milestone_ids: Vec<MilestoneId> = h
                    .store
                    .list_milestones(&contract_id)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|m| m.id)
                    .collect();
                let actors = [h.client.clone(), h.freelancer.clone()];

                for op in ops {
                    // Failures are expected outcomes; the invariants must
                    // hold regardless.
                    let _ = match op {
                        Op::Advance(actor, target) => h
                            .contracts
                            .advance_stage(&actors[actor], &contract_id, target)
                            .await
                            .map(|_| ()),
                        Op::EditAmount(index, amount) => h
                            .milestones
                            .update_details(
                                &h.client,
                                &milestone_ids[index],
                                MilestoneEdit {
                                    amount: Some((amount * 100.0).round() / 100.0),
                                    ..MilestoneEdit::default()
                                },
                            )
                            .await
                            .map(|_| ()),
                        Op::Milestone(actor, index, status) => h
                            .milestones
                            .record_progress(
                                &actors[actor],
                                &milestone_ids[index],
                                "prop".to_string(),
                                Some(status),
                            )
                            .await
                            .map(|_| ()),
                    };

                    let contract = h
                        .store
                        .get_contract(&contract_id)
                        .await
                        .unwrap()
                        .unwrap();
                    prop_assert!(legal_stages().contains(&contract.stage));

                    let milestones = h.store.list_milestones(&contract_id).await.unwrap();
                    let sum: f64 = milestones.iter().map(|m| m.amount).sum();
                    prop_assert!(
                        (contract.amount - sum).abs() < 0.01,
                        "amount {} desynced from milestone sum {}",
                        contract.amount,
                        sum
                    );
                }
                Ok(())
            })?;
        }
    }
}
