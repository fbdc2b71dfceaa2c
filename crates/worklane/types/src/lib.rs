//! Worklane Types - the marketplace lifecycle domain model
//!
//! Contracts, milestones, payments and the principals acting on them.
//! Everything here is plain data: state machines, storage and escrow
//! orchestration live in the sibling crates.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(UserId);
string_id!(ProjectId);
string_id!(BidId);
string_id!(ContractId);
string_id!(MilestoneId);
string_id!(PaymentId);
string_id!(ProgressUpdateId);
string_id!(NotificationId);
string_id!(
    /// Identifier of an escrow hold ("payment intent") at the gateway.
    HoldId
);
string_id!(TransferId);
string_id!(RefundId);

/// Amounts must agree within a cent; milestone sums are checked against this.
pub const AMOUNT_TOLERANCE: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Freelancer,
    Admin,
}

/// Authenticated caller, resolved once per request by the surrounding layer
/// and threaded explicitly into every lifecycle operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId::new(id),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub client_id: UserId,
    pub title: String,
    pub description: String,
    pub budget: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub skills: Vec<String>,
    pub category: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Shortlisted,
    Accepted,
    Rejected,
}

/// A freelancer's proposal on a project. At most one bid per freelancer per
/// project; an Accepted bid is the precondition for creating a contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub project_id: ProjectId,
    pub freelancer_id: UserId,
    pub amount: f64,
    pub delivery_time_days: u32,
    pub cover_letter: String,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStage {
    Proposal,
    Approval,
    Payment,
    Review,
    Completed,
    Cancelled,
    Disputed,
}

impl ContractStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContractStage::Completed | ContractStage::Cancelled)
    }

    /// Whether `target` is a legal single step from this stage.
    ///
    /// The forward sequence is Proposal -> Approval -> Payment -> Review ->
    /// Completed with no skips; Cancelled and Disputed are reachable from any
    /// non-terminal stage.
    pub fn can_advance_to(&self, target: ContractStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            ContractStage::Cancelled | ContractStage::Disputed => *self != target,
            ContractStage::Approval => *self == ContractStage::Proposal,
            ContractStage::Payment => *self == ContractStage::Approval,
            ContractStage::Review => *self == ContractStage::Payment,
            ContractStage::Completed => *self == ContractStage::Review,
            ContractStage::Proposal => false,
        }
    }
}

impl std::fmt::Display for ContractStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContractStage::Proposal => "proposal",
            ContractStage::Approval => "approval",
            ContractStage::Payment => "payment",
            ContractStage::Review => "review",
            ContractStage::Completed => "completed",
            ContractStage::Cancelled => "cancelled",
            ContractStage::Disputed => "disputed",
        };
        write!(f, "{name}")
    }
}

/// The binding agreement between one client and one freelancer for one
/// accepted bid, decomposed into milestones.
///
/// Invariant: `amount` equals the sum of the milestone amounts within
/// [`AMOUNT_TOLERANCE`] at every observable point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub project_id: ProjectId,
    pub client_id: UserId,
    pub freelancer_id: UserId,
    /// At most one contract references a bid; the store enforces uniqueness.
    pub bid_id: BidId,
    pub title: String,
    pub terms: String,
    pub amount: f64,
    pub stage: ContractStage,
    pub terms_accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
    PaymentRequested,
    Paid,
    Cancelled,
}

impl MilestoneStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MilestoneStatus::Paid | MilestoneStatus::Cancelled)
    }

    /// Whether `target` is a legal single step from this status.
    ///
    /// Pending -> InProgress -> Completed -> PaymentRequested -> Paid, with
    /// Cancelled reachable from any non-terminal status.
    pub fn can_move_to(&self, target: MilestoneStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            MilestoneStatus::Cancelled => true,
            MilestoneStatus::InProgress => *self == MilestoneStatus::Pending,
            MilestoneStatus::Completed => *self == MilestoneStatus::InProgress,
            MilestoneStatus::PaymentRequested => *self == MilestoneStatus::Completed,
            MilestoneStatus::Paid => *self == MilestoneStatus::PaymentRequested,
            MilestoneStatus::Pending => false,
        }
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::PaymentRequested => "payment_requested",
            MilestoneStatus::Paid => "paid",
            MilestoneStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// An independently priced, independently trackable unit of deliverable work
/// within a contract. Created atomically with its contract; the amount is
/// immutable once the contract leaves Proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub contract_id: ContractId,
    pub project_id: ProjectId,
    pub title: String,
    pub description: String,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Milestone input supplied at contract creation time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MilestoneDraft {
    pub title: String,
    pub description: String,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

/// Client-side detail edit for a Pending milestone. `None` leaves a field
/// untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MilestoneEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub amount: Option<f64>,
    pub due_date: Option<DateTime<Utc>>,
}

impl MilestoneEdit {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.amount.is_none()
            && self.due_date.is_none()
    }
}

/// Append-only audit record of milestone activity. Never mutated or deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: ProgressUpdateId,
    pub milestone_id: MilestoneId,
    pub author_id: UserId,
    pub description: String,
    /// Milestone status at the time this update was recorded.
    pub status: MilestoneStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Refunded)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        };
        write!(f, "{name}")
    }
}

/// Escrow payment for exactly one milestone.
///
/// Created when the milestone enters PaymentRequested. Processing means a
/// hold exists at the gateway; Completed means funds were settled to the
/// freelancer. Completed may only move to Refunded; Refunded is final.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub contract_id: ContractId,
    pub milestone_id: MilestoneId,
    pub client_id: UserId,
    pub freelancer_id: UserId,
    pub amount: f64,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<HoldId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentRequested,
    MilestoneCompleted,
    MilestonePaid,
    ContractCompleted,
    ContractCancelled,
}

/// Informational side-effect record emitted on key transitions. Not part of
/// the lifecycle invariants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<ContractId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<MilestoneId>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(recipient_id: UserId, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            id: NotificationId::generate(),
            recipient_id,
            kind,
            message: message.into(),
            contract_id: None,
            milestone_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn about_contract(mut self, contract_id: ContractId) -> Self {
        self.contract_id = Some(contract_id);
        self
    }

    pub fn about_milestone(mut self, milestone_id: MilestoneId) -> Self {
        self.milestone_id = Some(milestone_id);
        self
    }
}

/// Requested contract transition, validated before it reaches the state
/// machine. One variant per edge family keeps the policy table exhaustive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target")]
pub enum ContractEvent {
    EditTerms,
    AdvanceStage(ContractStage),
}

/// Requested milestone transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target")]
pub enum MilestoneEvent {
    /// Narration only; no status change.
    RecordProgress,
    SetStatus(MilestoneStatus),
    EditDetails,
}

/// Machine-readable authorization denial codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    NotOwner,
    NotFreelancer,
    NotParticipant,
    RoleNotAllowed,
    InvalidSourceState,
    TerminalState,
    UnknownTransition,
    EngineOnly,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::NotOwner => "NOT_OWNER",
            DenyReason::NotFreelancer => "NOT_FREELANCER",
            DenyReason::NotParticipant => "NOT_PARTICIPANT",
            DenyReason::RoleNotAllowed => "ROLE_NOT_ALLOWED",
            DenyReason::InvalidSourceState => "INVALID_SOURCE_STATE",
            DenyReason::TerminalState => "TERMINAL_STATE",
            DenyReason::UnknownTransition => "UNKNOWN_TRANSITION",
            DenyReason::EngineOnly => "ENGINE_ONLY",
        }
    }
}

/// Authorization denial with a stable reason code. Expected and frequent;
/// returned as a value, never thrown away silently.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{} ({detail})", .reason.code())]
pub struct Denial {
    pub reason: DenyReason,
    pub detail: String,
}

impl Denial {
    pub fn new(reason: DenyReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Whether two monetary amounts agree within [`AMOUNT_TOLERANCE`].
pub fn amounts_match(left: f64, right: f64) -> bool {
    (left - right).abs() < AMOUNT_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_stages_admit_only_adjacent_edges() {
        use ContractStage::*;
        assert!(Proposal.can_advance_to(Approval));
        assert!(Approval.can_advance_to(Payment));
        assert!(Payment.can_advance_to(Review));
        assert!(Review.can_advance_to(Completed));

        // No skips.
        assert!(!Proposal.can_advance_to(Payment));
        assert!(!Proposal.can_advance_to(Completed));
        assert!(!Approval.can_advance_to(Review));
        assert!(!Payment.can_advance_to(Completed));
        // No going back.
        assert!(!Review.can_advance_to(Payment));
        assert!(!Approval.can_advance_to(Proposal));
    }

    #[test]
    fn cancel_and_dispute_reach_every_non_terminal_stage() {
        use ContractStage::*;
        for stage in [Proposal, Approval, Payment, Review, Disputed] {
            assert!(stage.can_advance_to(Cancelled), "{stage} -> cancelled");
        }
        for stage in [Proposal, Approval, Payment, Review] {
            assert!(stage.can_advance_to(Disputed), "{stage} -> disputed");
        }
        assert!(!Completed.can_advance_to(Cancelled));
        assert!(!Cancelled.can_advance_to(Disputed));
        assert!(!Disputed.can_advance_to(Disputed));
    }

    #[test]
    fn amount_tolerance_is_one_cent() {
        assert!(amounts_match(1000.0, 1000.009));
        assert!(!amounts_match(1000.0, 1000.011));
        assert!(!amounts_match(1000.0, 900.0));
    }

    #[test]
    fn deny_reason_codes_are_stable() {
        assert_eq!(DenyReason::NotOwner.code(), "NOT_OWNER");
        assert_eq!(
            DenyReason::InvalidSourceState.code(),
            "INVALID_SOURCE_STATE"
        );
        let denial = Denial::new(DenyReason::NotFreelancer, "caller is not on the contract");
        assert!(denial.to_string().starts_with("NOT_FREELANCER"));
    }
}
