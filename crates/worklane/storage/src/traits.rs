use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use worklane_types::{
    Bid, BidId, Contract, ContractId, ContractStage, HoldId, Milestone, MilestoneEdit,
    MilestoneId, MilestoneStatus, Notification, Payment, PaymentId, ProgressUpdate, Project,
    ProjectId, UserId,
};

/// Generic query window for paged reads. A limit of 0 means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Read side and seeding for the marketplace records the engine validates
/// against but does not own (projects, bids).
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn insert_project(&self, project: Project) -> StorageResult<()>;

    async fn get_project(&self, id: &ProjectId) -> StorageResult<Option<Project>>;

    /// Insert a bid. At most one bid per (project, freelancer) pair;
    /// duplicates fail with `Conflict`.
    async fn insert_bid(&self, bid: Bid) -> StorageResult<()>;

    async fn get_bid(&self, id: &BidId) -> StorageResult<Option<Bid>>;
}

/// Storage interface for contract aggregates.
#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Insert a contract and all its milestones in one transaction.
    ///
    /// Enforces at most one contract per bid (`Conflict`) and flips the
    /// project to `InProgress` in the same transaction.
    async fn create_contract(
        &self,
        contract: Contract,
        milestones: Vec<Milestone>,
    ) -> StorageResult<()>;

    async fn get_contract(&self, id: &ContractId) -> StorageResult<Option<Contract>>;

    async fn find_contract_by_bid(&self, bid_id: &BidId) -> StorageResult<Option<Contract>>;

    /// List contracts newest-first.
    async fn list_contracts(&self, window: QueryWindow) -> StorageResult<Vec<Contract>>;

    /// Update title/terms while the stage still equals `expected_stage`.
    async fn set_contract_terms(
        &self,
        id: &ContractId,
        expected_stage: ContractStage,
        title: Option<String>,
        terms: Option<String>,
        at: DateTime<Utc>,
    ) -> StorageResult<Contract>;

    /// Optimistic stage compare-and-set with state-entry effects applied in
    /// the same transaction: entering `Approval` sets `terms_accepted`;
    /// entering `Completed` stamps `end_date` and flips the project to
    /// `Completed`. `Cancelled` is rejected here — use
    /// [`ContractStore::cancel_contract`] so open milestones are closed too.
    async fn transition_contract_stage(
        &self,
        id: &ContractId,
        expected_from: ContractStage,
        to: ContractStage,
        at: DateTime<Utc>,
    ) -> StorageResult<Contract>;

    /// Cancel a contract atomically: stage -> `Cancelled`, every
    /// non-terminal milestone -> `Cancelled`, the project reopens, and the
    /// given notifications are appended.
    async fn cancel_contract(
        &self,
        id: &ContractId,
        expected_from: ContractStage,
        at: DateTime<Utc>,
        notifications: Vec<Notification>,
    ) -> StorageResult<Contract>;
}

/// Storage interface for milestones and their progress trail.
#[async_trait]
pub trait MilestoneStore: Send + Sync {
    async fn get_milestone(&self, id: &MilestoneId) -> StorageResult<Option<Milestone>>;

    /// Milestones of a contract in creation order.
    async fn list_milestones(&self, contract_id: &ContractId) -> StorageResult<Vec<Milestone>>;

    /// Apply a client detail edit while the status still equals
    /// `expected_status`. An amount change rebalances the owning contract's
    /// total by the same delta inside the transaction, preserving the sum
    /// invariant.
    async fn update_milestone_details(
        &self,
        id: &MilestoneId,
        expected_status: MilestoneStatus,
        edit: MilestoneEdit,
        at: DateTime<Utc>,
    ) -> StorageResult<Milestone>;

    /// Optimistic status compare-and-set, appending the progress update (and
    /// optional notification) atomically. Entering `InProgress` stamps the
    /// contract's `start_date` if unset. `PaymentRequested` and `Paid` are
    /// rejected here — they are written through
    /// [`PaymentStore::request_payment`] / [`PaymentStore::settle_payment`].
    async fn transition_milestone_status(
        &self,
        id: &MilestoneId,
        expected_from: MilestoneStatus,
        to: MilestoneStatus,
        at: DateTime<Utc>,
        progress: ProgressUpdate,
        notification: Option<Notification>,
    ) -> StorageResult<Milestone>;

    /// Append a narration-only progress update.
    async fn append_progress_update(&self, update: ProgressUpdate) -> StorageResult<()>;

    /// Progress updates for a milestone, oldest first.
    async fn list_progress_updates(
        &self,
        milestone_id: &MilestoneId,
    ) -> StorageResult<Vec<ProgressUpdate>>;
}

/// Storage interface for escrow payments.
///
/// [`PaymentStore::request_payment`] is the sole creation point of a
/// Payment; the remaining operations encode the legal payment edges by name.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Atomically: milestone `Completed` -> `PaymentRequested`, insert the
    /// payment (must be `Pending`), append the progress update and the
    /// client notification. A milestone that already left `Completed` fails
    /// with `Conflict`, which is the guard against duplicate payments.
    async fn request_payment(
        &self,
        milestone_id: &MilestoneId,
        payment: Payment,
        progress: ProgressUpdate,
        notification: Notification,
        at: DateTime<Utc>,
    ) -> StorageResult<(Milestone, Payment)>;

    async fn get_payment(&self, id: &PaymentId) -> StorageResult<Option<Payment>>;

    /// Latest payment for a milestone, if any.
    async fn find_payment_by_milestone(
        &self,
        milestone_id: &MilestoneId,
    ) -> StorageResult<Option<Payment>>;

    /// Payment whose gateway hold ("payment intent") matches, if any.
    async fn find_payment_by_intent(&self, hold_id: &HoldId) -> StorageResult<Option<Payment>>;

    /// Payments of a contract, newest first.
    async fn list_payments(&self, contract_id: &ContractId) -> StorageResult<Vec<Payment>>;

    /// `Pending` -> `Processing`, recording the gateway hold id.
    async fn mark_payment_processing(
        &self,
        id: &PaymentId,
        hold_id: HoldId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment>;

    /// Atomically settle: payment `Processing` -> `Completed`
    /// (`completed_at = at`), its milestone -> `Paid`, and the freelancer
    /// notification appended. A payment that is not `Processing` fails with
    /// `Conflict`; callers treat an already-`Completed` payment as a no-op
    /// before reaching this write.
    async fn settle_payment(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
        notification: Notification,
    ) -> StorageResult<Payment>;

    /// `Processing` or `Completed` -> `Refunded`. Refunded is final.
    async fn mark_payment_refunded(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment>;

    /// `Pending` -> `Failed` (cancelled before any hold was created).
    async fn mark_payment_failed(&self, id: &PaymentId, at: DateTime<Utc>)
        -> StorageResult<Payment>;
}

/// Storage interface for notification records.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn append_notification(&self, notification: Notification) -> StorageResult<()>;

    /// Notifications for a recipient, newest first.
    async fn list_notifications(
        &self,
        recipient: &UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Notification>>;
}

/// Unified ledger bundle used by the lifecycle engines.
pub trait LedgerStore:
    DirectoryStore + ContractStore + MilestoneStore + PaymentStore + NotificationStore + Send + Sync
{
}

impl<T> LedgerStore for T where
    T: DirectoryStore
        + ContractStore
        + MilestoneStore
        + PaymentStore
        + NotificationStore
        + Send
        + Sync
{
}
