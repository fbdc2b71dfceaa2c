//! PostgreSQL adapter for the Worklane ledger.
//!
//! The transactional source-of-truth backend. Every compound trait method
//! runs inside one `BEGIN…COMMIT` transaction; optimistic expected-state
//! checks are expressed as `WHERE … AND status = $expected` and verified via
//! `rows_affected`/`RETURNING`. Unique-constraint violations (one contract
//! per bid, one bid per freelancer per project) map to `Conflict`.

use crate::traits::{
    ContractStore, DirectoryStore, MilestoneStore, NotificationStore, PaymentStore, QueryWindow,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use worklane_types::{
    Bid, BidId, BidStatus, Contract, ContractId, ContractStage, HoldId, Milestone, MilestoneEdit,
    MilestoneId, MilestoneStatus, Notification, NotificationId, NotificationKind, Payment,
    PaymentId, PaymentStatus, ProgressUpdate, ProgressUpdateId, Project, ProjectId, ProjectStatus,
    UserId,
};

/// PostgreSQL-backed ledger adapter.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Connect to PostgreSQL and initialize the required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS worklane_projects (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                budget DOUBLE PRECISION NOT NULL,
                deadline TIMESTAMPTZ,
                skills JSONB NOT NULL,
                category TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worklane_bids (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                freelancer_id TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL,
                delivery_time_days BIGINT NOT NULL,
                cover_letter TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (project_id, freelancer_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worklane_contracts (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                freelancer_id TEXT NOT NULL,
                bid_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                terms TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL,
                stage TEXT NOT NULL,
                terms_accepted BOOLEAN NOT NULL,
                start_date TIMESTAMPTZ,
                end_date TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worklane_milestones (
                id TEXT PRIMARY KEY,
                contract_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL,
                due_date TIMESTAMPTZ,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS worklane_milestones_contract_idx
                ON worklane_milestones (contract_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worklane_progress_updates (
                id TEXT PRIMARY KEY,
                milestone_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worklane_payments (
                id TEXT PRIMARY KEY,
                contract_id TEXT NOT NULL,
                milestone_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                freelancer_id TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL,
                status TEXT NOT NULL,
                payment_intent_id TEXT,
                completed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS worklane_payments_intent_idx
                ON worklane_payments (payment_intent_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS worklane_notifications (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                contract_id TEXT,
                milestone_id TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn begin(&self) -> StorageResult<Transaction<'_, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(format!("failed to begin transaction: {e}")))
    }

    /// Distinguish a stale optimistic check from a missing record after an
    /// UPDATE matched zero rows.
    async fn contract_miss(&self, id: &ContractId, expected: ContractStage) -> StorageError {
        match self.get_contract(id).await {
            Ok(Some(found)) => StorageError::Conflict(format!(
                "contract {id} is {}, expected {expected}",
                found.stage
            )),
            Ok(None) => StorageError::NotFound(format!("contract {id} not found")),
            Err(err) => err,
        }
    }

    async fn milestone_miss(&self, id: &MilestoneId, expected: MilestoneStatus) -> StorageError {
        match self.get_milestone(id).await {
            Ok(Some(found)) => StorageError::Conflict(format!(
                "milestone {id} is {}, expected {expected}",
                found.status
            )),
            Ok(None) => StorageError::NotFound(format!("milestone {id} not found")),
            Err(err) => err,
        }
    }

    async fn payment_miss(&self, id: &PaymentId, expected: &str) -> StorageError {
        match self.get_payment(id).await {
            Ok(Some(found)) => StorageError::Conflict(format!(
                "payment {id} is {}, expected {expected}",
                found.status
            )),
            Ok(None) => StorageError::NotFound(format!("payment {id} not found")),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl DirectoryStore for PgLedger {
    async fn insert_project(&self, project: Project) -> StorageResult<()> {
        let skills = serde_json::to_value(&project.skills)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO worklane_projects
                (id, client_id, title, description, budget, deadline, skills, category, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(project.id.0)
        .bind(project.client_id.0)
        .bind(project.title)
        .bind(project.description)
        .bind(project.budget)
        .bind(project.deadline)
        .bind(skills)
        .bind(project.category)
        .bind(project_status_to_str(project.status))
        .bind(project.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> StorageResult<Option<Project>> {
        let row = sqlx::query("SELECT * FROM worklane_projects WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(project_from_row).transpose()
    }

    async fn insert_bid(&self, bid: Bid) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worklane_bids
                (id, project_id, freelancer_id, amount, delivery_time_days, cover_letter, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(bid.id.0)
        .bind(bid.project_id.0)
        .bind(bid.freelancer_id.0)
        .bind(bid.amount)
        .bind(i64::from(bid.delivery_time_days))
        .bind(bid.cover_letter)
        .bind(bid_status_to_str(bid.status))
        .bind(bid.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn get_bid(&self, id: &BidId) -> StorageResult<Option<Bid>> {
        let row = sqlx::query("SELECT * FROM worklane_bids WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(bid_from_row).transpose()
    }
}

#[async_trait]
impl ContractStore for PgLedger {
    async fn create_contract(
        &self,
        contract: Contract,
        milestones: Vec<Milestone>,
    ) -> StorageResult<()> {
        for milestone in &milestones {
            if milestone.contract_id != contract.id {
                return Err(StorageError::InvalidInput(format!(
                    "milestone {} does not belong to contract {}",
                    milestone.id, contract.id
                )));
            }
        }

        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO worklane_contracts
                (id, project_id, client_id, freelancer_id, bid_id, title, terms, amount,
                 stage, terms_accepted, start_date, end_date, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&contract.id.0)
        .bind(&contract.project_id.0)
        .bind(&contract.client_id.0)
        .bind(&contract.freelancer_id.0)
        .bind(&contract.bid_id.0)
        .bind(&contract.title)
        .bind(&contract.terms)
        .bind(contract.amount)
        .bind(contract_stage_to_str(contract.stage))
        .bind(contract.terms_accepted)
        .bind(contract.start_date)
        .bind(contract.end_date)
        .bind(contract.created_at)
        .bind(contract.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        for milestone in milestones {
            sqlx::query(
                r#"
                INSERT INTO worklane_milestones
                    (id, contract_id, project_id, title, description, amount, due_date,
                     status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(milestone.id.0)
            .bind(milestone.contract_id.0)
            .bind(milestone.project_id.0)
            .bind(milestone.title)
            .bind(milestone.description)
            .bind(milestone.amount)
            .bind(milestone.due_date)
            .bind(milestone_status_to_str(milestone.status))
            .bind(milestone.created_at)
            .bind(milestone.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_conflict)?;
        }

        let updated = sqlx::query("UPDATE worklane_projects SET status = $1 WHERE id = $2")
            .bind(project_status_to_str(ProjectStatus::InProgress))
            .bind(&contract.project_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "project {} not found",
                contract.project_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn get_contract(&self, id: &ContractId) -> StorageResult<Option<Contract>> {
        let row = sqlx::query("SELECT * FROM worklane_contracts WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(contract_from_row).transpose()
    }

    async fn find_contract_by_bid(&self, bid_id: &BidId) -> StorageResult<Option<Contract>> {
        let row = sqlx::query("SELECT * FROM worklane_contracts WHERE bid_id = $1")
            .bind(&bid_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(contract_from_row).transpose()
    }

    async fn list_contracts(&self, window: QueryWindow) -> StorageResult<Vec<Contract>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            to_i64(window.limit)?
        };
        let rows = sqlx::query(
            "SELECT * FROM worklane_contracts ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(contract_from_row).collect()
    }

    async fn set_contract_terms(
        &self,
        id: &ContractId,
        expected_stage: ContractStage,
        title: Option<String>,
        terms: Option<String>,
        at: DateTime<Utc>,
    ) -> StorageResult<Contract> {
        let row = sqlx::query(
            r#"
            UPDATE worklane_contracts
               SET title = COALESCE($1, title),
                   terms = COALESCE($2, terms),
                   updated_at = $3
             WHERE id = $4
               AND stage = $5
            RETURNING *
            "#,
        )
        .bind(title)
        .bind(terms)
        .bind(at)
        .bind(&id.0)
        .bind(contract_stage_to_str(expected_stage))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => contract_from_row(row),
            None => Err(self.contract_miss(id, expected_stage).await),
        }
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

        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE worklane_contracts
               SET stage = $1,
                   terms_accepted = CASE WHEN $1 = 'approval' THEN TRUE ELSE terms_accepted END,
                   end_date = CASE WHEN $1 = 'completed' THEN $2 ELSE end_date END,
                   updated_at = $2
             WHERE id = $3
               AND stage = $4
            RETURNING *
            "#,
        )
        .bind(contract_stage_to_str(to))
        .bind(at)
        .bind(&id.0)
        .bind(contract_stage_to_str(expected_from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Err(self.contract_miss(id, expected_from).await);
        };
        let contract = contract_from_row(row)?;

        if to == ContractStage::Completed {
            sqlx::query("UPDATE worklane_projects SET status = $1 WHERE id = $2")
                .bind(project_status_to_str(ProjectStatus::Completed))
                .bind(&contract.project_id.0)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(contract)
    }

    async fn cancel_contract(
        &self,
        id: &ContractId,
        expected_from: ContractStage,
        at: DateTime<Utc>,
        notifications: Vec<Notification>,
    ) -> StorageResult<Contract> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE worklane_contracts
               SET stage = 'cancelled', updated_at = $1
             WHERE id = $2
               AND stage = $3
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(&id.0)
        .bind(contract_stage_to_str(expected_from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Err(self.contract_miss(id, expected_from).await);
        };
        let contract = contract_from_row(row)?;

        sqlx::query(
            r#"
            UPDATE worklane_milestones
               SET status = 'cancelled', updated_at = $1
             WHERE contract_id = $2
               AND status NOT IN ('paid', 'cancelled')
            "#,
        )
        .bind(at)
        .bind(&id.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        sqlx::query("UPDATE worklane_projects SET status = $1 WHERE id = $2")
            .bind(project_status_to_str(ProjectStatus::Open))
            .bind(&contract.project_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        for notification in notifications {
            insert_notification(&mut tx, notification).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(contract)
    }
}

#[async_trait]
impl MilestoneStore for PgLedger {
    async fn get_milestone(&self, id: &MilestoneId) -> StorageResult<Option<Milestone>> {
        let row = sqlx::query("SELECT * FROM worklane_milestones WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(milestone_from_row).transpose()
    }

    async fn list_milestones(&self, contract_id: &ContractId) -> StorageResult<Vec<Milestone>> {
        let rows = sqlx::query(
            "SELECT * FROM worklane_milestones WHERE contract_id = $1 ORDER BY created_at, id",
        )
        .bind(&contract_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(milestone_from_row).collect()
    }

    async fn update_milestone_details(
        &self,
        id: &MilestoneId,
        expected_status: MilestoneStatus,
        edit: MilestoneEdit,
        at: DateTime<Utc>,
    ) -> StorageResult<Milestone> {
        if matches!(edit.amount, Some(amount) if amount <= 0.0) {
            return Err(StorageError::InvalidInput(
                "milestone amount must be positive".to_string(),
            ));
        }

        let mut tx = self.begin().await?;

        // Lock the row so the amount delta is computed against the value we
        // are about to overwrite.
        let current = sqlx::query("SELECT * FROM worklane_milestones WHERE id = $1 FOR UPDATE")
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .map(milestone_from_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("milestone {id} not found")))?;
        if current.status != expected_status {
            return Err(StorageError::Conflict(format!(
                "milestone {id} is {}, expected {expected_status}",
                current.status
            )));
        }

        let row = sqlx::query(
            r#"
            UPDATE worklane_milestones
               SET title = COALESCE($1, title),
                   description = COALESCE($2, description),
                   amount = COALESCE($3, amount),
                   due_date = COALESCE($4, due_date),
                   updated_at = $5
             WHERE id = $6
            RETURNING *
            "#,
        )
        .bind(edit.title)
        .bind(edit.description)
        .bind(edit.amount)
        .bind(edit.due_date)
        .bind(at)
        .bind(&id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        let milestone = milestone_from_row(row)?;

        // Keep the contract total equal to the milestone sum.
        let amount_delta = milestone.amount - current.amount;
        if amount_delta != 0.0 {
            sqlx::query(
                "UPDATE worklane_contracts SET amount = amount + $1, updated_at = $2 WHERE id = $3",
            )
            .bind(amount_delta)
            .bind(at)
            .bind(&milestone.contract_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
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

        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE worklane_milestones
               SET status = $1, updated_at = $2
             WHERE id = $3
               AND status = $4
            RETURNING *
            "#,
        )
        .bind(milestone_status_to_str(to))
        .bind(at)
        .bind(&id.0)
        .bind(milestone_status_to_str(expected_from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Err(self.milestone_miss(id, expected_from).await);
        };
        let milestone = milestone_from_row(row)?;

        if to == MilestoneStatus::InProgress {
            // Work has begun: stamp the contract start date once.
            sqlx::query(
                r#"
                UPDATE worklane_contracts
                   SET start_date = COALESCE(start_date, $1), updated_at = $1
                 WHERE id = $2
                "#,
            )
            .bind(at)
            .bind(&milestone.contract_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        insert_progress(&mut tx, progress).await?;
        if let Some(notification) = notification {
            insert_notification(&mut tx, notification).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(milestone)
    }

    async fn append_progress_update(&self, update: ProgressUpdate) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worklane_progress_updates
                (id, milestone_id, author_id, description, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(update.id.0)
        .bind(update.milestone_id.0)
        .bind(update.author_id.0)
        .bind(update.description)
        .bind(milestone_status_to_str(update.status))
        .bind(update.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn list_progress_updates(
        &self,
        milestone_id: &MilestoneId,
    ) -> StorageResult<Vec<ProgressUpdate>> {
        let rows = sqlx::query(
            "SELECT * FROM worklane_progress_updates WHERE milestone_id = $1 ORDER BY created_at, id",
        )
        .bind(&milestone_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(progress_from_row).collect()
    }
}

#[async_trait]
impl PaymentStore for PgLedger {
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

        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE worklane_milestones
               SET status = 'payment_requested', updated_at = $1
             WHERE id = $2
               AND status = 'completed'
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(&milestone_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Err(self.milestone_miss(milestone_id, MilestoneStatus::Completed).await);
        };
        let milestone = milestone_from_row(row)?;

        sqlx::query(
            r#"
            INSERT INTO worklane_payments
                (id, contract_id, milestone_id, client_id, freelancer_id, amount,
                 status, payment_intent_id, completed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&payment.id.0)
        .bind(&payment.contract_id.0)
        .bind(&payment.milestone_id.0)
        .bind(&payment.client_id.0)
        .bind(&payment.freelancer_id.0)
        .bind(payment.amount)
        .bind(payment_status_to_str(payment.status))
        .bind(payment.payment_intent_id.as_ref().map(|h| h.0.clone()))
        .bind(payment.completed_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_conflict)?;

        insert_progress(&mut tx, progress).await?;
        insert_notification(&mut tx, notification).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok((milestone, payment))
    }

    async fn get_payment(&self, id: &PaymentId) -> StorageResult<Option<Payment>> {
        let row = sqlx::query("SELECT * FROM worklane_payments WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(payment_from_row).transpose()
    }

    async fn find_payment_by_milestone(
        &self,
        milestone_id: &MilestoneId,
    ) -> StorageResult<Option<Payment>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM worklane_payments
             WHERE milestone_id = $1
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(&milestone_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(payment_from_row).transpose()
    }

    async fn find_payment_by_intent(&self, hold_id: &HoldId) -> StorageResult<Option<Payment>> {
        let row = sqlx::query("SELECT * FROM worklane_payments WHERE payment_intent_id = $1")
            .bind(&hold_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(payment_from_row).transpose()
    }

    async fn list_payments(&self, contract_id: &ContractId) -> StorageResult<Vec<Payment>> {
        let rows = sqlx::query(
            "SELECT * FROM worklane_payments WHERE contract_id = $1 ORDER BY created_at DESC",
        )
        .bind(&contract_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(payment_from_row).collect()
    }

    async fn mark_payment_processing(
        &self,
        id: &PaymentId,
        hold_id: HoldId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment> {
        let row = sqlx::query(
            r#"
            UPDATE worklane_payments
               SET status = 'processing', payment_intent_id = $1, updated_at = $2
             WHERE id = $3
               AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(hold_id.0)
        .bind(at)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => payment_from_row(row),
            None => Err(self.payment_miss(id, "pending").await),
        }
    }

    async fn settle_payment(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
        notification: Notification,
    ) -> StorageResult<Payment> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE worklane_payments
               SET status = 'completed', completed_at = $1, updated_at = $1
             WHERE id = $2
               AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(&id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let Some(row) = row else {
            return Err(self.payment_miss(id, "processing").await);
        };
        let payment = payment_from_row(row)?;

        let updated = sqlx::query(
            r#"
            UPDATE worklane_milestones
               SET status = 'paid', updated_at = $1
             WHERE id = $2
               AND status = 'payment_requested'
            "#,
        )
        .bind(at)
        .bind(&payment.milestone_id.0)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        if updated.rows_affected() == 0 {
            return Err(StorageError::InvariantViolation(format!(
                "milestone {} is not awaiting payment",
                payment.milestone_id
            )));
        }

        insert_notification(&mut tx, notification).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(payment)
    }

    async fn mark_payment_refunded(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment> {
        let row = sqlx::query(
            r#"
            UPDATE worklane_payments
               SET status = 'refunded', updated_at = $1
             WHERE id = $2
               AND status IN ('processing', 'completed')
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => payment_from_row(row),
            None => Err(self.payment_miss(id, "processing or completed").await),
        }
    }

    async fn mark_payment_failed(
        &self,
        id: &PaymentId,
        at: DateTime<Utc>,
    ) -> StorageResult<Payment> {
        let row = sqlx::query(
            r#"
            UPDATE worklane_payments
               SET status = 'failed', updated_at = $1
             WHERE id = $2
               AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => payment_from_row(row),
            None => Err(self.payment_miss(id, "pending").await),
        }
    }
}

#[async_trait]
impl NotificationStore for PgLedger {
    async fn append_notification(&self, notification: Notification) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        insert_notification(&mut tx, notification).await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn list_notifications(
        &self,
        recipient: &UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<Notification>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            to_i64(window.limit)?
        };
        let rows = sqlx::query(
            r#"
            SELECT * FROM worklane_notifications
             WHERE recipient_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&recipient.0)
        .bind(limit)
        .bind(to_i64(window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(notification_from_row).collect()
    }
}

async fn insert_progress(
    tx: &mut Transaction<'_, Postgres>,
    update: ProgressUpdate,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO worklane_progress_updates
            (id, milestone_id, author_id, description, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(update.id.0)
    .bind(update.milestone_id.0)
    .bind(update.author_id.0)
    .bind(update.description)
    .bind(milestone_status_to_str(update.status))
    .bind(update.created_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_conflict)?;
    Ok(())
}

async fn insert_notification(
    tx: &mut Transaction<'_, Postgres>,
    notification: Notification,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO worklane_notifications
            (id, recipient_id, kind, message, contract_id, milestone_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(notification.id.0)
    .bind(notification.recipient_id.0)
    .bind(notification_kind_to_str(notification.kind))
    .bind(notification.message)
    .bind(notification.contract_id.map(|id| id.0))
    .bind(notification.milestone_id.map(|id| id.0))
    .bind(notification.created_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_conflict)?;
    Ok(())
}

fn project_from_row(row: PgRow) -> StorageResult<Project> {
    let skills: serde_json::Value = row.try_get("skills").map_err(backend)?;
    Ok(Project {
        id: ProjectId::new(row.try_get::<String, _>("id").map_err(backend)?),
        client_id: UserId::new(row.try_get::<String, _>("client_id").map_err(backend)?),
        title: row.try_get("title").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        budget: row.try_get("budget").map_err(backend)?,
        deadline: row.try_get("deadline").map_err(backend)?,
        skills: serde_json::from_value(skills)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        category: row.try_get("category").map_err(backend)?,
        status: parse_project_status(&row.try_get::<String, _>("status").map_err(backend)?)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn bid_from_row(row: PgRow) -> StorageResult<Bid> {
    let delivery: i64 = row.try_get("delivery_time_days").map_err(backend)?;
    Ok(Bid {
        id: BidId::new(row.try_get::<String, _>("id").map_err(backend)?),
        project_id: ProjectId::new(row.try_get::<String, _>("project_id").map_err(backend)?),
        freelancer_id: UserId::new(row.try_get::<String, _>("freelancer_id").map_err(backend)?),
        amount: row.try_get("amount").map_err(backend)?,
        delivery_time_days: u32::try_from(delivery)
            .map_err(|_| StorageError::Serialization("negative delivery time".to_string()))?,
        cover_letter: row.try_get("cover_letter").map_err(backend)?,
        status: parse_bid_status(&row.try_get::<String, _>("status").map_err(backend)?)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn contract_from_row(row: PgRow) -> StorageResult<Contract> {
    Ok(Contract {
        id: ContractId::new(row.try_get::<String, _>("id").map_err(backend)?),
        project_id: ProjectId::new(row.try_get::<String, _>("project_id").map_err(backend)?),
        client_id: UserId::new(row.try_get::<String, _>("client_id").map_err(backend)?),
        freelancer_id: UserId::new(row.try_get::<String, _>("freelancer_id").map_err(backend)?),
        bid_id: BidId::new(row.try_get::<String, _>("bid_id").map_err(backend)?),
        title: row.try_get("title").map_err(backend)?,
        terms: row.try_get("terms").map_err(backend)?,
        amount: row.try_get("amount").map_err(backend)?,
        stage: parse_contract_stage(&row.try_get::<String, _>("stage").map_err(backend)?)?,
        terms_accepted: row.try_get("terms_accepted").map_err(backend)?,
        start_date: row.try_get("start_date").map_err(backend)?,
        end_date: row.try_get("end_date").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn milestone_from_row(row: PgRow) -> StorageResult<Milestone> {
    Ok(Milestone {
        id: MilestoneId::new(row.try_get::<String, _>("id").map_err(backend)?),
        contract_id: ContractId::new(row.try_get::<String, _>("contract_id").map_err(backend)?),
        project_id: ProjectId::new(row.try_get::<String, _>("project_id").map_err(backend)?),
        title: row.try_get("title").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        amount: row.try_get("amount").map_err(backend)?,
        due_date: row.try_get("due_date").map_err(backend)?,
        status: parse_milestone_status(&row.try_get::<String, _>("status").map_err(backend)?)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn progress_from_row(row: PgRow) -> StorageResult<ProgressUpdate> {
    Ok(ProgressUpdate {
        id: ProgressUpdateId::new(row.try_get::<String, _>("id").map_err(backend)?),
        milestone_id: MilestoneId::new(row.try_get::<String, _>("milestone_id").map_err(backend)?),
        author_id: UserId::new(row.try_get::<String, _>("author_id").map_err(backend)?),
        description: row.try_get("description").map_err(backend)?,
        status: parse_milestone_status(&row.try_get::<String, _>("status").map_err(backend)?)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn payment_from_row(row: PgRow) -> StorageResult<Payment> {
    let intent: Option<String> = row.try_get("payment_intent_id").map_err(backend)?;
    Ok(Payment {
        id: PaymentId::new(row.try_get::<String, _>("id").map_err(backend)?),
        contract_id: ContractId::new(row.try_get::<String, _>("contract_id").map_err(backend)?),
        milestone_id: MilestoneId::new(row.try_get::<String, _>("milestone_id").map_err(backend)?),
        client_id: UserId::new(row.try_get::<String, _>("client_id").map_err(backend)?),
        freelancer_id: UserId::new(row.try_get::<String, _>("freelancer_id").map_err(backend)?),
        amount: row.try_get("amount").map_err(backend)?,
        status: parse_payment_status(&row.try_get::<String, _>("status").map_err(backend)?)?,
        payment_intent_id: intent.map(HoldId::new),
        completed_at: row.try_get("completed_at").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn notification_from_row(row: PgRow) -> StorageResult<Notification> {
    let contract_id: Option<String> = row.try_get("contract_id").map_err(backend)?;
    let milestone_id: Option<String> = row.try_get("milestone_id").map_err(backend)?;
    Ok(Notification {
        id: NotificationId::new(row.try_get::<String, _>("id").map_err(backend)?),
        recipient_id: UserId::new(row.try_get::<String, _>("recipient_id").map_err(backend)?),
        kind: parse_notification_kind(&row.try_get::<String, _>("kind").map_err(backend)?)?,
        message: row.try_get("message").map_err(backend)?,
        contract_id: contract_id.map(ContractId::new),
        milestone_id: milestone_id.map(MilestoneId::new),
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}

fn contract_stage_to_str(stage: ContractStage) -> &'static str {
    match stage {
        ContractStage::Proposal => "proposal",
        ContractStage::Approval => "approval",
        ContractStage::Payment => "payment",
        ContractStage::Review => "review",
        ContractStage::Completed => "completed",
        ContractStage::Cancelled => "cancelled",
        ContractStage::Disputed => "disputed",
    }
}

fn parse_contract_stage(raw: &str) -> StorageResult<ContractStage> {
    match raw {
        "proposal" => Ok(ContractStage::Proposal),
        "approval" => Ok(ContractStage::Approval),
        "payment" => Ok(ContractStage::Payment),
        "review" => Ok(ContractStage::Review),
        "completed" => Ok(ContractStage::Completed),
        "cancelled" => Ok(ContractStage::Cancelled),
        "disputed" => Ok(ContractStage::Disputed),
        _ => Err(StorageError::Serialization(format!(
            "unknown contract stage `{raw}`"
        ))),
    }
}

fn milestone_status_to_str(status: MilestoneStatus) -> &'static str {
    match status {
        MilestoneStatus::Pending => "pending",
        MilestoneStatus::InProgress => "in_progress",
        MilestoneStatus::Completed => "completed",
        MilestoneStatus::PaymentRequested => "payment_requested",
        MilestoneStatus::Paid => "paid",
        MilestoneStatus::Cancelled => "cancelled",
    }
}

fn parse_milestone_status(raw: &str) -> StorageResult<MilestoneStatus> {
    match raw {
        "pending" => Ok(MilestoneStatus::Pending),
        "in_progress" => Ok(MilestoneStatus::InProgress),
        "completed" => Ok(MilestoneStatus::Completed),
        "payment_requested" => Ok(MilestoneStatus::PaymentRequested),
        "paid" => Ok(MilestoneStatus::Paid),
        "cancelled" => Ok(MilestoneStatus::Cancelled),
        _ => Err(StorageError::Serialization(format!(
            "unknown milestone status `{raw}`"
        ))),
    }
}

fn payment_status_to_str(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Pending => "pending",
        PaymentStatus::Processing => "processing",
        PaymentStatus::Completed => "completed",
        PaymentStatus::Failed => "failed",
        PaymentStatus::Refunded => "refunded",
    }
}

fn parse_payment_status(raw: &str) -> StorageResult<PaymentStatus> {
    match raw {
        "pending" => Ok(PaymentStatus::Pending),
        "processing" => Ok(PaymentStatus::Processing),
        "completed" => Ok(PaymentStatus::Completed),
        "failed" => Ok(PaymentStatus::Failed),
        "refunded" => Ok(PaymentStatus::Refunded),
        _ => Err(StorageError::Serialization(format!(
            "unknown payment status `{raw}`"
        ))),
    }
}

fn project_status_to_str(status: ProjectStatus) -> &'static str {
    match status {
        ProjectStatus::Open => "open",
        ProjectStatus::InProgress => "in_progress",
        ProjectStatus::Completed => "completed",
        ProjectStatus::Cancelled => "cancelled",
    }
}

fn parse_project_status(raw: &str) -> StorageResult<ProjectStatus> {
    match raw {
        "open" => Ok(ProjectStatus::Open),
        "in_progress" => Ok(ProjectStatus::InProgress),
        "completed" => Ok(ProjectStatus::Completed),
        "cancelled" => Ok(ProjectStatus::Cancelled),
        _ => Err(StorageError::Serialization(format!(
            "unknown project status `{raw}`"
        ))),
    }
}

fn bid_status_to_str(status: BidStatus) -> &'static str {
    match status {
        BidStatus::Pending => "pending",
        BidStatus::Shortlisted => "shortlisted",
        BidStatus::Accepted => "accepted",
        BidStatus::Rejected => "rejected",
    }
}

fn parse_bid_status(raw: &str) -> StorageResult<BidStatus> {
    match raw {
        "pending" => Ok(BidStatus::Pending),
        "shortlisted" => Ok(BidStatus::Shortlisted),
        "accepted" => Ok(BidStatus::Accepted),
        "rejected" => Ok(BidStatus::Rejected),
        _ => Err(StorageError::Serialization(format!(
            "unknown bid status `{raw}`"
        ))),
    }
}

fn notification_kind_to_str(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::PaymentRequested => "payment_requested",
        NotificationKind::MilestoneCompleted => "milestone_completed",
        NotificationKind::MilestonePaid => "milestone_paid",
        NotificationKind::ContractCompleted => "contract_completed",
        NotificationKind::ContractCancelled => "contract_cancelled",
    }
}

fn parse_notification_kind(raw: &str) -> StorageResult<NotificationKind> {
    match raw {
        "payment_requested" => Ok(NotificationKind::PaymentRequested),
        "milestone_completed" => Ok(NotificationKind::MilestoneCompleted),
        "milestone_paid" => Ok(NotificationKind::MilestonePaid),
        "contract_completed" => Ok(NotificationKind::ContractCompleted),
        "contract_cancelled" => Ok(NotificationKind::ContractCancelled),
        _ => Err(StorageError::Serialization(format!(
            "unknown notification kind `{raw}`"
        ))),
    }
}
