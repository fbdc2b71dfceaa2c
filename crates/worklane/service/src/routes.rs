//! REST routes over the lifecycle engine.
//!
//! Identity resolution is out of scope for the engine; the deployment in
//! front of this service authenticates callers and forwards the resolved
//! principal in `x-worklane-user` / `x-worklane-role` headers.

use crate::error::{ApiError, AuthError};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{async_trait, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use worklane_engine::{
    ContractAggregate, ContractEngine, CreateContract, EscrowReconciler, MilestoneEngine,
    TermsUpdate,
};
use worklane_escrow::HoldOutcome;
use worklane_storage::{LedgerStore, NotificationStore, QueryWindow};
use worklane_types::{
    BidId, Contract, ContractId, ContractStage, HoldId, Milestone, MilestoneDraft, MilestoneEdit,
    MilestoneId, MilestoneStatus, Notification, Payment, Principal, Role,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub contracts: Arc<ContractEngine>,
    pub milestones: Arc<MilestoneEngine>,
    pub escrow: Arc<EscrowReconciler>,
    pub store: Arc<dyn LedgerStore>,
}

pub fn router(state: AppState, enable_cors: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/v1/contracts", post(create_contract))
        .route("/api/v1/contracts/:id", get(get_contract))
        .route("/api/v1/contracts/:id/terms", patch(update_terms))
        .route("/api/v1/contracts/:id/stage", post(advance_stage))
        .route("/api/v1/contracts/:id/escrow/refund", post(refund_escrow))
        .route(
            "/api/v1/contracts/:id/escrow/:milestone_id/fund",
            post(fund_escrow),
        )
        .route(
            "/api/v1/contracts/:id/escrow/:milestone_id/release",
            post(release_escrow),
        )
        .route("/api/v1/milestones/:id/progress", post(record_progress))
        .route("/api/v1/milestones/:id", patch(update_milestone))
        .route("/api/v1/notifications", get(list_notifications))
        .route("/webhooks/escrow", post(escrow_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Principal forwarded by the authenticating layer.
pub struct Caller(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = header_str(parts, "x-worklane-user")?;
        let role = match header_str(parts, "x-worklane-role")?.as_str() {
            "client" => Role::Client,
            "freelancer" => Role::Freelancer,
            "admin" => Role::Admin,
            other => {
                return Err(AuthError(format!("unknown role `{other}`")));
            }
        };
        Ok(Caller(Principal::new(user, role)))
    }
}

fn header_str(parts: &Parts, name: &str) -> Result<String, AuthError> {
    let value = parts
        .headers
        .get(name)
        .ok_or_else(|| AuthError(format!("missing {name} header")))?;
    let value = value
        .to_str()
        .map_err(|_| AuthError(format!("invalid {name} header")))?;
    if value.is_empty() {
        return Err(AuthError(format!("empty {name} header")));
    }
    Ok(value.to_string())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "worklaned",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct CreateContractRequest {
    bid_id: String,
    title: String,
    terms: String,
    amount: f64,
    milestones: Vec<MilestoneDraft>,
}

#[derive(Debug, Serialize)]
struct ContractResponse {
    contract: Contract,
    milestones: Vec<Milestone>,
}

impl From<ContractAggregate> for ContractResponse {
    fn from(value: ContractAggregate) -> Self {
        Self {
            contract: value.contract,
            milestones: value.milestones,
        }
    }
}

async fn create_contract(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Json(request): Json<CreateContractRequest>,
) -> Result<(StatusCode, Json<ContractResponse>), ApiError> {
    let aggregate = state
        .contracts
        .create(
            &principal,
            CreateContract {
                bid_id: BidId::new(request.bid_id),
                title: request.title,
                terms: request.terms,
                amount: request.amount,
                milestones: request.milestones,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(aggregate.into())))
}

async fn get_contract(
    State(state): State<AppState>,
    Caller(_principal): Caller,
    Path(id): Path<String>,
) -> Result<Json<ContractResponse>, ApiError> {
    let aggregate = state.contracts.get(&ContractId::new(id)).await?;
    Ok(Json(aggregate.into()))
}

#[derive(Debug, Deserialize)]
struct TermsRequest {
    title: Option<String>,
    terms: Option<String>,
}

async fn update_terms(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Json(request): Json<TermsRequest>,
) -> Result<Json<Contract>, ApiError> {
    let contract = state
        .contracts
        .update_terms(
            &principal,
            &ContractId::new(id),
            TermsUpdate {
                title: request.title,
                terms: request.terms,
            },
        )
        .await?;
    Ok(Json(contract))
}

#[derive(Debug, Deserialize)]
struct StageRequest {
    target: ContractStage,
}

async fn advance_stage(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Json(request): Json<StageRequest>,
) -> Result<Json<Contract>, ApiError> {
    let contract = state
        .contracts
        .advance_stage(&principal, &ContractId::new(id), request.target)
        .await?;
    Ok(Json(contract))
}

#[derive(Debug, Deserialize)]
struct ProgressRequest {
    description: String,
    target_status: Option<MilestoneStatus>,
}

async fn record_progress(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Json(request): Json<ProgressRequest>,
) -> Result<Json<Milestone>, ApiError> {
    let milestone = state
        .milestones
        .record_progress(
            &principal,
            &MilestoneId::new(id),
            request.description,
            request.target_status,
        )
        .await?;
    Ok(Json(milestone))
}

async fn update_milestone(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Path(id): Path<String>,
    Json(edit): Json<MilestoneEdit>,
) -> Result<Json<Milestone>, ApiError> {
    let milestone = state
        .milestones
        .update_details(&principal, &MilestoneId::new(id), edit)
        .await?;
    Ok(Json(milestone))
}

#[derive(Debug, Serialize)]
struct FundResponse {
    payment: Payment,
    client_secret: String,
}

async fn fund_escrow(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Path((id, milestone_id)): Path<(String, String)>,
) -> Result<Json<FundResponse>, ApiError> {
    let funding = state
        .escrow
        .fund_escrow(
            &principal,
            &ContractId::new(id),
            &MilestoneId::new(milestone_id),
        )
        .await?;
    Ok(Json(FundResponse {
        payment: funding.payment,
        client_secret: funding.client_secret,
    }))
}

async fn release_escrow(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Path((id, milestone_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .escrow
        .release_escrow(
            &principal,
            &ContractId::new(id),
            &MilestoneId::new(milestone_id),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refund_escrow(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .escrow
        .refund_escrow(&principal, &ContractId::new(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct NotificationQuery {
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_notifications(
    State(state): State<AppState>,
    Caller(principal): Caller,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let notifications = state
        .store
        .list_notifications(
            &principal.id,
            QueryWindow {
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await
        .map_err(worklane_engine::EngineError::from)?;
    Ok(Json(notifications))
}

#[derive(Debug, Deserialize)]
struct EscrowEvent {
    hold_id: String,
    outcome: HoldOutcome,
}

/// Inbound gateway event channel. Delivery is at-least-once; the reconciler
/// is idempotent. Orphan events are acknowledged so the gateway stops
/// retrying them.
async fn escrow_webhook(
    State(state): State<AppState>,
    Json(event): Json<EscrowEvent>,
) -> Result<StatusCode, ApiError> {
    match event.outcome {
        HoldOutcome::Succeeded => {
            match state
                .escrow
                .on_hold_succeeded(&HoldId::new(event.hold_id))
                .await
            {
                Ok(()) => Ok(StatusCode::NO_CONTENT),
                Err(worklane_engine::EngineError::OrphanEvent(_)) => Ok(StatusCode::ACCEPTED),
                Err(err) => Err(err.into()),
            }
        }
        outcome => {
            tracing::info!(hold_id = %event.hold_id, ?outcome, "ignoring non-success escrow event");
            Ok(StatusCode::ACCEPTED)
        }
    }
}
