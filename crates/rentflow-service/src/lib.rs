#![deny(unsafe_code)]

pub mod config;
pub mod scheduler;

use crate::config::DaemonConfig;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rentflow_adapters::build_registry;
use rentflow_core::{
    ActivationSink, CurrencyUnit, Initiation, Lease, LeaseTerms, LeaseVerification, LedgerEntry,
    LedgerEntryKind, PartyRole, PaymentObligation, RentflowError, SettlementAttempt,
    SettlementEngine, SignOutcome, SignatureProof, SweepReport,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<SettlementEngine>,
}

impl ServiceState {
    pub async fn bootstrap(
        config: &DaemonConfig,
        sink: Arc<dyn ActivationSink>,
    ) -> Result<Self, ServiceError> {
        let rails = build_registry(&config.rail)?;
        let engine = SettlementEngine::bootstrap(
            config.settlement.clone(),
            &config.storage,
            rails,
            sink,
        )
        .await?;
        tracing::info!(
            rail = config.rail.label(),
            storage = config.storage.label(),
            "settlement engine ready"
        );
        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

pub fn build_router(state: ServiceState, enable_cors: bool) -> Router {
    let router = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/leases", post(issue_lease))
        .route("/v1/leases/:lease_id", get(get_lease))
        .route("/v1/leases/:lease_id/sign", post(sign_lease))
        .route("/v1/leases/:lease_id/withdraw", post(withdraw_lease))
        .route("/v1/leases/:lease_id/terminate", post(terminate_lease))
        .route("/v1/leases/:lease_id/complete", post(complete_lease))
        .route("/v1/leases/:lease_id/verify", get(verify_lease))
        .route("/v1/leases/:lease_id/obligations", get(list_obligations))
        .route(
            "/v1/leases/:lease_id/obligations/recurring",
            post(generate_recurring),
        )
        .route("/v1/obligations/:obligation_id", get(get_obligation))
        .route("/v1/obligations/:obligation_id/settle", post(settle_obligation))
        .route("/v1/obligations/:obligation_id/replace", post(replace_obligation))
        .route("/v1/reconcile", post(reconcile))
        .route("/v1/ledger/entries", get(list_ledger_entries))
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };
    router.with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] RentflowError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] RentflowError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn core_status(err: &RentflowError) -> StatusCode {
    match err {
        RentflowError::Validation(_) => StatusCode::BAD_REQUEST,
        RentflowError::InvalidProof(_) => StatusCode::FORBIDDEN,
        RentflowError::LeaseNotFound(_) | RentflowError::ObligationNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RentflowError::DuplicateSignature { .. }
        | RentflowError::InvalidState(_)
        | RentflowError::SubmissionConflict { .. } => StatusCode::CONFLICT,
        RentflowError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
        RentflowError::Rail { .. } => StatusCode::BAD_GATEWAY,
        RentflowError::RailUnavailable { .. } => StatusCode::GATEWAY_TIMEOUT,
        RentflowError::Storage(_) | RentflowError::Ledger(_) | RentflowError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Http { status, message } => (status, message),
            ApiError::Core(err) => {
                let status = core_status(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "request failed");
                }
                (status, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
    ledger_backend: &'static str,
    ledger_verified: bool,
    rail: Option<String>,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "rentflowd",
        store_backend: state.engine.store_backend(),
        ledger_backend: state.engine.ledger_backend().await,
        ledger_verified: state.engine.verify_ledger_chain().await,
        rail: state.engine.active_rail().map(str::to_string),
    })
}

/// Lease terms as posted by the CRUD layer; currency falls back to the
/// configured default.
#[derive(Debug, Clone, Deserialize)]
struct IssueLeaseRequest {
    lease_id: String,
    property_id: String,
    landlord_id: String,
    tenant_id: String,
    monthly_amount_minor: i64,
    deposit_amount_minor: i64,
    currency: Option<CurrencyUnit>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

async fn issue_lease(
    State(state): State<ServiceState>,
    Json(request): Json<IssueLeaseRequest>,
) -> Result<(StatusCode, Json<Lease>), ApiError> {
    let terms = LeaseTerms {
        lease_id: request.lease_id,
        property_id: request.property_id,
        landlord_id: request.landlord_id,
        tenant_id: request.tenant_id,
        monthly_amount_minor: request.monthly_amount_minor,
        deposit_amount_minor: request.deposit_amount_minor,
        currency: request
            .currency
            .unwrap_or_else(|| state.engine.config().currency.clone()),
        start_date: request.start_date,
        end_date: request.end_date,
    };
    let lease = state.engine.issue_lease(terms).await?;
    Ok((StatusCode::CREATED, Json(lease)))
}

async fn get_lease(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
) -> Result<Json<Lease>, ApiError> {
    Ok(Json(state.engine.lease(&lease_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct SignRequest {
    role: PartyRole,
    proof: SignatureProof,
}

async fn sign_lease(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignOutcome>, ApiError> {
    Ok(Json(
        state
            .engine
            .sign(&lease_id, request.role, request.proof)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ReasonRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn withdraw_lease(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<Lease>, ApiError> {
    let reason = request.reason.as_deref().unwrap_or("withdrawn");
    Ok(Json(state.engine.withdraw(&lease_id, reason).await?))
}

async fn terminate_lease(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<Lease>, ApiError> {
    let reason = request.reason.as_deref().unwrap_or("terminated");
    Ok(Json(state.engine.terminate(&lease_id, reason).await?))
}

async fn complete_lease(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
) -> Result<Json<Lease>, ApiError> {
    Ok(Json(state.engine.complete(&lease_id).await?))
}

async fn verify_lease(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
) -> Result<Json<LeaseVerification>, ApiError> {
    Ok(Json(state.engine.verify(&lease_id).await?))
}

async fn list_obligations(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
) -> Result<Json<Vec<PaymentObligation>>, ApiError> {
    Ok(Json(state.engine.obligations_for_lease(&lease_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct RecurringRequest {
    period: u32,
}

async fn generate_recurring(
    State(state): State<ServiceState>,
    Path(lease_id): Path<String>,
    Json(request): Json<RecurringRequest>,
) -> Result<Json<PaymentObligation>, ApiError> {
    Ok(Json(
        state
            .engine
            .generate_recurring(&lease_id, request.period)
            .await?,
    ))
}

async fn get_obligation(
    State(state): State<ServiceState>,
    Path(obligation_id): Path<String>,
) -> Result<Json<PaymentObligation>, ApiError> {
    Ok(Json(state.engine.obligation(&obligation_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct SettleRequest {
    source_wallet: String,
    destination_wallet: String,
    initiation: Initiation,
}

async fn settle_obligation(
    State(state): State<ServiceState>,
    Path(obligation_id): Path<String>,
    Json(request): Json<SettleRequest>,
) -> Result<Json<SettlementAttempt>, ApiError> {
    Ok(Json(
        state
            .engine
            .settle(
                &obligation_id,
                &request.source_wallet,
                &request.destination_wallet,
                request.initiation,
            )
            .await?,
    ))
}

async fn replace_obligation(
    State(state): State<ServiceState>,
    Path(obligation_id): Path<String>,
) -> Result<(StatusCode, Json<PaymentObligation>), ApiError> {
    let replacement = state.engine.replace_failed(&obligation_id).await?;
    Ok((StatusCode::CREATED, Json(replacement)))
}

async fn reconcile(State(state): State<ServiceState>) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.engine.reconcile().await?))
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerEntriesQuery {
    lease_id: Option<String>,
    obligation_id: Option<String>,
    kind: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LedgerEntriesResponse {
    backend: &'static str,
    total: usize,
    returned: usize,
    items: Vec<LedgerEntry>,
}

fn parse_kind_filter(kind: Option<&str>) -> Result<Option<LedgerEntryKind>, ApiError> {
    kind.map(|value| {
        LedgerEntryKind::parse(&value.to_ascii_lowercase()).map_err(|_| {
            ApiError::bad_request(format!(
                "invalid kind '{value}'; expected one of: decision, audit, outcome"
            ))
        })
    })
    .transpose()
}

async fn list_ledger_entries(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerEntriesQuery>,
) -> Result<Json<LedgerEntriesResponse>, ApiError> {
    let kind_filter = parse_kind_filter(query.kind.as_deref())?;

    let mut entries = match query.lease_id.as_deref() {
        Some(lease_id) => state.engine.ledger_entries_for_lease(lease_id).await,
        None => state.engine.ledger_entries().await,
    };

    if let Some(obligation_id) = query.obligation_id.as_deref() {
        entries.retain(|entry| entry.obligation_id.as_deref() == Some(obligation_id));
    }

    if let Some(kind) = kind_filter {
        entries.retain(|entry| entry.kind == kind);
    }

    let order = query
        .order
        .as_deref()
        .unwrap_or("desc")
        .to_ascii_lowercase();
    if order == "desc" {
        entries.reverse();
    } else if order != "asc" {
        return Err(ApiError::bad_request(format!(
            "invalid order '{order}'; expected asc or desc"
        )));
    }

    let total = entries.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(100).min(1000);
    let items = entries
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect::<Vec<_>>();
    let returned = items.len();

    Ok(Json(LedgerEntriesResponse {
        backend: state.engine.ledger_backend().await,
        total,
        returned,
        items,
    }))
}
