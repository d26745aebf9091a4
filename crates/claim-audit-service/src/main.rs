use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use claim_audit_api::{ClaimAuditApi, MigrateResult, API_CONTRACT_VERSION};
use claim_audit_core::{
    AppliedMovement, ArchivePassSummary, AuditError, Denial, DenialDraft, DenialId,
    MovementCandidate, Record, RecordAggregate, RecordDraft, RecordId,
};
use claim_audit_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ClaimAuditApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    retryable: bool,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "claim-audit-service")]
#[command(about = "Local HTTP boundary for the claim audit core")]
struct Args {
    #[arg(long, default_value = "./claim_audit.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl From<AuditError> for ServiceError {
    fn from(err: AuditError) -> Self {
        let status = match &err {
            AuditError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AuditError::Sequence { .. } => StatusCode::CONFLICT,
            AuditError::NotFound(_) => StatusCode::NOT_FOUND,
            AuditError::Transaction(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AuditError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_string(),
            retryable: err.is_retryable(),
            status,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/records", post(record_create).get(record_list))
        .route("/v1/records/:external_number", get(record_show))
        .route("/v1/records/:record_id/movements", post(movement_propose))
        .route("/v1/records/:record_id/denials", post(denial_add).get(denial_list))
        .route("/v1/denials/:denial_id/remove", post(denial_remove))
        .route("/v1/archive/run", post(archive_run))
        .route("/v1/archive/:external_number", get(archive_lookup))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { api: ClaimAuditApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("listening on {}", args.bind);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn record_create(
    State(state): State<ServiceState>,
    Json(draft): Json<RecordDraft>,
) -> Result<Json<ServiceEnvelope<Record>>, ServiceError> {
    let record = state.api.create_record(&draft)?;
    Ok(Json(envelope(record)))
}

async fn record_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Record>>>, ServiceError> {
    let records = state.api.list_records()?;
    Ok(Json(envelope(records)))
}

async fn record_show(
    State(state): State<ServiceState>,
    Path(external_number): Path<String>,
) -> Result<Json<ServiceEnvelope<RecordAggregate>>, ServiceError> {
    let aggregate = state.api.lookup_record(&external_number)?;
    Ok(Json(envelope(aggregate)))
}

async fn movement_propose(
    State(state): State<ServiceState>,
    Path(record_id): Path<i64>,
    Json(candidate): Json<MovementCandidate>,
) -> Result<Json<ServiceEnvelope<AppliedMovement>>, ServiceError> {
    let applied = state.api.propose_movement(RecordId(record_id), &candidate)?;
    Ok(Json(envelope(applied)))
}

async fn denial_add(
    State(state): State<ServiceState>,
    Path(record_id): Path<i64>,
    Json(draft): Json<DenialDraft>,
) -> Result<Json<ServiceEnvelope<Denial>>, ServiceError> {
    let denial = state.api.add_denial(RecordId(record_id), &draft)?;
    Ok(Json(envelope(denial)))
}

async fn denial_list(
    State(state): State<ServiceState>,
    Path(record_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Vec<Denial>>>, ServiceError> {
    let denials = state.api.list_active_denials(RecordId(record_id))?;
    Ok(Json(envelope(denials)))
}

async fn denial_remove(
    State(state): State<ServiceState>,
    Path(denial_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Denial>>, ServiceError> {
    let denial = state.api.remove_denial(DenialId(denial_id))?;
    Ok(Json(envelope(denial)))
}

async fn archive_run(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ArchivePassSummary>>, ServiceError> {
    let summary = state.api.run_archival_pass()?;
    Ok(Json(envelope(summary)))
}

async fn archive_lookup(
    State(state): State<ServiceState>,
    Path(external_number): Path<String>,
) -> Result<Json<ServiceEnvelope<RecordAggregate>>, ServiceError> {
    let aggregate = state.api.lookup_archived(&external_number)?;
    Ok(Json(envelope(aggregate)))
}
