use crate::{
    auth::{require_admin, AuthenticatedUser},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use utoipa::ToSchema;
use webvirt_orchestrator::validation::{validate_duration, validate_resources};
use webvirt_orchestrator::{
    assign_credentials, BulkProvisioner, BulkRequest, Operation, PersonName, TenantCredentials,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/admin/bulk", post(bulk_import))
        .route("/api/v1/admin/operations", get(list_operations))
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct BulkImportRequest {
    pub people: Vec<PersonName>,
    pub core_count: i64,
    pub memory: i64,
    /// Minutes until every VM in the batch expires; 0 keeps them until deleted.
    pub duration: i64,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct BulkImportResponse {
    pub tenants: Vec<TenantCredentials>,
}

#[derive(Debug, Deserialize)]
pub struct OperationsQuery {
    vm_name: Option<String>,
}

/// Assigns credentials up front and provisions the batch in the background.
///
/// The caller gets the usernames and passwords immediately; per-tenant
/// progress lands in the operation journal.
#[utoipa::path(
    post,
    path = "/api/v1/admin/bulk",
    tag = "admin",
    request_body = BulkImportRequest,
    responses(
        (status = 202, description = "Batch accepted", body = BulkImportResponse),
        (status = 403, description = "Caller is not the administrator"),
        (status = 422, description = "Invalid batch")
    )
)]
pub async fn bulk_import(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Json(req): Json<BulkImportRequest>,
) -> ApiResult<(StatusCode, Json<BulkImportResponse>)> {
    require_admin(&state, &user)?;

    if req.people.is_empty() {
        return Err(ApiError::Unprocessable(
            "at least one person is required".to_string(),
        ));
    }
    validate_resources(req.core_count, req.memory)?;
    validate_duration(req.duration)?;

    let tenants = assign_credentials(
        state.orchestrator.directory().as_ref(),
        &req.people,
        state.password_length,
    )
    .await?;

    let request = BulkRequest {
        tenants: tenants.clone(),
        core_count: req.core_count,
        memory: req.memory,
        duration: req.duration,
        home_prefix: state.home_prefix.clone(),
    };
    let provisioner = BulkProvisioner::new(state.orchestrator.clone());

    info!(admin = %user.username, tenants = tenants.len(), "Bulk import accepted");
    tokio::spawn(async move {
        match provisioner.run(&request).await {
            Ok(report) => match report.failed {
                Some(failure) => warn!(
                    created = report.created.len(),
                    skipped = report.skipped,
                    username = %failure.username,
                    error = %failure.error,
                    "Bulk import stopped early"
                ),
                None => info!(created = report.created.len(), "Bulk import finished"),
            },
            Err(e) => error!(error = %e, "Bulk import aborted"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(BulkImportResponse { tenants })))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/operations",
    tag = "admin",
    params(("vm_name" = Option<String>, Query, description = "Only operations on this VM")),
    responses(
        (status = 200, description = "Journal entries, newest first", body = [Operation]),
        (status = 403, description = "Caller is not the administrator")
    )
)]
pub async fn list_operations(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Query(query): Query<OperationsQuery>,
) -> ApiResult<Json<Vec<Operation>>> {
    require_admin(&state, &user)?;

    let operations = state
        .orchestrator
        .journal()
        .list(query.vm_name.as_deref())
        .await?;

    Ok(Json(operations))
}
