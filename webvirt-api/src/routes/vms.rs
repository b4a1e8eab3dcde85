use crate::{auth::AuthenticatedUser, error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use serde::Serialize;
use utoipa::ToSchema;
use webvirt_orchestrator::{UpdateVmRequest, VmRecord, VmSpec};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/vms", get(list_vms).post(create_vm))
        .route("/api/v1/vms/access", get(list_access))
        .route("/api/v1/vms/{id}", patch(update_vm).delete(delete_vm))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AccessGroups {
    pub username: String,
    /// Names of the VMs whose consoles the caller may open.
    pub groups: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/vms",
    tag = "vms",
    responses((status = 200, description = "VMs owned by the caller", body = [VmRecord]))
)]
pub async fn list_vms(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<Vec<VmRecord>>> {
    let vms = state.orchestrator.list_vms(&user.username).await?;

    Ok(Json(vms))
}

#[utoipa::path(
    post,
    path = "/api/v1/vms",
    tag = "vms",
    request_body = VmSpec,
    responses(
        (status = 201, description = "VM provisioned", body = VmRecord),
        (status = 422, description = "Invalid specification"),
        (status = 500, description = "Provisioning failed and was rolled back")
    )
)]
pub async fn create_vm(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Json(spec): Json<VmSpec>,
) -> ApiResult<(StatusCode, Json<VmRecord>)> {
    let record = state.orchestrator.create_vm(&user.username, &spec).await?;

    Ok((StatusCode::CREATED, Json(record)))
}

#[utoipa::path(
    patch,
    path = "/api/v1/vms/{id}",
    tag = "vms",
    params(("id" = i64, Path, description = "Ledger record id")),
    request_body = UpdateVmRequest,
    responses(
        (status = 200, description = "VM resized", body = VmRecord),
        (status = 404, description = "No such VM for this caller"),
        (status = 422, description = "Invalid resources")
    )
)]
pub async fn update_vm(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateVmRequest>,
) -> ApiResult<Json<VmRecord>> {
    let record = state.orchestrator.update_vm(&user.username, id, &req).await?;

    Ok(Json(record))
}

#[utoipa::path(
    delete,
    path = "/api/v1/vms/{id}",
    tag = "vms",
    params(("id" = i64, Path, description = "Ledger record id")),
    responses(
        (status = 200, description = "VM deleted everywhere"),
        (status = 404, description = "No such VM for this caller"),
        (status = 409, description = "VM is still running")
    )
)]
pub async fn delete_vm(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.delete_vm(&user.username, id).await?;

    Ok(Json(serde_json::json!({ "message": "VM deleted" })))
}

#[utoipa::path(
    get,
    path = "/api/v1/vms/access",
    tag = "vms",
    responses((status = 200, description = "Access groups the caller belongs to", body = AccessGroups))
)]
pub async fn list_access(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<AuthenticatedUser>,
) -> ApiResult<Json<AccessGroups>> {
    let groups = state
        .orchestrator
        .directory()
        .access_groups_for(&user.username)
        .await
        .map_err(webvirt_orchestrator::OrchestratorError::from)?;

    Ok(Json(AccessGroups {
        username: user.username,
        groups,
    }))
}
