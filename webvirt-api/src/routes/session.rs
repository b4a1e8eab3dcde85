use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use webvirt_orchestrator::OrchestratorError;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/auth/verify", post(verify_credentials))
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct CredentialsResponse {
    pub username: String,
    pub valid: bool,
}

/// Checks a username and password against the directory.
#[utoipa::path(
    post,
    path = "/api/v1/auth/verify",
    tag = "auth",
    request_body = CredentialsRequest,
    responses(
        (status = 200, description = "Credentials are valid", body = CredentialsResponse),
        (status = 401, description = "Wrong username or password")
    )
)]
pub async fn verify_credentials(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> ApiResult<Json<CredentialsResponse>> {
    let valid = state
        .orchestrator
        .directory()
        .verify_credentials(&req.username, &req.password)
        .await
        .map_err(OrchestratorError::from)?;

    if !valid {
        return Err(ApiError::Unauthorized("invalid credentials".to_string()));
    }

    Ok(Json(CredentialsResponse {
        username: req.username,
        valid,
    }))
}
