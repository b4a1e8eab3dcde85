use crate::error::ApiError;
use crate::state::AppState;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub username: String,
}

/// Auth middleware - trusts the principal set by the fronting proxy
///
/// The proxy authenticates the session and forwards the username in
/// `x-webvirt-user`; `x-forwarded-user` (oauth2-proxy) and `x-user` are
/// accepted in that order after it. A missing or blank header is a 401.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let username = req
        .headers()
        .get("x-webvirt-user")
        .or_else(|| req.headers().get("x-forwarded-user"))
        .or_else(|| req.headers().get("x-user"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let username = username.ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthenticatedUser { username });

    Ok(next.run(req).await)
}

/// Rejects anyone but the configured admin principal with a 403.
pub fn require_admin(state: &AppState, user: &AuthenticatedUser) -> Result<(), ApiError> {
    if user.username != state.admin_user {
        return Err(ApiError::Forbidden(format!(
            "Access denied: {} is not an administrator",
            user.username
        )));
    }

    Ok(())
}
