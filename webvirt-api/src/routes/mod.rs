pub mod admin;
pub mod health;
pub mod session;
pub mod vms;

use crate::{api_docs::ApiDoc, auth::auth_middleware, state::AppState};
use axum::{middleware, routing::get, Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;

pub fn create_app(state: AppState) -> Router {
    // Allow CORS for the web console served from another origin
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(health::routes())
        .merge(session::routes())
        .route("/api-docs/openapi.json", get(openapi_spec))
        .merge(
            vms::routes()
                .merge(admin::routes())
                .layer(middleware::from_fn(auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
