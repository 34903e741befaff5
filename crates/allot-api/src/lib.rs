//! allot-api
//!
//! Read-only HTTP API over the persisted state: capacity, domain and
//! project reports. All writes happen through the collector loops; this
//! crate only serves what the Store already knows.

pub mod error;
pub mod routes;
pub mod state;

use axum::http::HeaderValue;
use axum::middleware as axum_mw;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = if state.api.cors_allowed_origins.is_empty() {
        CorsLayer::new()
    } else if state.api.cors_allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .api
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/healthz", get(routes::health::healthz))
        .route("/v1/clusters/current", get(routes::clusters::get_cluster))
        .route("/v1/domains", get(routes::domains::list_domains))
        .route("/v1/domains/{uuid}", get(routes::domains::get_domain))
        .route("/v1/projects/{uuid}", get(routes::projects::get_project))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            state::log_requests,
        ))
        .layer(cors)
        .with_state(state)
}

/// Bind the configured address and serve until the process terminates.
pub async fn serve(state: AppState) -> Result<(), ApiError> {
    let listen = state.api.listen.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
