use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use allot_core::config::ApiConfig;
use allot_store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cluster_id: String,
    pub api: ApiConfig,
}

/// Access logging, skipping the configured exception paths (health checks
/// and the like).
pub async fn log_requests(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    let skip = state.api.request_log_exceptions.iter().any(|e| e == &path);

    let response = next.run(request).await;
    if !skip {
        tracing::info!(
            %method,
            %path,
            status = response.status().as_u16(),
            "handled request"
        );
    }
    response
}
