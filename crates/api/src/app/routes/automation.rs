use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;

use leadline_core::TenantId;

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/tenants/:tenant_id/automation/start", post(start))
        .route("/tenants/:tenant_id/automation/stop", post(stop))
}

/// Idempotent: starting a tenant that is already running is a no-op.
pub async fn start(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id: TenantId = match tenant_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid tenant id")
        }
    };

    let started = services
        .runner()
        .start(tenant_id, services.policy().clone())
        .await;
    (
        StatusCode::OK,
        Json(json!({"running": true, "started": started})),
    )
        .into_response()
}

pub async fn stop(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id: TenantId = match tenant_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid tenant id")
        }
    };

    let stopped = services.runner().stop(tenant_id).await;
    (
        StatusCode::OK,
        Json(json!({"running": false, "stopped": stopped})),
    )
        .into_response()
}
