use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use leadline_core::TenantId;
use leadline_queue::export::{export_queue, ExportFilter};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/tenants/:tenant_id/queue/prepare", post(prepare_queue))
        .route("/queue/export", get(export))
}

/// Enqueue every eligible lead of the tenant. Per-lead failures come back in
/// the body; the call itself only fails on store errors.
pub async fn prepare_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id: TenantId = match tenant_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid tenant id")
        }
    };

    match services
        .runner()
        .prepare_batch(tenant_id, services.policy())
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}

pub async fn export(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ExportQuery>,
) -> axum::response::Response {
    let tenant_id = match query.tenant_id.as_deref() {
        Some(raw) => match raw.parse::<TenantId>() {
            Ok(v) => Some(v),
            Err(_) => {
                return errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_id",
                    "invalid tenant id",
                )
            }
        },
        None => None,
    };
    let status = match query.status.as_deref() {
        Some(raw) => match errors::parse_queue_status(raw) {
            Ok(v) => Some(v),
            Err(resp) => return resp,
        },
        None => None,
    };

    match export_queue(services.store(), &ExportFilter { tenant_id, status }).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
