use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;

use leadline_core::{LeadId, UserId};

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/leads/:lead_id/takeover", post(take_over))
}

pub async fn take_over(
    Extension(services): Extension<Arc<AppServices>>,
    Path(lead_id): Path<String>,
    Json(body): Json<dto::TakeoverRequest>,
) -> axum::response::Response {
    let lead_id: LeadId = match lead_id.parse() {
        Ok(v) => v,
        Err(_) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid lead id")
        }
    };
    let user_id = match body.user_id.as_deref() {
        Some(raw) => match raw.parse::<UserId>() {
            Ok(v) => v,
            Err(_) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid user id")
            }
        },
        None => UserId::system(),
    };

    match services.takeover().take_over(lead_id, user_id).await {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({
                "lead_id": result.lead_id.to_string(),
                "cancelled_count": result.cancelled_entries,
                "state_changed": result.state_changed,
            })),
        )
            .into_response(),
        Err(e) => errors::domain_error_to_response(e),
    }
}
