use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use leadline_core::DomainError;

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DomainError::Store(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn parse_queue_status(s: &str) -> Result<leadline_queue::QueueStatus, axum::response::Response> {
    use leadline_queue::QueueStatus;
    match s.to_lowercase().as_str() {
        "queued" => Ok(QueueStatus::Queued),
        "sending" => Ok(QueueStatus::Sending),
        "sent" => Ok(QueueStatus::Sent),
        "failed" => Ok(QueueStatus::Failed),
        "cancelled" => Ok(QueueStatus::Cancelled),
        _ => Err(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: queued, sending, sent, failed, cancelled",
        )),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
