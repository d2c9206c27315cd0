//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: shared state (repositories, automation runner, sender)
//! - `routes/`: HTTP routes + handlers, one file per area
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

use leadline_queue::{MessageSender, TenantPolicy};
use leadline_store::RecordStore;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (entrypoint used by `main.rs` and tests).
pub fn build_app(
    store: Arc<dyn RecordStore>,
    sender: Arc<dyn MessageSender>,
    policy: TenantPolicy,
) -> Router {
    let services = Arc::new(services::AppServices::new(store, sender, policy));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(services))
}
