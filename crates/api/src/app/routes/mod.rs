use axum::Router;

pub mod automation;
pub mod leads;
pub mod queue;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .merge(queue::router())
        .merge(automation::router())
        .merge(leads::router())
}
