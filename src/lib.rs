//! Keeps a persisted metadata index in step with an object-storage namespace.
//!
//! Storage change notifications are reconciled against the index by comparing
//! live content fingerprints with stored ones, so repeated or stale deliveries
//! leave the index unchanged. The same entry point also serves object
//! downloads.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::request_router::RequestRouter;

/// The full HTTP application with its shared state attached.
pub fn app(router: RequestRouter) -> Router {
    routes::routes::routes().with_state(router)
}
