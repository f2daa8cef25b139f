//! Defines the HTTP surface of the indexer.
//!
//! ## Structure
//! - `GET  /healthz`: liveness
//! - `GET  /readyz`: readiness (metadata store + object source)
//! - `POST /invoke`: raw platform event in, response envelope out
//! - `GET  /files`: retrieval with the envelope decoded into a plain download

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        invoke_handlers::{download_file, invoke},
    },
    services::request_router::RequestRouter,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all endpoints.
///
/// The router carries the shared `RequestRouter` state to all handlers.
pub fn routes() -> Router<RequestRouter> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/invoke", post(invoke))
        .route("/files", get(download_file))
}
