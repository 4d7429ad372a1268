//! Defines routes for chunked photo ingestion.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz` liveness
//!   - `GET  /readyz`  readiness
//!
//! - **Collection-level endpoints**
//!   - `POST /collections/{collection}/chunks`   receive one upload chunk
//!   - `POST /collections/{collection}/precheck` which hashes are already stored

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{precheck, receive_chunk},
    },
    services::ingest_service::IngestService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for multipart boundaries and the text fields around a chunk.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Build the router for all ingestion routes.
///
/// The chunk route's body limit follows the service's maximum chunk size.
pub fn routes(max_chunk_bytes: u64) -> Router<IngestService> {
    let body_limit = usize::try_from(max_chunk_bytes.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/collections/{collection}/chunks",
            post(receive_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/collections/{collection}/precheck", post(precheck))
}

/// Router with its state attached, ready to serve.
pub fn app(service: IngestService) -> Router {
    let max_chunk_bytes = service.options().max_chunk_bytes;
    routes(max_chunk_bytes).with_state(service)
}
