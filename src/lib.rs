//! Ferry Server Library
//!
//! Resumable chunked uploads and streaming downloads over a backing store.
//!
//! # Modules
//!
//! - `upload`: range lock, staging store, completion queue, upload service
//!   and the upload client engine
//! - `download`: byte ranges and tar-to-zip directory archives
//! - `storage`: the backing store boundary and a local directory store
//! - `routes`: axum routers for the HTTP protocol

pub mod config;
pub mod download;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let max_chunk_bytes = state.config().upload.max_chunk_bytes;
    let cors_disabled = state.config().server.cors_disabled;

    let router = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/upload", routes::upload::router(max_chunk_bytes))
        .nest("/download", routes::download::router())
        .layer(TraceLayer::new_for_http());

    let router = if cors_disabled {
        router
    } else {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    };

    router.with_state(state)
}
