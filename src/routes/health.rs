//! Health check endpoint
//!
//! Reports whether the backing store root and the staging directory are
//! reachable. Either one missing answers 503 so a load balancer stops
//! routing transfers here.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub store: bool,
    pub staging: bool,
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = match state.store().stat("").await {
        Ok(info) => info.is_dir,
        Err(e) => {
            tracing::warn!(error = %e, "Backing store not reachable");
            false
        }
    };

    let staging = match tokio::fs::metadata(state.uploads().staging().dir()).await {
        Ok(metadata) => metadata.is_dir(),
        Err(e) => {
            tracing::warn!(error = %e, "Staging directory not reachable");
            false
        }
    };

    let (status, code) = if store && staging {
        ("healthy", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            service: "ferry-server",
            checks: HealthChecks { store, staging },
        }),
    )
}
