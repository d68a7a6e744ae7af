//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestrators to
//! determine if the scheduler is healthy. They are not behind auth.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use super::ApiState;
use crate::connection::ConnectionState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    pub timestamp: String,

    /// Subscription state; only reported by readyz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness: 200 whenever the process serves requests.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "halyard".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        connection: None,
    })
}

/// Readiness: 503 until a subscription is established.
async fn readyz(State(state): State<ApiState>) -> impl IntoResponse {
    let connection = state.ctx.connection_state();
    let ready = connection == ConnectionState::Subscribed;
    let response = HealthResponse {
        status: if ready { "ok" } else { "degraded" }.to_string(),
        service: "halyard".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        connection: Some(connection),
    };

    if ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
