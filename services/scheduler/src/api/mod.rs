//! Admin HTTP API: health checks and the `/v0` scale and status endpoints.

mod auth;
pub mod error;
mod health;
mod v0;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::context::SchedulerContext;
use crate::scale::ScaleController;

pub use auth::RequestContext;
pub use v0::{FrameworkStatusResponse, RoleStatus};

/// Dependencies handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: SchedulerContext,
    pub scale: ScaleController,
    /// Client for the bootstrap status proxy.
    pub http: reqwest::Client,
}

impl ApiState {
    pub fn new(ctx: SchedulerContext, scale: ScaleController) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(ctx.config().request_timeout)
            .build()?;
        Ok(Self { ctx, scale, http })
    }
}

/// Create the admin router with all routes and middleware.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .nest("/v0", v0::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
