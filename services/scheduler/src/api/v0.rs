//! Administrative endpoints under `/v0`.
//!
//! Scale changes answer with the signed delta as plain text, the way
//! operators script against them (`curl .../v0/agent/scale/5` prints `4`).

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use super::auth::RequestContext;
use super::error::ApiError;
use super::ApiState;
use crate::connection::ConnectionState;
use crate::scale::ScaleCounts;
use crate::task::{Role, TaskState};

const API_SERVICE_HEADER: &str = "api-service";

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/status/framework", get(framework_status))
        .route("/status/k8s", get(k8s_status))
        .route("/{role}/scale", get(get_scale))
        .route("/{role}/scale/{count}", get(set_scale).put(set_scale))
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct RoleStatus {
    pub server: ScaleCounts,
    pub agent: ScaleCounts,
}

#[derive(Debug, Serialize)]
pub struct FrameworkStatusResponse {
    pub connection: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<String>,
    /// Revision of the persisted configuration snapshot.
    pub revision: u64,
    pub agent_max: u32,
    pub roles: RoleStatus,
}

// =============================================================================
// Handlers
// =============================================================================

fn parse_role(raw: &str, request_id: &str) -> Result<Role, ApiError> {
    raw.parse::<Role>().map_err(|e| {
        ApiError::bad_request("unknown_role", e.to_string()).with_request_id(request_id)
    })
}

fn with_service_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(API_SERVICE_HEADER, HeaderValue::from_static("v0"));
    response
}

async fn get_scale(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path(role): Path<String>,
) -> Result<Response, ApiError> {
    let role = parse_role(&role, &ctx.request_id)?;
    let counts = state
        .scale
        .get(role)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    Ok(with_service_header(Json(counts).into_response()))
}

async fn set_scale(
    State(state): State<ApiState>,
    ctx: RequestContext,
    Path((role, count)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let role = parse_role(&role, &ctx.request_id)?;
    let count: u32 = count.parse().map_err(|_| {
        ApiError::bad_request(
            "invalid_count",
            format!("count must be a non-negative integer, got {count:?}"),
        )
        .with_request_id(&ctx.request_id)
    })?;

    let change = state
        .scale
        .set_desired(role, count)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    info!(
        request_id = %ctx.request_id,
        role = %role,
        previous = change.previous,
        desired = change.desired,
        killed = change.killed.len(),
        "Scale changed via admin API"
    );

    let response = (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        change.delta().to_string(),
    )
        .into_response();
    Ok(with_service_header(response))
}

async fn framework_status(
    State(state): State<ApiState>,
    ctx: RequestContext,
) -> Result<Response, ApiError> {
    let server = state
        .scale
        .get(Role::Server)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let agent = state
        .scale
        .get(Role::Agent)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let snapshot = state.ctx.snapshot().await;

    let body = FrameworkStatusResponse {
        connection: state.ctx.connection_state(),
        framework_id: state.ctx.framework_id().await.map(|id| id.to_string()),
        revision: snapshot.revision,
        agent_max: snapshot.scale.agent_max,
        roles: RoleStatus { server, agent },
    };
    Ok(with_service_header(Json(body).into_response()))
}

/// Proxy the bootstrap service's status report from the running server task.
async fn k8s_status(
    State(state): State<ApiState>,
    ctx: RequestContext,
) -> Result<Response, ApiError> {
    let unavailable = |detail: String| {
        ApiError::bad_gateway("upstream_unavailable", detail).with_request_id(&ctx.request_id)
    };

    let servers = state
        .ctx
        .store()
        .list_tasks(Role::Server)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let config = state.ctx.config();
    let target = servers
        .iter()
        .filter(|t| t.state == TaskState::Running)
        .find_map(|t| {
            config
                .server
                .host_port_for("bootstrap", &t.host_ports())
                .map(|port| (t.hostname.clone(), port))
        });
    let Some((host, port)) = target else {
        return Err(unavailable("no running server task".to_string()));
    };

    let url = format!("http://{host}:{port}/api/m3s/bootstrap/v0/status?verbose");
    let upstream = state
        .http
        .get(&url)
        .basic_auth(&config.bootstrap_username, Some(&config.bootstrap_password))
        .send()
        .await
        .map_err(|e| {
            warn!(url = %url, error = %e, "Bootstrap status request failed");
            unavailable(format!("bootstrap service unreachable: {e}"))
        })?;

    let status = upstream.status();
    if status != reqwest::StatusCode::OK {
        warn!(url = %url, status = status.as_u16(), "Bootstrap status returned an error");
        return Err(unavailable(format!(
            "bootstrap service answered {}",
            status.as_u16()
        )));
    }

    let body = upstream
        .bytes()
        .await
        .map_err(|e| unavailable(format!("reading bootstrap response: {e}")))?;

    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response();
    Ok(with_service_header(response))
}
