//! Request-scoped context and Basic authentication for `/v0`.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use halyard_id::RequestId;

use super::error::ApiError;
use super::ApiState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Authenticated user, or `None` when authentication is disabled.
    pub username: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Decode `Basic <base64(user:password)>`.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = header_string(headers, AUTHORIZATION.as_str())?;
    let encoded = value.trim().strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Check the request against the configured admin credentials. An empty
/// configured username disables the check.
fn authenticate(
    headers: &HeaderMap,
    username: &str,
    password: &str,
) -> Result<Option<String>, &'static str> {
    if username.is_empty() {
        return Ok(None);
    }
    let Some((user, pass)) = basic_credentials(headers) else {
        return Err("missing or malformed Basic credentials");
    };
    if user == username && pass == password {
        Ok(Some(user))
    } else {
        Err("invalid credentials")
    }
}

impl FromRequestParts<ApiState> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let config = state.ctx.config();
        let username = authenticate(&parts.headers, &config.api_username, &config.api_password)
            .map_err(|message| {
                ApiError::unauthorized("unauthorized", message).with_request_id(request_id.clone())
            })?;

        Ok(Self {
            request_id,
            username,
        })
    }
}
