//! Session authentication and request authorization.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "auth_token";

/// Header naming the organization for organization-scoped canvas calls.
pub const ORG_HEADER: &str = "x-organization-id";

/// Authenticated user id, placed in request extensions by [`authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(ApiError::Unauthenticated)
    }
}

/// Organization id taken from [`ORG_HEADER`].
#[derive(Debug, Clone, Copy)]
pub struct OrgId(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for OrgId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(ORG_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest(format!("{ORG_HEADER} header is required")))?;
        Uuid::parse_str(value)
            .map(OrgId)
            .map_err(|_| ApiError::BadRequest(format!("invalid {ORG_HEADER} header")))
    }
}

/// Token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
        .filter(|t| !t.is_empty())
}

/// Session token from the cookie, falling back to the bearer header.
pub fn session_token(headers: &HeaderMap) -> Option<&str> {
    cookie_token(headers).or_else(|| bearer_token(headers))
}

/// Resolve the caller and check the route's permission before the handler
/// runs. Denials surface as 404.
pub async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, ApiError> {
    let token = session_token(request.headers()).ok_or(ApiError::Unauthenticated)?;
    let claims = state.core.signer.validate(token).map_err(|e| {
        debug!(error = %e, "rejected session token");
        ApiError::Unauthenticated
    })?;

    let org = request.headers().get(ORG_HEADER).and_then(|v| v.to_str().ok());
    state
        .core
        .interceptor
        .authorize_http(request.method().as_str(), request.uri().path(), Some(&claims.sub), org)?;

    request.extensions_mut().insert(CurrentUser(claims.sub));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_wins_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; auth_token=from-cookie"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(session_token(&headers), Some("from-cookie"));

        headers.remove(COOKIE);
        assert_eq!(session_token(&headers), Some("from-header"));
    }

    #[test]
    fn missing_or_empty_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(session_token(&headers), None);
        headers.insert(COOKIE, HeaderValue::from_static("auth_token="));
        assert_eq!(session_token(&headers), None);
    }
}
