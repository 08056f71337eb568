// Bearer authentication for HTTP routes.
//
// `require_bearer_auth` runs as a route layer and stores the caller in the
// request extensions; handlers read it back through the `AuthenticatedUser`
// extractor.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{ErrorCode, RelayError},
};

/// The caller behind a validated access token, identified by email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub email: String,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| RelayError::new(ErrorCode::AuthInvalidToken, "missing bearer token"))
    }
}

pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return unauthorized("missing bearer token");
    };

    let email = match jwt_service.validate_user_token(token) {
        Ok(identity) => identity.email,
        Err(error) => {
            debug!(%error, path = %request.uri().path(), "bearer token rejected");
            return unauthorized("invalid bearer token");
        }
    };

    request.extensions_mut().insert(AuthenticatedUser { email });
    next.run(request).await
}

/// The token from an `Authorization: Bearer <token>` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()).and_then(parse_bearer)
}

fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    Some(token.trim()).filter(|token| !token.is_empty())
}

fn unauthorized(message: &'static str) -> Response {
    RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
