pub mod canvases;
pub mod users;

use std::sync::Arc;

use axum::{
    middleware,
    response::{IntoResponse, Response},
    Router,
};

use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::require_bearer_auth},
    error::{ErrorCode, RelayError},
    store::{CanvasStore, StoreError, UserRecord},
};

#[derive(Clone)]
pub struct ApiState {
    pub store: CanvasStore,
    pub jwt_service: Arc<JwtAccessTokenService>,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest { message: String },
    Unauthorized { message: &'static str },
    Forbidden { message: &'static str },
    NotFound { message: &'static str },
    Conflict { message: &'static str },
    Internal(anyhow::Error),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }

    fn forbidden(message: &'static str) -> Self {
        Self::Forbidden { message }
    }

    fn not_found(message: &'static str) -> Self {
        Self::NotFound { message }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound("canvas") => Self::not_found("canvas not found"),
            StoreError::NotFound("user") => Self::not_found("user not found"),
            StoreError::NotFound(_) => Self::not_found(ErrorCode::NotFound.default_message()),
            StoreError::Conflict(message) => Self::Conflict { message },
            StoreError::Backend(error) => Self::Internal(error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest { message } => {
                RelayError::new(ErrorCode::ValidationFailed, message).into_response()
            }
            Self::Unauthorized { message } => {
                RelayError::new(ErrorCode::AuthInvalidCredentials, message).into_response()
            }
            Self::Forbidden { message } => {
                RelayError::new(ErrorCode::AuthForbidden, message).into_response()
            }
            Self::NotFound { message } => {
                RelayError::new(ErrorCode::NotFound, message).into_response()
            }
            Self::Conflict { message } => {
                RelayError::new(ErrorCode::Conflict, message).into_response()
            }
            Self::Internal(error) => {
                tracing::error!(error = ?error, "canvas api internal error");
                RelayError::from_code(ErrorCode::InternalError).into_response()
            }
        }
    }
}

/// Resolves the caller's account; a valid token for a deleted user is a 404.
pub(crate) async fn caller_record(
    store: &CanvasStore,
    email: &str,
) -> Result<UserRecord, ApiError> {
    store.find_user_by_email(email).await?.ok_or_else(|| ApiError::not_found("user not found"))
}

pub fn router(store: CanvasStore, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    let state = ApiState { store, jwt_service: Arc::clone(&jwt_service) };

    let protected = users::protected_routes()
        .merge(canvases::routes())
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth));

    users::public_routes().merge(protected).with_state(state)
}
