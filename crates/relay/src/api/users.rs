// Account endpoints.
//
// Routes:
//   POST /user/register  - create an account (public)
//   POST /user/login     - exchange credentials for a bearer token (public)
//   GET  /user/profile   - the caller's profile

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use easel_common::types::UserProfile;
use serde::{Deserialize, Serialize};

use super::{caller_record, ApiError, ApiState};
use crate::{
    auth::{
        middleware::AuthenticatedUser,
        password::{hash_password, verify_password},
    },
    store::StoreError,
    validation::{
        is_strong_password, is_valid_email, normalize_name, ValidatedJson, WEAK_PASSWORD_MESSAGE,
    },
};

const DUPLICATE_EMAIL_MESSAGE: &str = "user already exists with this email";

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    email: String,
    password: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    message: &'static str,
    user: UserProfile,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    expires_in: i64,
}

pub(super) fn public_routes() -> Router<ApiState> {
    Router::new().route("/user/register", post(register)).route("/user/login", post(login))
}

pub(super) fn protected_routes() -> Router<ApiState> {
    Router::new().route("/user/profile", get(profile))
}

async fn register(
    State(state): State<ApiState>,
    ValidatedJson(payload): ValidatedJson<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let name =
        normalize_name(&payload.name).ok_or_else(|| ApiError::bad_request("name is required"))?;
    let email = payload.email.trim();
    if !is_valid_email(email) {
        return Err(ApiError::bad_request("invalid email format"));
    }
    if state.store.find_user_by_email(email).await?.is_some() {
        return Err(ApiError::Conflict { message: DUPLICATE_EMAIL_MESSAGE });
    }
    if !is_strong_password(&payload.password) {
        return Err(ApiError::bad_request(WEAK_PASSWORD_MESSAGE));
    }

    let password_hash = hash_password(&payload.password).map_err(ApiError::Internal)?;
    let user = match state.store.create_user(&name, email, &password_hash).await {
        Ok(user) => user,
        Err(StoreError::Conflict(_)) => {
            return Err(ApiError::Conflict { message: DUPLICATE_EMAIL_MESSAGE })
        }
        Err(error) => return Err(error.into()),
    };

    tracing::info!(user_id = %user.id, "user registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { message: "user registered successfully", user: user.profile() }),
    ))
}

async fn login(
    State(state): State<ApiState>,
    ValidatedJson(payload): ValidatedJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .store
        .find_user_by_email(payload.email.trim())
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    if !verify_password(&payload.password, &user.password_hash).map_err(ApiError::Internal)? {
        return Err(ApiError::Unauthorized { message: "invalid password" });
    }

    let token = state.jwt_service.issue_user_token(&user.email).map_err(ApiError::Internal)?;
    Ok(Json(LoginResponse { token, expires_in: state.jwt_service.ttl_secs() }))
}

async fn profile(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
) -> Result<Json<UserProfile>, ApiError> {
    let record = caller_record(&state.store, &user.email).await?;
    Ok(Json(record.profile()))
}
