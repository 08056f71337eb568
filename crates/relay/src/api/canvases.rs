// Canvas CRUD and sharing endpoints.
//
// Routes (all bearer-authenticated):
//   POST   /canvas/create          - create an empty canvas owned by the caller
//   GET    /canvas/getlist         - canvases owned by or shared with the caller
//   GET    /canvas/{id}            - full canvas (owner or shared)
//   PUT    /canvas/{id}            - replace elements (owner or shared)
//   PUT    /canvas/adduser/{id}    - share with another user (owner)
//   DELETE /canvas/delete/{id}     - delete (owner)
//   DELETE /canvas/deleteuser/{id} - unshare (owner, or a shared user leaving)
//
// The HTTP layer is the only writer. Connected realtime clients pick up
// changes when a collaborator sends `updateInMemory`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use easel_common::types::{Canvas, CanvasSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{caller_record, ApiError, ApiState};
use crate::{
    auth::middleware::AuthenticatedUser,
    realtime::guard::{authorize, is_owner},
    store::CanvasStore,
    validation::{normalize_name, ValidatedJson},
};

#[derive(Deserialize)]
struct CreateCanvasRequest {
    name: String,
}

#[derive(Serialize)]
struct CreateCanvasResponse {
    message: &'static str,
    canvas_id: Uuid,
}

#[derive(Deserialize)]
struct UpdateCanvasRequest {
    elements: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanvasUserRequest {
    user_email: String,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

pub(super) fn routes() -> Router<ApiState> {
    Router::new()
        .route("/canvas/create", post(create_canvas))
        .route("/canvas/getlist", get(list_canvases))
        .route("/canvas/{id}", get(load_canvas).put(update_canvas))
        .route("/canvas/adduser/{id}", put(add_user))
        .route("/canvas/delete/{id}", delete(delete_canvas))
        .route("/canvas/deleteuser/{id}", delete(remove_user))
}

/// Unknown and malformed ids are indistinguishable to callers.
async fn find_canvas(store: &CanvasStore, raw_id: &str) -> Result<Canvas, ApiError> {
    let canvas_id = Uuid::parse_str(raw_id).map_err(|_| ApiError::not_found("canvas not found"))?;
    store
        .find_canvas_by_external_id(canvas_id)
        .await?
        .ok_or_else(|| ApiError::not_found("canvas not found"))
}

async fn create_canvas(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    ValidatedJson(payload): ValidatedJson<CreateCanvasRequest>,
) -> Result<(StatusCode, Json<CreateCanvasResponse>), ApiError> {
    let name = normalize_name(&payload.name)
        .ok_or_else(|| ApiError::bad_request("canvas name is required"))?;
    let owner = caller_record(&state.store, &user.email).await?;

    let canvas = state.store.create_canvas(&owner.user_ref(), &name).await?;
    tracing::info!(canvas_id = %canvas.id, owner_id = %owner.id, "canvas created");

    Ok((
        StatusCode::CREATED,
        Json(CreateCanvasResponse { message: "created canvas successfully", canvas_id: canvas.id }),
    ))
}

async fn list_canvases(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<CanvasSummary>>, ApiError> {
    let caller = caller_record(&state.store, &user.email).await?;
    Ok(Json(state.store.list_canvases_for_user(caller.id).await?))
}

async fn load_canvas(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(canvas_id): Path<String>,
) -> Result<Json<Canvas>, ApiError> {
    let canvas = find_canvas(&state.store, &canvas_id).await?;
    if !authorize(&canvas, &user.email) {
        return Err(ApiError::forbidden("unauthorized to access this canvas"));
    }
    Ok(Json(canvas))
}

async fn update_canvas(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(canvas_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<UpdateCanvasRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let canvas = find_canvas(&state.store, &canvas_id).await?;
    if !authorize(&canvas, &user.email) {
        return Err(ApiError::forbidden("unauthorized to access this canvas"));
    }

    state.store.replace_elements(canvas.id, payload.elements).await?;
    Ok(Json(MessageResponse { message: "updated canvas successfully" }))
}

async fn add_user(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(canvas_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<CanvasUserRequest>,
) -> Result<Json<CanvasSummary>, ApiError> {
    let canvas = find_canvas(&state.store, &canvas_id).await?;
    if !is_owner(&canvas, &user.email) {
        return Err(ApiError::forbidden("unauthorized to add user to canvas"));
    }

    let target_email = payload.user_email.trim();
    if canvas.is_owner(target_email) {
        return Err(ApiError::bad_request("user is the owner"));
    }
    let target = state
        .store
        .find_user_by_email(target_email)
        .await?
        .ok_or_else(|| ApiError::not_found("user to be added not found"))?;
    if canvas.is_shared_with(&target.email) {
        return Err(ApiError::bad_request("user already added to canvas"));
    }

    let updated = state.store.add_shared_user(canvas.id, &target.user_ref()).await?;
    tracing::info!(canvas_id = %canvas.id, user_id = %target.id, "canvas shared");
    Ok(Json(updated.summary()))
}

async fn delete_canvas(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(canvas_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let canvas = find_canvas(&state.store, &canvas_id).await?;
    if !is_owner(&canvas, &user.email) {
        return Err(ApiError::forbidden("unauthorized to delete the canvas"));
    }

    state.store.delete_canvas(canvas.id).await?;
    tracing::info!(canvas_id = %canvas.id, "canvas deleted");
    Ok(Json(MessageResponse { message: "deleted canvas successfully" }))
}

async fn remove_user(
    State(state): State<ApiState>,
    user: AuthenticatedUser,
    Path(canvas_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<CanvasUserRequest>,
) -> Result<Json<CanvasSummary>, ApiError> {
    let canvas = find_canvas(&state.store, &canvas_id).await?;
    let target_email = payload.user_email.trim();
    let removing_self = target_email == user.email;

    if !is_owner(&canvas, &user.email) && !removing_self {
        return Err(ApiError::forbidden("unauthorized to delete user from canvas"));
    }
    if canvas.is_owner(target_email) {
        return Err(ApiError::bad_request("user is the owner"));
    }

    let target = state
        .store
        .find_user_by_email(target_email)
        .await?
        .ok_or_else(|| ApiError::not_found("user to be deleted not found"))?;
    if !canvas.is_shared_with(&target.email) {
        return Err(ApiError::bad_request("user is not present in canvas"));
    }

    let updated = state.store.remove_shared_user(canvas.id, &target.user_ref()).await?;
    tracing::info!(canvas_id = %canvas.id, user_id = %target.id, "canvas unshared");
    Ok(Json(updated.summary()))
}
