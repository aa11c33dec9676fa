//! REST Surface
//!
//! Thin HTTP endpoints mapping 1:1 onto coordinator operations: create
//! a race room, join by room code, fetch a room, and a player's recent
//! race history. All routes require a bearer token from the identity
//! provider; failures come back as 4xx with a `message` body.

use std::sync::Arc;

use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::network::auth::{verify_token, AuthConfig};
use crate::race::coordinator::{CoordinatorError, RaceCoordinator};
use crate::race::model::{Race, RaceMode, UserIdentity};

/// Shared state for the HTTP handlers.
pub struct HttpContext {
    /// The process coordinator.
    pub coordinator: Arc<RaceCoordinator>,
    /// Token validation settings.
    pub auth: AuthConfig,
}

/// Build the HTTP router with all endpoints.
pub fn build_router(context: Arc<HttpContext>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/races", post(create_race))
        .route("/api/races/join", post(join_race))
        .route("/api/races/history", get(race_history))
        .route("/api/races/:room_code", get(get_race))
        .layer(Extension(context))
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "Typerace API is running" }))
}

/// Error envelope for the REST surface.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let status = match &e {
            CoordinatorError::RoomNotFound => StatusCode::NOT_FOUND,
            CoordinatorError::Room(_)
            | CoordinatorError::Queue(_)
            | CoordinatorError::Validation(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

/// Resolve the caller's identity from the Authorization header.
fn authenticate(context: &HttpContext, headers: &HeaderMap) -> Result<UserIdentity, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Not authorized, no token"))?;

    verify_token(&context.auth, token).map_err(|e| {
        debug!(error = %e, "token validation failed");
        ApiError::new(StatusCode::UNAUTHORIZED, "Not authorized, token failed")
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRaceRequest {
    mode: Option<RaceMode>,
    language: Option<String>,
    text_content: Option<String>,
}

async fn create_race(
    Extension(context): Extension<Arc<HttpContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateRaceRequest>,
) -> Result<(StatusCode, Json<Race>), ApiError> {
    let identity = authenticate(&context, &headers)?;

    let race = context
        .coordinator
        .create_room(
            &identity,
            body.mode.unwrap_or_default(),
            body.language.as_deref().unwrap_or("english"),
            body.text_content.as_deref().unwrap_or(""),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(race)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRaceRequest {
    room_code: Option<String>,
}

async fn join_race(
    Extension(context): Extension<Arc<HttpContext>>,
    headers: HeaderMap,
    Json(body): Json<JoinRaceRequest>,
) -> Result<Json<Race>, ApiError> {
    let identity = authenticate(&context, &headers)?;

    let room_code = body
        .room_code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Room code is required"))?;

    let race = context
        .coordinator
        .join_room(&identity, &room_code, None)
        .await?;
    Ok(Json(race))
}

async fn get_race(
    Extension(context): Extension<Arc<HttpContext>>,
    headers: HeaderMap,
    Path(room_code): Path<String>,
) -> Result<Json<Race>, ApiError> {
    authenticate(&context, &headers)?;

    let race = context.coordinator.fetch_room(&room_code).await?;
    Ok(Json(race))
}

async fn race_history(
    Extension(context): Extension<Arc<HttpContext>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Race>>, ApiError> {
    let identity = authenticate(&context, &headers)?;

    let races = context.coordinator.race_history(&identity.id).await?;
    Ok(Json(races))
}
