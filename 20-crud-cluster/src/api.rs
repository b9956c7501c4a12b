//! REST API served by each worker on its private port.
//!
//! Endpoints:
//!   GET    /                → health, including which worker answered
//!   GET    /api/users       → all users known to this worker
//!   POST   /api/users       → create (201)
//!   GET    /api/users/:id   → one user
//!   PUT    /api/users/:id   → partial update
//!   DELETE /api/users/:id   → delete (204)

use std::any::Any;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::error;

use crate::error::StoreError;
use crate::store::UserStore;
use crate::user::{parse_id, User, UserDraft};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<UserStore>,
    /// `None` when running standalone.
    pub worker_id: Option<u16>,
}

pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/", get(health))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/", get(list_users).post(create_user))
        .route(
            "/api/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route(
            "/api/users/:id/",
            get(get_user).put(update_user).delete(delete_user),
        )
        .fallback(not_found)
        .with_state(state);
    with_middleware(routes)
}

fn with_middleware(routes: Router) -> Router {
    routes
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
}

/// Turns a handler panic into a plain 500 instead of a dropped connection.
fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let reason = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "handler panicked".to_string()
    };
    ApiError::Internal(reason).into_response()
}

/// Errors surfaced to API clients as `{"message", "field"?}` bodies.
#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    InvalidJson,
    NoRoute { method: Method, path: String },
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Store(StoreError::Validation { message, field }) => (
                StatusCode::BAD_REQUEST,
                match field {
                    Some(field) => json!({ "message": message, "field": field }),
                    None => json!({ "message": message }),
                },
            ),
            ApiError::Store(err @ StoreError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, json!({ "message": err.to_string() }))
            }
            ApiError::InvalidJson => (
                StatusCode::BAD_REQUEST,
                json!({ "message": "Invalid JSON payload" }),
            ),
            ApiError::NoRoute { method, path } => (
                StatusCode::NOT_FOUND,
                json!({ "message": format!("Not found: {method} {path}") }),
            ),
            ApiError::Internal(reason) => {
                error!(%reason, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "message": "Internal Server Error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = json!({
        "status": "OK",
        "message": "CRUD API server is running",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(worker_id) = state.worker_id {
        body["workerId"] = json!(worker_id);
        body["pid"] = json!(std::process::id());
    }
    Json(body)
}

async fn list_users(State(state): State<AppState>) -> Json<Vec<User>> {
    Json(state.store.list_all())
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.get(&id)?))
}

async fn create_user(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let changes = parse_draft(&body)?.validate()?;
    let user = state.store.create(changes)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<User>, ApiError> {
    let id = parse_id(&id)?;
    let changes = parse_draft(&body)?.validate()?;
    Ok(Json(state.store.update(&id, changes)?))
}

async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.store.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn not_found(method: Method, uri: Uri) -> ApiError {
    ApiError::NoRoute {
        method,
        path: uri.path().to_string(),
    }
}

/// An empty body is treated as `{}`.
fn parse_draft(body: &[u8]) -> Result<UserDraft, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(UserDraft::default());
    }
    serde_json::from_slice(body).map_err(|_| ApiError::InvalidJson)
}
