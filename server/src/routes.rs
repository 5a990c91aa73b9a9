use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::middleware::{Claims, JwtSecret};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    State(state): State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Public routes (no auth required)
    let public_routes = Router::new().route("/health", get(health_check));

    // The upgrade handler authenticates on its own, before upgrading.
    let ws_routes = Router::new().route("/api/v1/ws", get(ws_handler::ws_upgrade));

    // Authenticated routes (JWT required, validated by the Claims extractor)
    let presence_routes = Router::new()
        .route("/api/v1/online", get(list_online))
        .route("/api/v1/online/{user_id}", get(user_online));

    Router::new()
        .merge(public_routes)
        .merge(ws_routes)
        .merge(presence_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

/// GET /health
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "MMS real-time hub is running",
    })
}

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<Uuid>,
}

/// GET /api/v1/online: IDs of every user with a live connection.
async fn list_online(
    State(state): State<AppState>,
    _claims: Claims,
) -> Result<Json<OnlineUsersResponse>, StatusCode> {
    let users = state
        .hub
        .list_online()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(OnlineUsersResponse { users }))
}

#[derive(Debug, Serialize)]
pub struct UserOnlineResponse {
    pub user_id: Uuid,
    pub online: bool,
}

/// GET /api/v1/online/{user_id}
async fn user_online(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserOnlineResponse>, StatusCode> {
    let online = state
        .hub
        .is_online(user_id)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(UserOnlineResponse { user_id, online }))
}
