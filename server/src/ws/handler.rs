use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::auth::middleware::bearer_token;
use crate::auth::AuthError;
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also arrive as `?token=JWT`.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /api/v1/ws
/// WebSocket upgrade endpoint. The caller must authenticate before the
/// upgrade; failures are answered with 401 and no socket is opened.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match bearer_token(&headers).or(params.token.as_deref()) {
        Some(token) => state.authenticator.authenticate(token),
        None => Err(AuthError::Missing),
    };

    match identity {
        Ok(identity) => {
            tracing::info!(
                user_id = %identity.user_id,
                username = %identity.username,
                "WebSocket connection authenticated"
            );
            let max_size = state.ws.max_message_size;
            ws.max_message_size(max_size)
                .max_frame_size(max_size)
                .on_upgrade(move |socket| actor::run_connection(socket, state, identity))
        }
        Err(err) => {
            tracing::warn!(error = %err, "WebSocket auth failed");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}
