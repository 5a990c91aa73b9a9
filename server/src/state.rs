use std::sync::Arc;

use crate::auth::jwt::JwtAuthenticator;
use crate::auth::Authenticator;
use crate::config::{Config, WsConfig};
use crate::ws::HubHandle;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the hub control loop
    pub hub: HubHandle,
    /// Verifies tokens presented on WebSocket upgrade
    pub authenticator: Arc<dyn Authenticator>,
    /// JWT secret for the Claims extractor on REST routes
    pub jwt_secret: Vec<u8>,
    /// Connection timing and sizing
    pub ws: WsConfig,
}

impl AppState {
    /// State backed by the configured JWT secret.
    pub fn new(config: &Config, hub: HubHandle) -> Self {
        let secret = config.jwt_secret.as_bytes().to_vec();
        Self {
            hub,
            authenticator: Arc::new(JwtAuthenticator::new(secret.clone())),
            jwt_secret: secret,
            ws: config.websocket.clone(),
        }
    }
}
