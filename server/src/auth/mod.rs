pub mod jwt;
pub mod middleware;

use uuid::Uuid;

/// Who is on the other end of a connection, as established before upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing access token")]
    Missing,
    #[error("access token expired")]
    Expired,
    #[error("invalid access token: {0}")]
    Invalid(String),
}

/// Resolves a presented token to an identity.
/// The hub never validates credentials itself; it only trusts this seam.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}
