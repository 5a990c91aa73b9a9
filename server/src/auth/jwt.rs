use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::auth::{AuthError, Authenticator, Identity};

/// Issue an HS256 access token.
/// Tokens are normally minted by the auth service; this exists for tooling
/// and tests that need to connect to the hub.
pub fn issue_access_token(
    secret: &[u8],
    user_id: Uuid,
    username: &str,
    ttl: chrono::Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        iat: now,
        exp: now + ttl.num_seconds(),
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Validate an access token and return its claims.
pub fn validate_access_token(secret: &[u8], token: &str) -> Result<Claims, AuthError> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(e.to_string()),
        })
}

/// Authenticator backed by the shared HS256 secret.
#[derive(Clone)]
pub struct JwtAuthenticator {
    secret: Vec<u8>,
}

impl JwtAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = validate_access_token(&self.secret, token)?;
        Ok(Identity {
            user_id: claims.sub,
            username: claims.username,
        })
    }
}
