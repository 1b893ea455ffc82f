//! Bearer-token authentication for the REST routes.

use crate::error::ApiError;
use crate::state::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tether_core::{UserId, UserProfile};
use tracing::debug;

/// JWT claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "_id")]
    pub user_id: String,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Validate an HS256 token and return its claims.
///
/// # Errors
///
/// Returns an error if the signature, algorithm or expiry is invalid.
pub fn decode_token(secret: &[u8], token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let data = jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

/// The authenticated caller, resolved to a stored profile.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserProfile);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized("No token"))?;

        let claims = decode_token(state.config.auth.jwt_secret.as_bytes(), token).map_err(|e| {
            debug!(error = %e, "Rejected token");
            ApiError::Unauthorized("Invalid token")
        })?;

        let user = UserId::from(claims.user_id);
        match state.store.find_user(&user).await? {
            Some(profile) => Ok(AuthUser(profile)),
            None => Err(ApiError::Unauthorized("User not found")),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Claims;
    use jsonwebtoken::{EncodingKey, Header};

    /// Sign a token valid for one hour.
    pub(crate) fn token_for(secret: &str, user_id: &str) -> String {
        let claims = Claims {
            user_id: user_id.to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }
}
