//! Bearer token authentication.
//!
//! Clients present an HS256 JWT either in the `Authorization` header or,
//! for browser WebSocket clients that cannot set headers, in the `token`
//! query parameter. The `sub` claim is the user identity.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_protocol::events::validate_id;
use vigil_protocol::UserId;

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    Missing,

    #[error("Invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid subject: {0}")]
    InvalidSubject(&'static str),
}

/// Verifies access tokens against a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Fails on a bad signature, an expired token, a wrong issuer, or a
    /// subject that is not a usable identity.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        validate_id(&data.claims.sub).map_err(|e| AuthError::InvalidSubject(e.0))?;
        Ok(data.claims)
    }

    /// Verify the bearer token of a request, falling back to `query_token`.
    ///
    /// # Errors
    ///
    /// Returns `Missing` when neither source carries a token.
    pub fn verify_request(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Claims, AuthError> {
        let token = bearer_token(headers)
            .or(query_token)
            .ok_or(AuthError::Missing)?;
        self.verify(token)
    }
}

/// Extract the token from an `Authorization: Bearer ...` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Sign a token for `user_id`. Only tests and local tooling mint tokens;
/// production tokens come from the identity service.
#[cfg(test)]
pub fn issue(secret: &[u8], user_id: &str, ttl_secs: u64, issuer: Option<&str>) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: user_id.to_string(),
        exp: jsonwebtoken::get_current_timestamp() + ttl_secs,
        iss: issuer.map(str::to_string),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .expect("signing with an HMAC key cannot fail")
}
