use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

/// The caller a verified bearer token speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub username: String,
}

/// HS256 bearer tokens; `sub` carries the user id.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn mint(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.0.to_string(),
            name: username.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|err| unauthorized(format!("invalid token: {err}")))?;
        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map(UserId)
            .map_err(|_| unauthorized("token subject is not a user id"))?;
        Ok(AuthUser {
            user_id,
            username: data.claims.name,
        })
    }

    /// Checks the `Authorization` header first, then a `?token=` fallback.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<AuthUser, ApiError> {
        let token = bearer_token(headers)
            .or(query_token.filter(|token| !token.is_empty()))
            .ok_or_else(|| unauthorized("missing bearer token"))?;
        self.verify(token)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn unauthorized(message: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::Unauthorized, message)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
