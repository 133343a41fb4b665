use std::time::Duration;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppError;

const CLOCK_SKEW_SECS: i64 = 60;

/// User resolved from a valid bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

/// Issues and verifies HS256 session tokens
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SessionKeys {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.jwt_secret.as_bytes(), config.jwt_ttl)
    }

    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue(&self, user_id: i64, email: &str) -> Result<String, AppError> {
        let now = chrono::Utc::now().timestamp();
        let claims = SessionClaims {
            user_id,
            email: email.to_string(),
            exp: now.saturating_add(i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX)),
            iat: now,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|error| {
            AppError::internal(format!("Token signing failed: {}", sanitize(&error)))
        })
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, AppError> {
        let validation = Validation::new(Algorithm::HS256);
        let claims = decode::<SessionClaims>(token, &self.decoding, &validation)
            .map(|decoded| decoded.claims)
            .map_err(|error| {
                tracing::debug!("Token validation failed: {}", sanitize(&error));
                AppError::forbidden("Invalid or expired token")
            })?;

        let now = chrono::Utc::now().timestamp();
        if claims.iat > now.saturating_add(CLOCK_SKEW_SECS) {
            return Err(AppError::forbidden("Invalid or expired token"));
        }
        Ok(claims)
    }
}

/// Single-use magic-link token: 64 lowercase hex characters
pub fn generate_magic_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let missing = || AppError::unauthorized("Access token required");
    let header = headers
        .get("authorization")
        .ok_or_else(missing)?
        .to_str()
        .map_err(|_| missing())?;

    let (scheme, token) = header.split_once(' ').ok_or_else(missing)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(missing());
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(missing());
    }

    Ok(token)
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use stillmind_core::auth::{decode_session_token, validate_magic_token};

    use super::*;
    use pretty_assertions::assert_eq;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_missing_or_wrong_scheme() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(AppError::Unauthorized(_))
        ));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn issued_tokens_verify_and_decode_on_the_client() {
        let keys = SessionKeys::new(SECRET, Duration::from_secs(3_600));
        let token = keys.issue(7, "me@example.com").unwrap();

        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.email, "me@example.com");

        let user = decode_session_token(&token).unwrap();
        assert_eq!(user.user_id, 7);
        assert_eq!(user.email, "me@example.com");
    }

    #[test]
    fn tokens_from_another_secret_are_forbidden() {
        let keys = SessionKeys::new(SECRET, Duration::from_secs(3_600));
        let other = SessionKeys::new(b"another-secret-another-secret-xx", Duration::from_secs(60));
        let token = other.issue(7, "me@example.com").unwrap();

        assert!(matches!(keys.verify(&token), Err(AppError::Forbidden(_))));
        assert!(keys.verify("garbage").is_err());
    }

    #[test]
    fn tokens_issued_in_the_future_are_forbidden() {
        let keys = SessionKeys::new(SECRET, Duration::from_secs(3_600));
        let now = chrono::Utc::now().timestamp();
        let claims = SessionClaims {
            user_id: 7,
            email: "me@example.com".to_string(),
            exp: now + 7_200,
            iat: now + 600,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET))
            .unwrap();

        assert!(matches!(keys.verify(&token), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn magic_tokens_match_the_client_format() {
        let token = generate_magic_token();

        assert_eq!(token.len(), 64);
        assert!(validate_magic_token(&token).is_ok());
        assert_ne!(token, generate_magic_token());
    }
}
