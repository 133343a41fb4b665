//! Session token helpers: payload decoding, callback parsing, input checks.

use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::util::unix_timestamp_now;
use crate::{Error, Result};

/// Length of a magic-link token (two simple UUIDs)
pub const MAGIC_TOKEN_LEN: usize = 64;

/// Signed-in user as described by the session token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub user_id: i64,
    pub email: String,
    /// Expiry in Unix seconds, when the token carries one
    #[serde(default, rename = "exp", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl AuthUser {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= unix_timestamp_now())
    }
}

/// Read the user out of a session token without verifying its signature.
///
/// The server verifies signatures; the client only needs the claims for
/// display and expiry checks.
pub fn decode_session_token(token: &str) -> Result<AuthUser> {
    let payload = token
        .split('.')
        .nth(1)
        .filter(|part| !part.is_empty())
        .ok_or_else(|| Error::Auth("session token is malformed".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|error| Error::Auth(format!("session token payload is not base64: {error}")))?;
    let user: AuthUser = serde_json::from_slice(&bytes)
        .map_err(|error| Error::Auth(format!("session token payload is invalid: {error}")))?;

    if user.is_expired() {
        return Err(Error::Auth("session token has expired".to_string()));
    }
    Ok(user)
}

/// Outcome carried in the fragment of the magic-link redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// `#auth-success?token=...`
    Success(String),
    /// `#auth-error?message=...`
    Failure(String),
}

/// Parse the verification redirect. Accepts a full URL or just the fragment.
///
/// Returns `None` when the fragment is not an auth callback.
#[must_use]
pub fn parse_callback(url_or_fragment: &str) -> Option<CallbackOutcome> {
    let fragment = url_or_fragment
        .split_once('#')
        .map_or(url_or_fragment, |(_, fragment)| fragment);
    let (route, query) = fragment.split_once('?').unwrap_or((fragment, ""));

    let find = |key: &str| {
        let url = reqwest::Url::parse(&format!("http://callback/?{query}")).ok()?;
        url.query_pairs()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    match route.trim_start_matches('/') {
        "auth-success" => find("token").map(CallbackOutcome::Success),
        "auth-error" => Some(CallbackOutcome::Failure(
            find("message").unwrap_or_else(|| "Authentication failed".to_string()),
        )),
        _ => None,
    }
}

/// Validate an email address before requesting a magic link
pub fn validate_email(email: &str) -> Result<String> {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    let pattern =
        EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("Invalid regex"));

    let email = email.trim().to_ascii_lowercase();
    if pattern.is_match(&email) {
        Ok(email)
    } else {
        Err(Error::Validation("Invalid email address".to_string()))
    }
}

/// Validate the shape of a magic-link token
pub fn validate_magic_token(token: &str) -> Result<&str> {
    let token = token.trim();
    if token.len() == MAGIC_TOKEN_LEN && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(token)
    } else {
        Err(Error::Validation("Invalid token format".to_string()))
    }
}

#[cfg(test)]
pub(crate) fn encode_test_token(user_id: i64, email: &str, exp: i64) -> String {
    let payload = serde_json::json!({ "userId": user_id, "email": email, "exp": exp });
    format!(
        "eyJhbGciOiJIUzI1NiJ9.{}.signature",
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}
