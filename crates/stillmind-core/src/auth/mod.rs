//! Client side of the magic-link session.
//!
//! [`AuthSession`] owns the bearer credential. Every authenticated request
//! goes through [`AuthSession::authenticated_fetch`], which invalidates the
//! session as soon as the server answers 401 or 403.

mod persistence;
mod token;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use tokio::sync::watch;

pub use persistence::{FileSessionStore, MemorySessionStore, SessionPersistence};
pub use token::{
    decode_session_token, parse_callback, validate_email, validate_magic_token, AuthUser,
    CallbackOutcome, MAGIC_TOKEN_LEN,
};

#[cfg(test)]
pub(crate) use token::encode_test_token;

use crate::connectivity::{OutboundRequest, RequestReplayer};
use crate::db::LocalStore;
use crate::remote::wire::{ErrorBody, MagicLinkRequest, SuccessResponse, VerifyResponse};
use crate::util::compact_text;
use crate::{Error, Result};

#[derive(Clone)]
struct Credential {
    token: String,
    user: AuthUser,
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("user", &self.user)
            .finish()
    }
}

/// Bearer session against the remote entry service
pub struct AuthSession {
    base_url: String,
    client: Client,
    persistence: Arc<dyn SessionPersistence>,
    credential: RwLock<Option<Credential>>,
    state: watch::Sender<bool>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthSession")
            .field("base_url", &self.base_url)
            .field("credential", &*self.read_credential())
            .finish_non_exhaustive()
    }
}

impl AuthSession {
    /// Create a session, restoring a persisted token when it is still valid
    pub fn new(
        base_url: impl AsRef<str>,
        client: Client,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Self {
        let credential = match persistence.load_token() {
            Ok(Some(token)) => match decode_session_token(&token) {
                Ok(user) => Some(Credential { token, user }),
                Err(error) => {
                    tracing::info!("Discarding persisted session: {error}");
                    if let Err(error) = persistence.clear_token() {
                        tracing::warn!("Failed to clear persisted session: {error}");
                    }
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                tracing::warn!("Failed to load persisted session: {error}");
                None
            }
        };

        let (state, _) = watch::channel(credential.is_some());
        Self {
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            client,
            persistence,
            credential: RwLock::new(credential),
            state,
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.read_credential().is_some()
    }

    /// User of the current session
    #[must_use]
    pub fn current_user(&self) -> Option<AuthUser> {
        self.read_credential()
            .as_ref()
            .map(|credential| credential.user.clone())
    }

    /// Observe sign-in and sign-out transitions
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Ask the server to email a magic link
    pub async fn request_magic_link(&self, email: &str) -> Result<String> {
        let email = validate_email(email)?;
        let response = self
            .client
            .post(self.url("/auth/request"))
            .json(&MagicLinkRequest { email })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body: SuccessResponse = response.json().await?;
        Ok(body
            .message
            .unwrap_or_else(|| "Check your email for the login link".to_string()))
    }

    /// Exchange a magic-link token for a session
    pub async fn verify_magic_link(&self, token: &str) -> Result<AuthUser> {
        let token = validate_magic_token(token)?;
        let response = self
            .client
            .get(self.url("/auth/verify"))
            .query(&[("token", token)])
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(match api_error(response).await {
                Error::Api { message, .. } => Error::Auth(message),
                other => other,
            });
        }
        let body: VerifyResponse = response.json().await?;
        self.sign_in_with_token(&body.token)
    }

    /// Finish sign-in from the verification redirect URL.
    ///
    /// Returns `Ok(None)` when the URL is not an auth callback.
    pub fn complete_callback(&self, url: &str) -> Result<Option<AuthUser>> {
        match parse_callback(url) {
            Some(CallbackOutcome::Success(token)) => self.sign_in_with_token(&token).map(Some),
            Some(CallbackOutcome::Failure(message)) => Err(Error::Auth(message)),
            None => Ok(None),
        }
    }

    /// Adopt a session token issued by the server
    pub fn sign_in_with_token(&self, token: &str) -> Result<AuthUser> {
        let user = decode_session_token(token)?;
        self.persistence.save_token(token)?;
        *self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Credential {
            token: token.to_string(),
            user: user.clone(),
        });
        self.state.send_replace(true);
        tracing::info!("Signed in as user {}", user.user_id);
        Ok(user)
    }

    /// Send a request with the bearer credential attached.
    ///
    /// A 401 or 403 answer invalidates the session and yields
    /// [`Error::SessionExpired`]; callers must not retry it. Other statuses are
    /// returned to the caller untouched.
    pub async fn authenticated_fetch<F>(
        &self,
        method: Method,
        path: &str,
        build: F,
    ) -> Result<Response>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let token = self.token().ok_or(Error::NotAuthenticated)?;
        let request = build(self.client.request(method, self.url(path)).bearer_auth(token));
        let response = request.send().await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            tracing::warn!(
                "Server rejected credential with {}; signing out",
                response.status()
            );
            self.invalidate();
            return Err(Error::SessionExpired);
        }
        Ok(response)
    }

    /// Drop the credential and cached user without touching local entries
    pub fn invalidate(&self) {
        let had_credential = self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if let Err(error) = self.persistence.clear_token() {
            tracing::warn!("Failed to clear persisted session: {error}");
        }
        if had_credential {
            self.state.send_replace(false);
        }
    }

    /// Sign out and purge the signed-in user's data from the local store
    pub async fn logout(&self, store: &dyn LocalStore) -> Result<()> {
        if let Some(token) = self.token() {
            let result = self
                .client
                .post(self.url("/auth/logout"))
                .bearer_auth(token)
                .send()
                .await;
            if let Err(error) = result {
                tracing::debug!("Logout request failed, continuing locally: {error}");
            }
        }

        self.invalidate();
        store.clear_user_data().await?;
        tracing::info!("Logged out and cleared local journal data");
        Ok(())
    }

    fn token(&self) -> Option<String> {
        self.read_credential()
            .as_ref()
            .map(|credential| credential.token.clone())
    }

    fn read_credential(&self) -> std::sync::RwLockReadGuard<'_, Option<Credential>> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl RequestReplayer for AuthSession {
    async fn replay(&self, request: &OutboundRequest) -> Result<()> {
        let body = request.body.clone();
        let response = self
            .authenticated_fetch(request.method.clone(), &request.path, move |builder| {
                match body {
                    Some(body) => builder.json(&body),
                    None => builder,
                }
            })
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }
}

/// Turn a non-success response into [`Error::Api`]
pub(crate) async fn api_error(response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::api(status.as_u16(), parse_api_error(status, &body))
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if !payload.error.trim().is_empty() {
            return payload.error.trim().to_string();
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}
