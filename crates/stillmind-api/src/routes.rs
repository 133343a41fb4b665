use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use stillmind_core::auth::{validate_email, validate_magic_token};
use stillmind_core::remote::wire::{
    CreatedResponse, EntryPage, EntryPayload, RemoteEntry, SuccessResponse, SyncItem,
    SyncItemKind, SyncResponse, SyncResult, VerifyResponse,
};
use stillmind_core::util::unix_millis_now;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, generate_magic_token, AuthenticatedUser, SessionKeys};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::mailer::MagicLinkMailer;
use crate::rate_limit::{AuthRateLimiter, RateLimitMetricsSnapshot};
use crate::store::{EntryStore, EntryWrite, UpdateOutcome, User};

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: Arc<EntryStore>,
    sessions: Arc<SessionKeys>,
    mailer: Arc<dyn MagicLinkMailer>,
    auth_rate_limiter: Arc<AuthRateLimiter>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<EntryStore>,
        mailer: Arc<dyn MagicLinkMailer>,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionKeys::from_config(&config)),
            auth_rate_limiter: Arc::new(AuthRateLimiter::from_config(&config)),
            config,
            store,
            mailer,
        }
    }
}

/// Client address used to key the auth rate limit
#[derive(Debug, Clone)]
struct ClientAddress(String);

pub fn app_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/auth/request", post(request_magic_link))
        .route("/auth/verify", get(verify_magic_link))
        .route("/auth/logout", post(logout))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_auth));

    let entry_routes = Router::new()
        .route("/entries", get(list_entries).post(create_entry))
        .route("/entries/sync", post(sync_entries))
        .route(
            "/entries/{id}",
            get(get_entry).put(update_entry).delete(delete_entry),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(auth_routes)
        .merge(entry_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    auth_rate_limit: RateLimitMetricsSnapshot,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: unix_millis_now(),
        auth_rate_limit: state.auth_rate_limiter.metrics_snapshot(),
    })
}

async fn limit_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string());
    state.auth_rate_limiter.check(&client).await?;
    request.extensions_mut().insert(ClientAddress(client));
    Ok(next.run(request).await)
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let claims = state.sessions.verify(token)?;
    let user = state
        .store
        .find_user_by_email(&claims.email)
        .await?
        .filter(|user| user.id == claims.user_id)
        .ok_or_else(|| AppError::forbidden("User not found"))?;
    request
        .extensions_mut()
        .insert(AuthenticatedUser { user_id: user.id });
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct MagicLinkBody {
    #[serde(default)]
    email: String,
}

async fn request_magic_link(
    State(state): State<AppState>,
    Extension(client): Extension<ClientAddress>,
    Json(body): Json<MagicLinkBody>,
) -> Result<Json<SuccessResponse>, AppError> {
    let email =
        validate_email(&body.email).map_err(|_| AppError::bad_request("Valid email required"))?;

    let now = unix_millis_now();
    let removed = state.store.delete_expired_tokens(now).await?;
    if removed > 0 {
        tracing::debug!("Removed {removed} expired magic-link tokens");
    }

    state.store.upsert_user(&email, now).await?;
    let token = generate_magic_token();
    let ttl_ms = i64::try_from(state.config.magic_link_ttl.as_millis()).unwrap_or(i64::MAX);
    state
        .store
        .save_magic_token(
            &token,
            &email,
            now.saturating_add(ttl_ms),
            now,
            Some(&client.0),
        )
        .await?;

    let link = format!(
        "{}/api/auth/verify?token={token}",
        state.config.frontend_url
    );
    state.mailer.send_magic_link(&email, &link).await?;

    Ok(Json(SuccessResponse {
        success: true,
        message: Some("Magic link sent to your email address".to_string()),
    }))
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    token: Option<String>,
}

async fn verify_magic_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VerifyQuery>,
) -> Result<Response, AppError> {
    let token = query
        .token
        .as_deref()
        .and_then(|token| validate_magic_token(token).ok())
        .ok_or_else(|| AppError::bad_request("Invalid token format"))?;

    let now = unix_millis_now();
    let email = state
        .store
        .consume_magic_token(token, now)
        .await?
        .map_err(|rejection| AppError::bad_request(rejection.message()))?;

    let user = match state.store.find_user_by_email(&email).await? {
        Some(user) => user,
        None => User {
            id: state.store.upsert_user(&email, now).await?,
            email,
        },
    };
    let session_token = state.sessions.issue(user.id, &user.email)?;
    tracing::info!(user = user.id, "Magic link verified");

    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));
    if wants_html {
        let location = format!(
            "{}/#auth-success?token={session_token}",
            state.config.frontend_url
        );
        return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
    }

    Ok(Json(VerifyResponse {
        success: true,
        token: session_token,
        email: user.email,
    })
    .into_response())
}

async fn logout() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        success: true,
        message: Some("Logged out".to_string()),
    })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_entries(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<EntryPage>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let entries = state.store.list_entries(user.user_id, limit, offset).await?;

    Ok(Json(EntryPage {
        count: entries.len(),
        entries,
        offset: usize::try_from(offset).unwrap_or(usize::MAX),
    }))
}

async fn get_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> Result<Json<RemoteEntry>, AppError> {
    state
        .store
        .get_entry(user.user_id, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Entry not found"))
}

async fn create_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<EntryPayload>,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let content = required_content(Some(&payload.entry))?;
    let now = unix_millis_now();
    let timestamp = payload.timestamp.unwrap_or(now);
    let write = EntryWrite {
        client_id: None,
        timestamp,
        duration: payload.duration.filter(|minutes| *minutes > 0),
        entry: content,
        prompt_id: payload.prompt_id,
        created_at: timestamp,
        last_modified: now.max(timestamp),
    };
    let id = state.store.create_entry(user.user_id, &write).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse { success: true, id }),
    ))
}

async fn update_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
    Json(payload): Json<EntryPayload>,
) -> Result<Json<SuccessResponse>, AppError> {
    let content = required_content(Some(&payload.entry))?;
    let now = unix_millis_now();
    let write = EntryWrite {
        client_id: None,
        timestamp: payload.timestamp.unwrap_or(now),
        duration: payload.duration.filter(|minutes| *minutes > 0),
        entry: content,
        prompt_id: payload.prompt_id,
        created_at: now,
        last_modified: now,
    };
    match state.store.update_entry(user.user_id, id, &write).await? {
        UpdateOutcome::NotFound => Err(AppError::not_found("Entry not found")),
        UpdateOutcome::Applied | UpdateOutcome::Stale => Ok(Json(SuccessResponse {
            success: true,
            message: None,
        })),
    }
}

async fn delete_entry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse>, AppError> {
    if !state.store.delete_entry(user.user_id, id).await? {
        return Err(AppError::not_found("Entry not found"));
    }
    Ok(Json(SuccessResponse {
        success: true,
        message: None,
    }))
}

#[derive(Debug, Deserialize)]
struct SyncBody {
    entries: Option<Vec<SyncItem>>,
}

async fn sync_entries(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<SyncBody>,
) -> Result<Json<SyncResponse>, AppError> {
    let items = body
        .entries
        .ok_or_else(|| AppError::bad_request("Entries array required"))?;

    let mut results = Vec::with_capacity(items.len());
    for item in &items {
        let result = match apply_sync_item(&state.store, user.user_id, item).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(user = user.user_id, "Sync element failed: {error}");
                SyncResult::failed(item.id, item.client_id.clone(), error.to_string())
            }
        };
        results.push(result);
    }

    tracing::info!(
        user = user.user_id,
        elements = items.len(),
        "Processed sync batch"
    );
    Ok(Json(SyncResponse {
        success: true,
        results,
    }))
}

async fn apply_sync_item(
    store: &EntryStore,
    user_id: i64,
    item: &SyncItem,
) -> Result<SyncResult, AppError> {
    let now = unix_millis_now();
    match item.kind() {
        SyncItemKind::Delete => {
            let Some(id) = item.id else {
                return Ok(SyncResult::failed(
                    None,
                    item.client_id.clone(),
                    "Entry id required",
                ));
            };
            // Already gone counts as deleted so the client drops its tombstone
            store.delete_entry(user_id, id).await?;
            Ok(SyncResult::deleted(id))
        }
        SyncItemKind::Update => {
            let id = item.id.unwrap_or_default();
            let content = match required_content(item.entry.as_deref()) {
                Ok(content) => content,
                Err(error) => {
                    return Ok(SyncResult::failed(
                        Some(id),
                        item.client_id.clone(),
                        error.to_string(),
                    ))
                }
            };
            let write = sync_write(item, content, now);
            match store.update_entry(user_id, id, &write).await? {
                UpdateOutcome::NotFound => Ok(SyncResult::failed(
                    Some(id),
                    item.client_id.clone(),
                    "Entry not found",
                )),
                UpdateOutcome::Applied | UpdateOutcome::Stale => Ok(SyncResult::updated(id)),
            }
        }
        SyncItemKind::Create => {
            let content = match required_content(item.entry.as_deref()) {
                Ok(content) => content,
                Err(error) => {
                    return Ok(SyncResult::failed(
                        None,
                        item.client_id.clone(),
                        error.to_string(),
                    ))
                }
            };
            let write = sync_write(item, content, now);
            let id = store.create_entry(user_id, &write).await?;
            Ok(SyncResult::created(item.client_id.clone(), id))
        }
    }
}

fn sync_write(item: &SyncItem, entry: String, now: i64) -> EntryWrite {
    let timestamp = item.timestamp.unwrap_or(now);
    let created_at = item.created_at.unwrap_or(timestamp);
    EntryWrite {
        client_id: item.client_id.clone(),
        timestamp,
        duration: item.duration.filter(|minutes| *minutes > 0),
        entry,
        prompt_id: item.prompt_id.clone(),
        created_at,
        last_modified: item.last_modified.unwrap_or(now).max(created_at),
    }
}

fn required_content(entry: Option<&str>) -> Result<String, AppError> {
    entry
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("Entry content is required"))
}
