//! Remote entry service client.

pub mod wire;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};

use crate::auth::{api_error, AuthSession};
use crate::{Error, Result};
use wire::{CreatedResponse, EntryPage, EntryPayload, RemoteEntry, SyncRequest, SyncResponse};

/// Page size used when pulling the full remote set
pub const PAGE_SIZE: usize = 100;

/// Authoritative per-user entry collection
#[async_trait]
pub trait RemoteEntryService: Send + Sync {
    /// One page, newest entry timestamp first
    async fn list_entries(&self, limit: usize, offset: usize) -> Result<EntryPage>;

    async fn get_entry(&self, id: i64) -> Result<Option<RemoteEntry>>;

    /// Create an entry and return its server id
    async fn create_entry(&self, payload: &EntryPayload) -> Result<i64>;

    async fn update_entry(&self, id: i64, payload: &EntryPayload) -> Result<()>;

    async fn delete_entry(&self, id: i64) -> Result<()>;

    /// Apply a batch of creates, updates and deletions
    async fn sync_batch(&self, request: &SyncRequest) -> Result<SyncResponse>;
}

/// Fetch every remote entry by walking pages until a short one
pub async fn fetch_all_entries(service: &dyn RemoteEntryService) -> Result<Vec<RemoteEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    loop {
        let page = service.list_entries(PAGE_SIZE, offset).await?;
        let received = page.entries.len();
        entries.extend(page.entries);
        if received < PAGE_SIZE {
            break;
        }
        offset += received;
    }
    tracing::debug!("Fetched {} remote entries", entries.len());
    Ok(entries)
}

/// HTTP implementation over an authenticated session
#[derive(Clone)]
pub struct HttpEntryService {
    session: Arc<AuthSession>,
}

impl HttpEntryService {
    pub const fn new(session: Arc<AuthSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl RemoteEntryService for HttpEntryService {
    async fn list_entries(&self, limit: usize, offset: usize) -> Result<EntryPage> {
        let response = self
            .session
            .authenticated_fetch(Method::GET, "/entries", |request| {
                request.query(&[("limit", limit), ("offset", offset)])
            })
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }

    async fn get_entry(&self, id: i64) -> Result<Option<RemoteEntry>> {
        let response = self
            .session
            .authenticated_fetch(Method::GET, &format!("/entries/{id}"), |request| request)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(api_error(response).await),
        }
    }

    async fn create_entry(&self, payload: &EntryPayload) -> Result<i64> {
        let response = self
            .session
            .authenticated_fetch(Method::POST, "/entries", |request| request.json(payload))
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let created: CreatedResponse = response.json().await?;
        Ok(created.id)
    }

    async fn update_entry(&self, id: i64, payload: &EntryPayload) -> Result<()> {
        let response = self
            .session
            .authenticated_fetch(Method::PUT, &format!("/entries/{id}"), |request| {
                request.json(payload)
            })
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("remote entry {id}"))),
            status if status.is_success() => Ok(()),
            _ => Err(api_error(response).await),
        }
    }

    async fn delete_entry(&self, id: i64) -> Result<()> {
        let response = self
            .session
            .authenticated_fetch(Method::DELETE, &format!("/entries/{id}"), |request| request)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("remote entry {id}"))),
            status if status.is_success() => Ok(()),
            _ => Err(api_error(response).await),
        }
    }

    async fn sync_batch(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let response = self
            .session
            .authenticated_fetch(Method::POST, "/entries/sync", |builder| {
                builder.json(request)
            })
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }
}
