//! JSON payloads exchanged with the remote entry service.
//!
//! Shared by the HTTP client and the API server so both sides agree on field
//! names. Entry rows use `snake_case`; request bodies sent by clients use
//! `camelCase`.

use serde::{Deserialize, Serialize};

use crate::models::{new_client_id, word_count, Entry, EntryId, SyncStatus, Tombstone};

/// Entry as stored and returned by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Server-assigned id
    pub id: i64,
    /// Client creation timestamp; doubles as the local entry id
    pub timestamp: i64,
    #[serde(default)]
    pub duration: Option<u32>,
    pub entry: String,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub word_count: Option<u32>,
    pub created_at: i64,
    pub last_modified: i64,
}

impl RemoteEntry {
    /// Local id this remote row corresponds to
    #[must_use]
    pub const fn local_id(&self) -> EntryId {
        EntryId::from_millis(self.timestamp)
    }

    /// Build the local representation, keeping identities the device already
    /// assigned (`client_id`, `server_id`, `created_at`).
    #[must_use]
    pub fn into_local(self, existing: Option<&Entry>) -> Entry {
        let client_id = existing
            .map(|entry| entry.client_id.clone())
            .filter(|client_id| !client_id.trim().is_empty())
            .unwrap_or_else(new_client_id);
        let server_id = existing
            .and_then(|entry| entry.server_id)
            .or(Some(self.id));
        let created_at = existing
            .map(|entry| entry.created_at)
            .filter(|created_at| *created_at > 0)
            .unwrap_or(self.created_at);

        Entry {
            id: self.local_id(),
            client_id,
            server_id,
            word_count: word_count(&self.entry),
            content: self.entry,
            created_at,
            last_modified: self.last_modified.max(created_at),
            duration_minutes: self.duration.filter(|minutes| *minutes > 0),
            prompt_id: self.prompt_id,
            sync_status: SyncStatus::Synced,
        }
    }
}

/// One page of `GET /entries`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPage {
    pub entries: Vec<RemoteEntry>,
    pub count: usize,
    pub offset: usize,
}

/// What the server will do with a batch element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncItemKind {
    Create,
    Update,
    Delete,
}

/// Element of a `POST /entries/sync` batch: an entry or a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    /// Server id, present once the entry has been created remotely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl SyncItem {
    /// Batch element for a local entry
    #[must_use]
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            id: entry.server_id,
            client_id: Some(entry.client_id.clone()),
            timestamp: Some(entry.id.as_millis()),
            entry: Some(entry.content.clone()),
            duration: entry.duration_minutes,
            prompt_id: entry.prompt_id.clone(),
            created_at: Some(entry.created_at),
            last_modified: Some(entry.last_modified),
            deleted: false,
        }
    }

    /// Batch element deleting a server-side entry
    #[must_use]
    pub fn from_tombstone(tombstone: &Tombstone) -> Self {
        Self {
            id: Some(tombstone.server_id),
            timestamp: Some(tombstone.entry_id.as_millis()),
            deleted: true,
            ..Self::default()
        }
    }

    /// Classify the element the way the server dispatches it
    #[must_use]
    pub const fn kind(&self) -> SyncItemKind {
        if self.deleted {
            SyncItemKind::Delete
        } else if self.id.is_some() {
            SyncItemKind::Update
        } else {
            SyncItemKind::Create
        }
    }
}

/// Body of `POST /entries/sync`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    pub entries: Vec<SyncItem>,
}

/// Per-element outcome reported by the batch endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Created,
    Updated,
    Deleted,
    Error,
}

/// Result for one batch element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Server id of the affected entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub action: SyncAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    #[must_use]
    pub const fn created(client_id: Option<String>, id: i64) -> Self {
        Self {
            id: Some(id),
            client_id,
            action: SyncAction::Created,
            error: None,
        }
    }

    #[must_use]
    pub const fn updated(id: i64) -> Self {
        Self {
            id: Some(id),
            client_id: None,
            action: SyncAction::Updated,
            error: None,
        }
    }

    #[must_use]
    pub const fn deleted(id: i64) -> Self {
        Self {
            id: Some(id),
            client_id: None,
            action: SyncAction::Deleted,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(id: Option<i64>, client_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            client_id,
            action: SyncAction::Error,
            error: Some(error.into()),
        }
    }
}

/// Response of `POST /entries/sync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub results: Vec<SyncResult>,
}

/// Body of `POST /entries` and `PUT /entries/:id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

impl From<&Entry> for EntryPayload {
    fn from(entry: &Entry) -> Self {
        Self {
            timestamp: Some(entry.id.as_millis()),
            duration: entry.duration_minutes,
            entry: entry.content.clone(),
            prompt_id: entry.prompt_id.clone(),
        }
    }
}

/// Response of `POST /entries`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub success: bool,
    pub id: i64,
}

/// Generic `{success}` acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `POST /auth/request`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
}

/// API-client response of `GET /auth/verify`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub success: bool,
    pub token: String,
    pub email: String,
}

impl std::fmt::Debug for VerifyResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("VerifyResponse")
            .field("success", &self.success)
            .field("token", &"[REDACTED]")
            .field("email", &self.email)
            .finish()
    }
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
