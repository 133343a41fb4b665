//! Journal entry model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

static LAST_ISSUED_ID: AtomicI64 = AtomicI64::new(0);

/// Local identity of an entry: its creation time in Unix milliseconds.
///
/// Ids handed out by [`EntryId::next`] strictly increase within a process even
/// when two entries are created within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(i64);

impl EntryId {
    /// Wrap an existing millisecond timestamp
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Issue a fresh id based on the current time
    #[must_use]
    pub fn next() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = LAST_ISSUED_ID.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match LAST_ISSUED_ID.compare_exchange_weak(
                last,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Self(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// Raw millisecond value
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Where an entry stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Created or modified locally and not yet pushed
    #[default]
    Local,
    /// Created while the device was known to be disconnected
    Offline,
    /// Matches, or has been reconciled with, server state
    Synced,
}

impl SyncStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Offline => "offline",
            Self::Synced => "synced",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "local" => Some(Self::Local),
            "offline" => Some(Self::Offline),
            "synced" => Some(Self::Synced),
            _ => None,
        }
    }
}

/// A journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Local identity (creation time in Unix ms)
    pub id: EntryId,
    /// Correlation id for the first push, assigned once
    pub client_id: String,
    /// Canonical id assigned by the server after the first push
    pub server_id: Option<i64>,
    /// Free-form text body
    pub content: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Timestamp of the most recent mutation (Unix ms)
    pub last_modified: i64,
    /// Optional writing duration annotation
    pub duration_minutes: Option<u32>,
    /// Optional reference to the prompt that inspired the entry
    pub prompt_id: Option<String>,
    /// Whitespace-delimited token count of `content`
    pub word_count: u32,
    /// Sync state relative to the server
    pub sync_status: SyncStatus,
}

impl Entry {
    /// Create a new local entry with the given content
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        let id = EntryId::next();
        let content = content.into();
        Self {
            id,
            client_id: new_client_id(),
            server_id: None,
            word_count: word_count(&content),
            content,
            created_at: id.as_millis(),
            last_modified: id.as_millis(),
            duration_minutes: None,
            prompt_id: None,
            sync_status: SyncStatus::Local,
        }
    }

    /// Create a new entry written while the device was offline
    #[must_use]
    pub fn new_offline(content: impl Into<String>) -> Self {
        Self {
            sync_status: SyncStatus::Offline,
            ..Self::new(content)
        }
    }

    /// Attach a writing duration
    #[must_use]
    pub const fn with_duration(mut self, minutes: u32) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }

    /// Attach a prompt reference
    #[must_use]
    pub fn with_prompt(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = Some(prompt_id.into());
        self
    }

    /// Replace the content as a local edit.
    ///
    /// Bumps `last_modified`, recomputes `word_count` and marks the entry for
    /// the next push.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.word_count = word_count(&self.content);
        self.last_modified = chrono::Utc::now()
            .timestamp_millis()
            .max(self.last_modified.saturating_add(1));
        self.sync_status = SyncStatus::Local;
    }

    /// Fill derived and missing fields before the entry is persisted
    pub fn fill_defaults(&mut self) {
        if self.created_at <= 0 {
            self.created_at = self.id.as_millis();
        }
        if self.last_modified < self.created_at {
            self.last_modified = self.created_at;
        }
        if self.client_id.trim().is_empty() {
            self.client_id = new_client_id();
        }
        self.word_count = word_count(&self.content);
    }

    /// Reject entries that must never reach storage
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.as_millis() <= 0 {
            return Err(crate::Error::Validation(
                "entry id must be a positive timestamp".to_string(),
            ));
        }
        if self.duration_minutes == Some(0) {
            return Err(crate::Error::Validation(
                "duration must be a positive number of minutes".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the entry still has changes the server has not seen
    #[must_use]
    pub fn needs_push(&self) -> bool {
        self.sync_status != SyncStatus::Synced
    }

    /// Check if entry content is empty (whitespace-only counts as empty)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Reference to a stored entry by any of its identities
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    ById(EntryId),
    ByClientId(String),
    ByServerId(i64),
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ById(id) => write!(f, "id {id}"),
            Self::ByClientId(client_id) => write!(f, "client id {client_id}"),
            Self::ByServerId(server_id) => write!(f, "server id {server_id}"),
        }
    }
}

/// Pending deletion of an entry the server already knows about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Local id of the deleted entry
    pub entry_id: EntryId,
    /// Server id to delete remotely
    pub server_id: i64,
    /// Deletion timestamp (Unix ms)
    pub deleted_at: i64,
}

/// Count whitespace-delimited non-empty tokens
///
/// # Examples
///
/// ```
/// use stillmind_core::models::word_count;
///
/// assert_eq!(word_count("  hello   world \n"), 2);
/// assert_eq!(word_count(""), 0);
/// ```
#[must_use]
pub fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

/// Generate an opaque client correlation id
#[must_use]
pub fn new_client_id() -> String {
    format!("local_{}", Uuid::now_v7().simple())
}
