//! Local storage for StillMind
//!
//! [`LocalStore`] is the seam the sync engine and the UI talk to. Two backends
//! implement it: [`LibSqlLocalStore`](crate::services::LibSqlLocalStore) for
//! durable on-device storage and [`MemoryLocalStore`] as the degraded fallback
//! (and for tests).
//!
//! List-type reads fail open: a failed query is logged and yields an empty
//! result. Writes fail closed and return the error.

mod connection;
mod entry_repository;
mod memory;
mod migrations;
mod settings_repository;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use connection::Database;
pub use entry_repository::LibSqlEntryRepository;
pub use memory::MemoryLocalStore;
pub use settings_repository::{LibSqlSettingsRepository, SettingsRepository};

use crate::models::{Entry, EntryId, EntryRef, SyncConflict, Tombstone};
use crate::services::LibSqlLocalStore;
use crate::Result;

/// Setting holding the Unix-ms time of the last successful sync cycle
pub const LAST_SYNC_TIME_KEY: &str = "lastSyncTime";

/// Settings that belong to the signed-in user and are purged on logout
pub const USER_SCOPED_SETTINGS: [&str; 1] = [LAST_SYNC_TIME_KEY];

/// Durable CRUD over entries and opaque settings
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert or overwrite an entry by id after filling defaults.
    ///
    /// `last_modified` is stored as given; use [`Entry::set_content`] for
    /// local edits. A stored `server_id` is never cleared.
    async fn put(&self, entry: Entry) -> Result<EntryId>;

    async fn get(&self, id: EntryId) -> Result<Option<Entry>>;

    /// Entries ordered by `last_modified` descending
    async fn list(&self, limit: usize, offset: usize) -> Vec<Entry>;

    /// Delete an entry. Deleting a missing entry is not an error.
    async fn delete(&self, id: EntryId) -> Result<()>;

    /// Every entry whose status is not `synced`
    async fn list_unsynced(&self) -> Vec<Entry>;

    /// Mark the referenced entry synced.
    ///
    /// With `pushed_last_modified` set, the entry is only marked when its
    /// stored `last_modified` still equals that value, so an edit made after
    /// the push stays unsynced. Returns whether an entry was marked.
    async fn mark_synced(
        &self,
        reference: &EntryRef,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool>;

    /// Record the server id of an entry and mark it synced.
    ///
    /// The first assigned server id wins; a different later value is logged
    /// and ignored. The server id is always recorded, but the status only
    /// flips when `last_modified` still matches `pushed_last_modified`.
    /// Returns whether the entry exists.
    async fn set_server_id(
        &self,
        id: EntryId,
        server_id: i64,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool>;

    async fn get_setting(&self, key: &str) -> Result<Option<Value>>;

    async fn put_setting(&self, key: &str, value: Value) -> Result<()>;

    /// Deletions not yet confirmed by the server
    async fn list_tombstones(&self) -> Vec<Tombstone>;

    async fn clear_tombstone(&self, server_id: i64) -> Result<()>;

    async fn has_tombstone(&self, server_id: i64) -> bool {
        self.list_tombstones()
            .await
            .iter()
            .any(|tombstone| tombstone.server_id == server_id)
    }

    /// Log a pull-phase conflict the local copy won
    async fn record_conflict(
        &self,
        entry_id: EntryId,
        local_last_modified: i64,
        incoming_last_modified: i64,
    ) -> Result<()>;

    /// Most recent conflicts first
    async fn list_conflicts(&self, limit: usize) -> Vec<SyncConflict>;

    async fn count(&self) -> Result<usize>;

    /// Purge entries, tombstones, conflicts and user-scoped settings
    async fn clear_user_data(&self) -> Result<()>;
}

/// Open the durable store, degrading to memory when it is unavailable
pub async fn open_local_store(path: Option<&Path>) -> Arc<dyn LocalStore> {
    let Some(path) = path else {
        tracing::info!("No database path configured; entries are kept in memory");
        return Arc::new(MemoryLocalStore::new());
    };

    match LibSqlLocalStore::open(path).await {
        Ok(store) => Arc::new(store),
        Err(error) => {
            tracing::warn!(
                "Local database at {} unavailable, falling back to memory: {error}",
                path.display()
            );
            Arc::new(MemoryLocalStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn word_count_survives_save_and_reload() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("journal.db");

        let entry = Entry::new("  quiet   morning\nby the lake ");
        let id = {
            let store = open_local_store(Some(&path)).await;
            store.put(entry.clone()).await.unwrap()
        };

        let reopened = open_local_store(Some(&path)).await;
        let loaded = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.word_count, 5);
        assert_eq!(loaded.content, entry.content);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unusable_path_falls_back_to_memory() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let path = blocker.join("journal.db");

        let store = open_local_store(Some(&path)).await;
        let id = store.put(Entry::new("still saved")).await.unwrap();

        assert!(store.get(id).await.unwrap().is_some());
    }
}
