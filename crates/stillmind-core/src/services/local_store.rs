//! Durable `LocalStore` backed by a libSQL database file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{
    Database, LibSqlEntryRepository, LibSqlSettingsRepository, LocalStore, SettingsRepository,
    USER_SCOPED_SETTINGS,
};
use crate::models::{Entry, EntryId, EntryRef, SyncConflict, Tombstone};
use crate::Result;

/// Thread-safe store wrapping a single libSQL connection.
#[derive(Clone)]
pub struct LibSqlLocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LibSqlLocalStore {
    /// Open the store at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh one created.
    pub async fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {error}. Moving it aside and starting fresh.",
                    db_path.display()
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };

        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));
            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local database from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            if file_name.to_string_lossy().starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale database sidecar {}", path.display());
            }
        }

        Ok(())
    }

    fn fail_open<T: Default>(operation: &str, result: Result<T>) -> T {
        result.unwrap_or_else(|error| {
            tracing::warn!("Local store {operation} failed, returning empty result: {error}");
            T::default()
        })
    }
}

#[async_trait]
impl LocalStore for LibSqlLocalStore {
    async fn put(&self, mut entry: Entry) -> Result<EntryId> {
        entry.validate()?;
        entry.fill_defaults();

        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection())
            .upsert(&entry)
            .await?;
        Ok(entry.id)
    }

    async fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection()).get(id).await
    }

    async fn list(&self, limit: usize, offset: usize) -> Vec<Entry> {
        let db = self.db.lock().await;
        let result = LibSqlEntryRepository::new(db.connection())
            .list(limit, offset)
            .await;
        Self::fail_open("list", result)
    }

    async fn delete(&self, id: EntryId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection()).delete(id).await
    }

    async fn list_unsynced(&self) -> Vec<Entry> {
        let db = self.db.lock().await;
        let result = LibSqlEntryRepository::new(db.connection())
            .list_unsynced()
            .await;
        Self::fail_open("list_unsynced", result)
    }

    async fn mark_synced(
        &self,
        reference: &EntryRef,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlEntryRepository::new(db.connection());
        match repo.resolve(reference).await? {
            Some(id) => repo.mark_synced(id, pushed_last_modified).await,
            None => Ok(false),
        }
    }

    async fn set_server_id(
        &self,
        id: EntryId,
        server_id: i64,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlEntryRepository::new(db.connection());
        let Some(existing) = repo.get(id).await? else {
            return Ok(false);
        };
        if let Some(current) = existing.server_id.filter(|current| *current != server_id) {
            tracing::warn!("Entry {id} already has server id {current}; ignoring {server_id}");
        }
        repo.set_server_id(id, server_id, pushed_last_modified)
            .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection())
            .get(key)
            .await
    }

    async fn put_setting(&self, key: &str, value: Value) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlSettingsRepository::new(db.connection())
            .set(key, &value)
            .await
    }

    async fn list_tombstones(&self) -> Vec<Tombstone> {
        let db = self.db.lock().await;
        let result = LibSqlEntryRepository::new(db.connection())
            .list_tombstones()
            .await;
        Self::fail_open("list_tombstones", result)
    }

    async fn clear_tombstone(&self, server_id: i64) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection())
            .remove_tombstone(server_id)
            .await
    }

    async fn record_conflict(
        &self,
        entry_id: EntryId,
        local_last_modified: i64,
        incoming_last_modified: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection())
            .record_conflict(entry_id, local_last_modified, incoming_last_modified)
            .await
    }

    async fn list_conflicts(&self, limit: usize) -> Vec<SyncConflict> {
        let db = self.db.lock().await;
        let result = LibSqlEntryRepository::new(db.connection())
            .list_conflicts(limit)
            .await;
        Self::fail_open("list_conflicts", result)
    }

    async fn count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection()).count().await
    }

    async fn clear_user_data(&self) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlEntryRepository::new(db.connection()).clear().await?;
        let settings = LibSqlSettingsRepository::new(db.connection());
        for key in USER_SCOPED_SETTINGS {
            settings.remove(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn put_list_and_unsynced_roundtrip() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();

        let draft = Entry::new("draft");
        let mut synced = Entry::new("already there");
        synced.server_id = Some(3);
        synced.sync_status = SyncStatus::Synced;
        store.put(draft.clone()).await.unwrap();
        store.put(synced).await.unwrap();

        assert_eq!(store.list(10, 0).await.len(), 2);
        let unsynced = store.list_unsynced().await;
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, draft.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_rejects_invalid_entries_before_writing() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();

        let error = store
            .put(Entry::new("x").with_duration(0))
            .await
            .unwrap_err();

        assert!(matches!(error, crate::Error::Validation(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_server_id_keeps_first_value() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let entry = Entry::new("x");
        store.put(entry.clone()).await.unwrap();

        assert!(store.set_server_id(entry.id, 11, None).await.unwrap());
        assert!(store.set_server_id(entry.id, 12, None).await.unwrap());

        let stored = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.server_id, Some(11));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_acknowledgement_does_not_hide_a_newer_edit() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let mut entry = Entry::new("before push");
        store.put(entry.clone()).await.unwrap();
        let pushed = entry.last_modified;

        entry.set_content("edited while pushing");
        store.put(entry.clone()).await.unwrap();

        assert!(store.set_server_id(entry.id, 21, Some(pushed)).await.unwrap());
        assert!(!store
            .mark_synced(&EntryRef::ById(entry.id), Some(pushed))
            .await
            .unwrap());
        let stored = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.server_id, Some(21));
        assert_eq!(stored.sync_status, SyncStatus::Local);

        assert!(store
            .mark_synced(&EntryRef::ByServerId(21), Some(stored.last_modified))
            .await
            .unwrap());
        assert!(store.list_unsynced().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_user_data_purges_entries_and_sync_time() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let mut entry = Entry::new("x");
        entry.server_id = Some(4);
        store.put(entry.clone()).await.unwrap();
        store.delete(entry.id).await.unwrap();
        store.put(Entry::new("y")).await.unwrap();
        store
            .put_setting(crate::db::LAST_SYNC_TIME_KEY, json!(99))
            .await
            .unwrap();
        store.put_setting("theme", json!("dark")).await.unwrap();

        store.clear_user_data().await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.list_tombstones().await.is_empty());
        assert_eq!(
            store
                .get_setting(crate::db::LAST_SYNC_TIME_KEY)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            store.get_setting("theme").await.unwrap(),
            Some(json!("dark"))
        );
    }

    #[test]
    fn detects_corrupted_database_errors() {
        assert!(LibSqlLocalStore::is_corrupted_db_error(
            &crate::Error::Database("SQLite failure: file is not a database".to_string())
        ));
        assert!(!LibSqlLocalStore::is_corrupted_db_error(
            &crate::Error::Validation("duration must be positive".to_string())
        ));
    }

    #[test]
    fn quarantine_moves_db_and_removes_sidecars() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("journal.db");
        let wal_path = tmp.path().join("journal.db-wal");
        let shm_path = tmp.path().join("journal.db-shm");

        std::fs::write(&db_path, b"bad-db").unwrap();
        std::fs::write(&wal_path, b"wal").unwrap();
        std::fs::write(&shm_path, b"shm").unwrap();

        LibSqlLocalStore::quarantine_corrupted_db_files(&db_path).unwrap();

        assert!(!db_path.exists());
        assert!(!wal_path.exists());
        assert!(!shm_path.exists());

        let found_backup = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .any(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("journal.db.corrupt-")
            });
        assert!(found_backup);
    }
}
