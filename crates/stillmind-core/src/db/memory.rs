//! In-memory `LocalStore`

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{LocalStore, USER_SCOPED_SETTINGS};
use crate::models::{Entry, EntryId, EntryRef, SyncConflict, SyncStatus, Tombstone};
use crate::Result;

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<EntryId, Entry>,
    settings: HashMap<String, Value>,
    tombstones: BTreeMap<i64, Tombstone>,
    conflicts: Vec<SyncConflict>,
}

impl MemoryState {
    fn resolve(&self, reference: &EntryRef) -> Option<EntryId> {
        match reference {
            EntryRef::ById(id) => self.entries.contains_key(id).then_some(*id),
            EntryRef::ByClientId(client_id) => self
                .entries
                .values()
                .find(|entry| &entry.client_id == client_id)
                .map(|entry| entry.id),
            EntryRef::ByServerId(server_id) => self
                .entries
                .values()
                .find(|entry| entry.server_id == Some(*server_id))
                .map(|entry| entry.id),
        }
    }
}

fn unchanged_since(entry: &Entry, pushed_last_modified: Option<i64>) -> bool {
    match pushed_last_modified {
        Some(pushed) => entry.last_modified == pushed,
        None => true,
    }
}

/// Volatile store used when durable storage is unavailable
#[derive(Default)]
pub struct MemoryLocalStore {
    state: Mutex<MemoryState>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn put(&self, mut entry: Entry) -> Result<EntryId> {
        entry.validate()?;
        entry.fill_defaults();

        let mut state = self.state.lock().await;
        if let Some(existing) = state.entries.get(&entry.id) {
            entry.client_id.clone_from(&existing.client_id);
            if existing.server_id.is_some() {
                entry.server_id = existing.server_id;
            }
        }
        let id = entry.id;
        state.entries.insert(id, entry);
        Ok(id)
    }

    async fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn list(&self, limit: usize, offset: usize) -> Vec<Entry> {
        let state = self.state.lock().await;
        let mut entries: Vec<Entry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.id.cmp(&a.id))
        });
        entries.into_iter().skip(offset).take(limit).collect()
    }

    async fn delete(&self, id: EntryId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.remove(&id) {
            if let Some(server_id) = entry.server_id {
                state.tombstones.insert(
                    server_id,
                    Tombstone {
                        entry_id: id,
                        server_id,
                        deleted_at: chrono::Utc::now().timestamp_millis(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn list_unsynced(&self) -> Vec<Entry> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|entry| entry.needs_push())
            .cloned()
            .collect()
    }

    async fn mark_synced(
        &self,
        reference: &EntryRef,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(id) = state.resolve(reference) else {
            return Ok(false);
        };
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(false);
        };
        if !unchanged_since(entry, pushed_last_modified) {
            return Ok(false);
        }
        entry.sync_status = SyncStatus::Synced;
        Ok(true)
    }

    async fn set_server_id(
        &self,
        id: EntryId,
        server_id: i64,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(false);
        };
        match entry.server_id {
            Some(existing) if existing != server_id => {
                tracing::warn!(
                    "Entry {id} already has server id {existing}; ignoring {server_id}"
                );
            }
            _ => entry.server_id = Some(server_id),
        }
        if unchanged_since(entry, pushed_last_modified) {
            entry.sync_status = SyncStatus::Synced;
        }
        Ok(true)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: Value) -> Result<()> {
        self.state
            .lock()
            .await
            .settings
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn list_tombstones(&self) -> Vec<Tombstone> {
        let state = self.state.lock().await;
        let mut tombstones: Vec<Tombstone> = state.tombstones.values().cloned().collect();
        tombstones.sort_by_key(|tombstone| tombstone.deleted_at);
        tombstones
    }

    async fn clear_tombstone(&self, server_id: i64) -> Result<()> {
        self.state.lock().await.tombstones.remove(&server_id);
        Ok(())
    }

    async fn has_tombstone(&self, server_id: i64) -> bool {
        self.state.lock().await.tombstones.contains_key(&server_id)
    }

    async fn record_conflict(
        &self,
        entry_id: EntryId,
        local_last_modified: i64,
        incoming_last_modified: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = i64::try_from(state.conflicts.len()).unwrap_or(i64::MAX) + 1;
        state.conflicts.push(SyncConflict {
            id,
            entry_id,
            local_last_modified,
            incoming_last_modified,
            resolved_at: chrono::Utc::now().timestamp_millis(),
            strategy: "lww".to_string(),
        });
        Ok(())
    }

    async fn list_conflicts(&self, limit: usize) -> Vec<SyncConflict> {
        let state = self.state.lock().await;
        state.conflicts.iter().rev().take(limit).cloned().collect()
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.lock().await.entries.len())
    }

    async fn clear_user_data(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.tombstones.clear();
        state.conflicts.clear();
        for key in USER_SCOPED_SETTINGS {
            state.settings.remove(key);
        }
        Ok(())
    }
}
