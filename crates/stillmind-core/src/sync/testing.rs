//! In-process remote used by engine and scheduler tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::auth::{encode_test_token, AuthSession, MemorySessionStore};
use crate::db::{LocalStore, MemoryLocalStore};
use crate::models::{word_count, Entry, EntryId, EntryRef, SyncConflict, Tombstone};
use crate::remote::wire::{
    EntryPage, EntryPayload, RemoteEntry, SyncItem, SyncItemKind, SyncRequest, SyncResponse,
    SyncResult,
};
use crate::remote::RemoteEntryService;
use crate::util::unix_timestamp_now;
use crate::{Error, Result};

#[derive(Default)]
pub struct FakeRemote {
    pub entries: Mutex<Vec<RemoteEntry>>,
    pub batches: Mutex<Vec<SyncRequest>>,
    pub list_calls: Mutex<usize>,
    /// Client ids whose create is answered with an error result
    pub reject_client_ids: Mutex<HashSet<String>>,
    pub fail_batches: Mutex<bool>,
    /// When set, `list_entries` waits for a permit
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn seed(&self, entry: RemoteEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn list_count(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    fn apply(&self, item: &SyncItem) -> SyncResult {
        let mut entries = self.entries.lock().unwrap();
        match item.kind() {
            SyncItemKind::Create => {
                let client_id = item.client_id.clone();
                if client_id
                    .as_ref()
                    .is_some_and(|id| self.reject_client_ids.lock().unwrap().contains(id))
                {
                    return SyncResult::failed(None, client_id, "rejected");
                }
                let id = i64::try_from(entries.len()).unwrap() + 1;
                let content = item.entry.clone().unwrap_or_default();
                entries.push(RemoteEntry {
                    id,
                    timestamp: item.timestamp.unwrap_or_default(),
                    duration: item.duration,
                    word_count: Some(word_count(&content)),
                    entry: content,
                    prompt_id: item.prompt_id.clone(),
                    created_at: item.created_at.unwrap_or_default(),
                    last_modified: item.last_modified.unwrap_or_default(),
                });
                SyncResult::created(client_id, id)
            }
            SyncItemKind::Update => {
                let id = item.id.unwrap_or_default();
                match entries.iter_mut().find(|entry| entry.id == id) {
                    Some(entry) => {
                        entry.entry = item.entry.clone().unwrap_or_default();
                        entry.last_modified = item.last_modified.unwrap_or_default();
                        SyncResult::updated(id)
                    }
                    None => SyncResult::failed(Some(id), None, "Entry not found"),
                }
            }
            SyncItemKind::Delete => {
                let id = item.id.unwrap_or_default();
                entries.retain(|entry| entry.id != id);
                SyncResult::deleted(id)
            }
        }
    }
}

#[async_trait]
impl RemoteEntryService for FakeRemote {
    async fn list_entries(&self, limit: usize, offset: usize) -> Result<EntryPage> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| Error::api(503, "closed"))?
                .forget();
        }
        *self.list_calls.lock().unwrap() += 1;
        let mut entries = self.entries.lock().unwrap().clone();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let page: Vec<RemoteEntry> = entries.into_iter().skip(offset).take(limit).collect();
        Ok(EntryPage {
            count: page.len(),
            entries: page,
            offset,
        })
    }

    async fn get_entry(&self, id: i64) -> Result<Option<RemoteEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.id == id)
            .cloned())
    }

    async fn create_entry(&self, payload: &EntryPayload) -> Result<i64> {
        let item = SyncItem {
            timestamp: payload.timestamp,
            entry: Some(payload.entry.clone()),
            ..SyncItem::default()
        };
        Ok(self.apply(&item).id.unwrap_or_default())
    }

    async fn update_entry(&self, id: i64, payload: &EntryPayload) -> Result<()> {
        let item = SyncItem {
            id: Some(id),
            entry: Some(payload.entry.clone()),
            ..SyncItem::default()
        };
        self.apply(&item);
        Ok(())
    }

    async fn delete_entry(&self, id: i64) -> Result<()> {
        let item = SyncItem {
            id: Some(id),
            deleted: true,
            ..SyncItem::default()
        };
        self.apply(&item);
        Ok(())
    }

    async fn sync_batch(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.batches.lock().unwrap().push(request.clone());
        if *self.fail_batches.lock().unwrap() {
            return Err(Error::api(503, "Service unavailable"));
        }
        let results = request.entries.iter().map(|item| self.apply(item)).collect();
        Ok(SyncResponse {
            success: true,
            results,
        })
    }
}

/// Memory store whose writes for one entry id fail until cleared
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryLocalStore,
    pub fail_put: Mutex<Option<EntryId>>,
}

#[async_trait]
impl LocalStore for FailingStore {
    async fn put(&self, entry: Entry) -> Result<EntryId> {
        if *self.fail_put.lock().unwrap() == Some(entry.id) {
            return Err(Error::Database("disk I/O error".to_string()));
        }
        self.inner.put(entry).await
    }

    async fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        self.inner.get(id).await
    }

    async fn list(&self, limit: usize, offset: usize) -> Vec<Entry> {
        self.inner.list(limit, offset).await
    }

    async fn delete(&self, id: EntryId) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn list_unsynced(&self) -> Vec<Entry> {
        self.inner.list_unsynced().await
    }

    async fn mark_synced(
        &self,
        reference: &EntryRef,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        self.inner.mark_synced(reference, pushed_last_modified).await
    }

    async fn set_server_id(
        &self,
        id: EntryId,
        server_id: i64,
        pushed_last_modified: Option<i64>,
    ) -> Result<bool> {
        self.inner
            .set_server_id(id, server_id, pushed_last_modified)
            .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get_setting(key).await
    }

    async fn put_setting(&self, key: &str, value: Value) -> Result<()> {
        self.inner.put_setting(key, value).await
    }

    async fn list_tombstones(&self) -> Vec<Tombstone> {
        self.inner.list_tombstones().await
    }

    async fn clear_tombstone(&self, server_id: i64) -> Result<()> {
        self.inner.clear_tombstone(server_id).await
    }

    async fn record_conflict(
        &self,
        entry_id: EntryId,
        local_last_modified: i64,
        incoming_last_modified: i64,
    ) -> Result<()> {
        self.inner
            .record_conflict(entry_id, local_last_modified, incoming_last_modified)
            .await
    }

    async fn list_conflicts(&self, limit: usize) -> Vec<SyncConflict> {
        self.inner.list_conflicts(limit).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn clear_user_data(&self) -> Result<()> {
        self.inner.clear_user_data().await
    }
}

pub fn signed_in_session() -> Arc<AuthSession> {
    let session = AuthSession::new(
        "http://127.0.0.1:9",
        reqwest::Client::new(),
        Arc::new(MemorySessionStore::new()),
    );
    session
        .sign_in_with_token(&encode_test_token(
            1,
            "me@example.com",
            unix_timestamp_now() + 3_600,
        ))
        .unwrap();
    Arc::new(session)
}

pub fn remote_entry(id: i64, timestamp: i64, last_modified: i64, content: &str) -> RemoteEntry {
    RemoteEntry {
        id,
        timestamp,
        duration: None,
        entry: content.to_string(),
        prompt_id: None,
        word_count: Some(word_count(content)),
        created_at: timestamp,
        last_modified,
    }
}
