//! Sync engine: reconciles the local store with the remote entry service.
//!
//! A cycle pushes every unsynced entry and pending tombstone in one batch,
//! then pulls the full remote set and merges it last-write-wins. Only one
//! cycle runs at a time; a concurrent request is a silent no-op.

pub mod merge;
mod scheduler;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;

pub use merge::{decide, MergeDecision};
pub use scheduler::SyncScheduler;

use crate::auth::AuthSession;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{LocalStore, LAST_SYNC_TIME_KEY};
use crate::models::{Entry, EntryId, EntryRef};
use crate::remote::wire::{SyncAction, SyncItem, SyncRequest, SyncResult};
use crate::remote::{fetch_all_entries, RemoteEntryService};
use crate::state::{SyncIndicator, SyncState};
use crate::util::unix_millis_now;
use crate::{Error, Result};

/// Why a requested cycle did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAuthenticated,
    AlreadyRunning,
    Offline,
}

/// Counts from one completed cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Push was skipped because nothing changed since the last sync
    pub push_skipped: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Batch elements the server reported as errors
    pub failed: usize,
    /// Remote entries seen during the pull
    pub pulled: usize,
    /// Remote entries written locally
    pub merged: usize,
    /// Remote entries discarded because the local copy was newer
    pub conflicts_ignored: usize,
    /// Unix ms recorded as `lastSyncTime`
    pub finished_at: i64,
}

/// Result of a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(SyncReport),
}

/// Local id and `last_modified` of an entry as it was sent
#[derive(Clone, Copy)]
struct Pushed {
    id: EntryId,
    last_modified: i64,
}

impl Pushed {
    const fn of(entry: &Entry) -> Self {
        Self {
            id: entry.id,
            last_modified: entry.last_modified,
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Bridges the local store and the remote entry service
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteEntryService>,
    auth: Arc<AuthSession>,
    connectivity: Option<ConnectivityMonitor>,
    running: AtomicBool,
    status: watch::Sender<SyncIndicator>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteEntryService>,
        auth: Arc<AuthSession>,
    ) -> Self {
        let (status, _) = watch::channel(SyncIndicator::new(true));
        Self {
            store,
            remote,
            auth,
            connectivity: None,
            running: AtomicBool::new(false),
            status,
        }
    }

    /// Skip cycles while the monitor reports the device offline
    #[must_use]
    pub fn with_connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.status
            .send_modify(|indicator| indicator.set_online(monitor.is_online()));
        self.connectivity = Some(monitor);
        self
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    #[must_use]
    pub const fn connectivity(&self) -> Option<&ConnectivityMonitor> {
        self.connectivity.as_ref()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Whether a cycle is in flight
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Observe the passive sync indicator
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SyncIndicator> {
        self.status.subscribe()
    }

    /// Reflect a connectivity transition in the indicator
    pub fn note_connectivity(&self, online: bool) {
        self.status
            .send_modify(|indicator| indicator.set_online(online));
    }

    /// Unix ms of the last successful cycle, 0 when there is none
    pub async fn last_sync_time(&self) -> i64 {
        match self.store.get_setting(LAST_SYNC_TIME_KEY).await {
            Ok(value) => value.and_then(|value| value.as_i64()).unwrap_or(0),
            Err(error) => {
                tracing::warn!("Failed to read last sync time: {error}");
                0
            }
        }
    }

    /// Reset `lastSyncTime` and run a cycle immediately
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        self.store.put_setting(LAST_SYNC_TIME_KEY, json!(0)).await?;
        self.sync().await
    }

    /// Run one cycle. Errors abort the cycle and leave `lastSyncTime` as it was.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        if !self.auth.is_authenticated() {
            return Ok(SyncOutcome::Skipped(SkipReason::NotAuthenticated));
        }
        if self
            .connectivity
            .as_ref()
            .is_some_and(|monitor| !monitor.is_online())
        {
            self.note_connectivity(false);
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Sync already in progress, skipping");
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = RunningGuard(&self.running);

        self.status
            .send_modify(|indicator| indicator.state = SyncState::Syncing);

        match self.run_cycle().await {
            Ok(report) => {
                tracing::info!(
                    "Sync complete: {} created, {} updated, {} deleted, {} failed, {} of {} remote merged",
                    report.created,
                    report.updated,
                    report.deleted,
                    report.failed,
                    report.merged,
                    report.pulled
                );
                self.status.send_modify(|indicator| {
                    indicator.state = SyncState::Synced;
                    indicator.last_sync_time = Some(report.finished_at);
                    indicator.last_error = None;
                });
                Ok(SyncOutcome::Completed(report))
            }
            Err(error) => {
                tracing::warn!("Sync failed: {error}");
                let message = error.to_string();
                self.status.send_modify(|indicator| {
                    indicator.state = SyncState::Error;
                    indicator.last_error = Some(message);
                });
                Err(error)
            }
        }
    }

    async fn run_cycle(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let unsynced = self.store.list_unsynced().await;
        let tombstones = self.store.list_tombstones().await;
        let nothing_to_push = unsynced.is_empty() && tombstones.is_empty();

        if nothing_to_push && self.last_sync_time().await > 0 {
            report.push_skipped = true;
        } else if !nothing_to_push {
            let mut items: Vec<SyncItem> = unsynced.iter().map(SyncItem::from_entry).collect();
            items.extend(tombstones.iter().map(SyncItem::from_tombstone));

            let by_client_id: HashMap<&str, Pushed> = unsynced
                .iter()
                .map(|entry| (entry.client_id.as_str(), Pushed::of(entry)))
                .collect();
            let by_server_id: HashMap<i64, Pushed> = unsynced
                .iter()
                .filter_map(|entry| {
                    entry
                        .server_id
                        .map(|server_id| (server_id, Pushed::of(entry)))
                })
                .collect();

            tracing::debug!(
                "Pushing {} entries and {} deletions",
                unsynced.len(),
                tombstones.len()
            );
            let response = self
                .remote
                .sync_batch(&SyncRequest { entries: items })
                .await?;
            for result in &response.results {
                self.apply_push_result(result, &by_client_id, &by_server_id, &mut report)
                    .await?;
            }
        }

        self.pull(&mut report).await?;

        report.finished_at = unix_millis_now();
        self.store
            .put_setting(LAST_SYNC_TIME_KEY, json!(report.finished_at))
            .await?;
        Ok(report)
    }

    async fn apply_push_result(
        &self,
        result: &SyncResult,
        by_client_id: &HashMap<&str, Pushed>,
        by_server_id: &HashMap<i64, Pushed>,
        report: &mut SyncReport,
    ) -> Result<()> {
        match result.action {
            SyncAction::Created => {
                let Some(server_id) = result.id else {
                    tracing::warn!("Created result without a server id: {result:?}");
                    return Ok(());
                };
                let pushed = result
                    .client_id
                    .as_deref()
                    .and_then(|client_id| by_client_id.get(client_id));
                match pushed {
                    Some(pushed) => {
                        self.store
                            .set_server_id(pushed.id, server_id, Some(pushed.last_modified))
                            .await?;
                        report.created += 1;
                    }
                    None => tracing::warn!(
                        "Created result for unknown client id {:?}",
                        result.client_id
                    ),
                }
            }
            SyncAction::Updated => {
                let Some(server_id) = result.id else {
                    return Ok(());
                };
                let (reference, pushed_last_modified) = by_server_id.get(&server_id).map_or(
                    (EntryRef::ByServerId(server_id), None),
                    |pushed| (EntryRef::ById(pushed.id), Some(pushed.last_modified)),
                );
                if self
                    .store
                    .mark_synced(&reference, pushed_last_modified)
                    .await?
                {
                    report.updated += 1;
                } else {
                    tracing::debug!("Entry {server_id} changed during push, leaving it unsynced");
                }
            }
            SyncAction::Deleted => {
                if let Some(server_id) = result.id {
                    self.store.clear_tombstone(server_id).await?;
                    report.deleted += 1;
                }
            }
            SyncAction::Error => {
                tracing::warn!(
                    "Server rejected {}: {}",
                    result
                        .client_id
                        .clone()
                        .or_else(|| result.id.map(|id| id.to_string()))
                        .unwrap_or_else(|| "entry".to_string()),
                    result.error.as_deref().unwrap_or("unknown error")
                );
                report.failed += 1;
            }
        }
        Ok(())
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        let remote_entries = fetch_all_entries(self.remote.as_ref()).await?;
        report.pulled = remote_entries.len();

        for remote in remote_entries {
            if self.store.has_tombstone(remote.id).await {
                tracing::debug!("Skipping remote entry {} pending deletion", remote.id);
                continue;
            }

            let local = self.store.get(remote.local_id()).await?;
            let decision = decide(local.as_ref(), &remote);
            match decision {
                MergeDecision::Insert | MergeDecision::Overwrite => {
                    let remote_id = remote.id;
                    let merged = remote.into_local(local.as_ref());
                    match self.store.put(merged).await {
                        Ok(_) => report.merged += 1,
                        Err(Error::Validation(message)) => {
                            tracing::warn!("Ignoring invalid remote entry {remote_id}: {message}");
                        }
                        Err(error) => return Err(error),
                    }
                }
                MergeDecision::KeepLocal { conflict } => {
                    if conflict {
                        if let Some(local) = &local {
                            tracing::debug!(
                                "Conflict ignored for entry {}: local {} newer than remote {}",
                                local.id,
                                local.last_modified,
                                remote.last_modified
                            );
                            self.store
                                .record_conflict(
                                    local.id,
                                    local.last_modified,
                                    remote.last_modified,
                                )
                                .await?;
                            report.conflicts_ignored += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{remote_entry, signed_in_session, FailingStore, FakeRemote};
    use super::*;
    use crate::auth::{AuthSession, MemorySessionStore};
    use crate::db::MemoryLocalStore;
    use crate::models::SyncStatus;
    use crate::remote::wire::{EntryPage, EntryPayload, RemoteEntry, SyncResponse};
    use crate::services::LibSqlLocalStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Semaphore;

    /// Edits one local entry while the first batch is on the wire
    struct EditDuringPush {
        inner: Arc<FakeRemote>,
        store: Arc<dyn LocalStore>,
        id: EntryId,
        armed: AtomicBool,
    }

    #[async_trait]
    impl RemoteEntryService for EditDuringPush {
        async fn list_entries(&self, limit: usize, offset: usize) -> Result<EntryPage> {
            self.inner.list_entries(limit, offset).await
        }

        async fn get_entry(&self, id: i64) -> Result<Option<RemoteEntry>> {
            self.inner.get_entry(id).await
        }

        async fn create_entry(&self, payload: &EntryPayload) -> Result<i64> {
            self.inner.create_entry(payload).await
        }

        async fn update_entry(&self, id: i64, payload: &EntryPayload) -> Result<()> {
            self.inner.update_entry(id, payload).await
        }

        async fn delete_entry(&self, id: i64) -> Result<()> {
            self.inner.delete_entry(id).await
        }

        async fn sync_batch(&self, request: &SyncRequest) -> Result<SyncResponse> {
            if self.armed.swap(false, Ordering::SeqCst) {
                let mut entry = self.store.get(self.id).await?.unwrap();
                entry.set_content("edited during push");
                self.store.put(entry).await?;
            }
            self.inner.sync_batch(request).await
        }
    }

    fn engine_with(store: Arc<dyn LocalStore>, remote: Arc<FakeRemote>) -> SyncEngine {
        SyncEngine::new(store, remote, signed_in_session())
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::Skipped(reason) => panic!("cycle skipped: {reason:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_entry_is_pushed_once_and_gets_server_id() {
        let store: Arc<dyn LocalStore> = Arc::new(LibSqlLocalStore::open_in_memory().await.unwrap());
        let remote = FakeRemote::new();
        let monitor = ConnectivityMonitor::new(false);
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote))
            .with_connectivity(monitor.clone());

        let mut entry = Entry::new_offline("hello world");
        entry.id = EntryId::from_millis(1_000);
        entry.created_at = 1_000;
        entry.last_modified = 1_000;
        store.put(entry.clone()).await.unwrap();

        assert_eq!(
            engine.sync().await.unwrap(),
            SyncOutcome::Skipped(SkipReason::Offline)
        );
        assert_eq!(remote.batch_count(), 0);

        monitor.set_online(true);
        completed(engine.sync().await.unwrap());

        let stored = store.get(entry.id).await.unwrap().unwrap();
        assert!(stored.server_id.is_some());
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(remote.batch_count(), 1);
        let batch = remote.batches.lock().unwrap()[0].clone();
        assert!(batch
            .entries
            .iter()
            .any(|item| item.client_id.as_deref() == Some(entry.client_id.as_str())));

        let again = completed(engine.sync().await.unwrap());
        assert!(again.push_skipped);
        assert_eq!(remote.batch_count(), 1);
        assert_eq!(remote.entries.lock().unwrap().len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_remote_overwrites_local() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));

        let mut local = Entry::new("old");
        local.id = EntryId::from_millis(2_000);
        local.created_at = 100;
        local.last_modified = 500;
        local.server_id = Some(1);
        local.sync_status = SyncStatus::Synced;
        store.put(local.clone()).await.unwrap();
        remote.seed(remote_entry(1, 2_000, 900, "new"));

        let report = completed(engine.sync().await.unwrap());

        let merged = store.get(local.id).await.unwrap().unwrap();
        assert_eq!(merged.content, "new");
        assert_eq!(merged.last_modified, 900);
        assert_eq!(merged.client_id, local.client_id);
        assert_eq!(merged.created_at, 100);
        assert_eq!(report.merged, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ties_keep_local_and_newer_local_is_logged() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));

        let mut tied = Entry::new("mine");
        tied.id = EntryId::from_millis(3_000);
        tied.created_at = 3_000;
        tied.last_modified = 3_900;
        tied.server_id = Some(1);
        tied.sync_status = SyncStatus::Synced;
        let mut newer = Entry::new("edited offline");
        newer.id = EntryId::from_millis(4_000);
        newer.created_at = 4_000;
        newer.last_modified = 5_000;
        newer.server_id = Some(2);
        newer.sync_status = SyncStatus::Synced;
        store.put(tied.clone()).await.unwrap();
        store.put(newer.clone()).await.unwrap();
        store.put_setting(LAST_SYNC_TIME_KEY, json!(1)).await.unwrap();
        remote.seed(remote_entry(1, 3_000, 3_900, "theirs"));
        remote.seed(remote_entry(2, 4_000, 4_500, "stale"));

        let report = completed(engine.sync().await.unwrap());

        assert_eq!(store.get(tied.id).await.unwrap().unwrap().content, "mine");
        assert_eq!(
            store.get(newer.id).await.unwrap().unwrap().content,
            "edited offline"
        );
        assert_eq!(report.conflicts_ignored, 1);
        let conflicts = store.list_conflicts(10).await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entry_id, newer.id);
        assert_eq!(conflicts[0].incoming_last_modified, 4_500);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_batch_element_stays_unsynced() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));

        let entries: Vec<Entry> = (1..=5).map(|n| Entry::new(format!("entry {n}"))).collect();
        for entry in &entries {
            store.put(entry.clone()).await.unwrap();
        }
        remote
            .reject_client_ids
            .lock()
            .unwrap()
            .insert(entries[2].client_id.clone());

        let report = completed(engine.sync().await.unwrap());

        assert_eq!(report.created, 4);
        assert_eq!(report.failed, 1);
        for (index, entry) in entries.iter().enumerate() {
            let stored = store.get(entry.id).await.unwrap().unwrap();
            if index == 2 {
                assert_eq!(stored.sync_status, SyncStatus::Local);
                assert_eq!(stored.server_id, None);
            } else {
                assert_eq!(stored.sync_status, SyncStatus::Synced);
                assert!(stored.server_id.is_some());
            }
        }

        remote.reject_client_ids.lock().unwrap().clear();
        let retry = completed(engine.sync().await.unwrap());
        assert_eq!(retry.created, 1);
        assert!(store.list_unsynced().await.is_empty());
        assert_eq!(remote.entries.lock().unwrap().len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edit_made_during_push_is_sent_next_cycle() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let fake = FakeRemote::new();
        let entry = Entry::new("original");
        store.put(entry.clone()).await.unwrap();
        let remote = Arc::new(EditDuringPush {
            inner: Arc::clone(&fake),
            store: Arc::clone(&store),
            id: entry.id,
            armed: AtomicBool::new(true),
        });
        let engine = SyncEngine::new(Arc::clone(&store), remote, signed_in_session());

        let first = completed(engine.sync().await.unwrap());

        assert_eq!(first.created, 1);
        let stored = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "edited during push");
        assert!(stored.server_id.is_some());
        assert_eq!(stored.sync_status, SyncStatus::Local);
        assert_eq!(fake.entries.lock().unwrap()[0].entry, "original");

        let second = completed(engine.sync().await.unwrap());

        assert_eq!(second.updated, 1);
        assert_eq!(second.created, 0);
        assert_eq!(fake.entries.lock().unwrap()[0].entry, "edited during push");
        assert_eq!(
            store.get(entry.id).await.unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
        assert!(store.list_unsynced().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_mid_pull_keeps_merged_entries_and_retries() {
        let failing = Arc::new(FailingStore::default());
        let store: Arc<dyn LocalStore> = Arc::clone(&failing) as _;
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));
        remote.seed(remote_entry(1, 30_000, 30_000, "newest"));
        remote.seed(remote_entry(2, 20_000, 20_000, "middle"));
        remote.seed(remote_entry(3, 10_000, 10_000, "oldest"));
        *failing.fail_put.lock().unwrap() = Some(EntryId::from_millis(20_000));

        let error = engine.sync().await.unwrap_err();

        assert!(error.is_storage());
        assert_eq!(engine.last_sync_time().await, 0);
        assert_eq!(engine.status().borrow().state, SyncState::Error);
        assert!(store
            .get(EntryId::from_millis(30_000))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(EntryId::from_millis(20_000))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get(EntryId::from_millis(10_000))
            .await
            .unwrap()
            .is_none());

        *failing.fail_put.lock().unwrap() = None;
        let report = completed(engine.sync().await.unwrap());

        assert_eq!(report.pulled, 3);
        assert_eq!(report.merged, 2);
        assert_eq!(store.count().await.unwrap(), 3);
        assert!(engine.last_sync_time().await > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merging_the_same_remote_set_twice_is_idempotent() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));
        remote.seed(remote_entry(1, 10_000, 10_000, "first"));
        remote.seed(remote_entry(2, 20_000, 25_000, "second entry"));

        completed(engine.sync().await.unwrap());
        let after_first = store.list(100, 0).await;
        completed(engine.force_sync().await.unwrap());
        let after_second = store.list(100, 0).await;

        assert_eq!(after_first, after_second);
        assert_eq!(after_first.len(), 2);
        assert!(after_first
            .iter()
            .all(|entry| entry.sync_status == SyncStatus::Synced));
        assert_eq!(remote.batch_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edits_to_pushed_entries_are_sent_as_updates() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));
        let entry = Entry::new("draft");
        store.put(entry.clone()).await.unwrap();
        completed(engine.sync().await.unwrap());

        let mut edited = store.get(entry.id).await.unwrap().unwrap();
        edited.set_content("final words");
        store.put(edited.clone()).await.unwrap();
        let report = completed(engine.sync().await.unwrap());

        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 0);
        let remote_entries = remote.entries.lock().unwrap().clone();
        assert_eq!(remote_entries.len(), 1);
        assert_eq!(remote_entries[0].entry, "final words");
        assert_eq!(
            store.get(entry.id).await.unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deletions_are_pushed_and_not_resurrected() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));
        let entry = Entry::new("to be removed");
        store.put(entry.clone()).await.unwrap();
        completed(engine.sync().await.unwrap());

        store.delete(entry.id).await.unwrap();
        *remote.fail_batches.lock().unwrap() = true;
        assert!(engine.sync().await.is_err());
        assert_eq!(store.list_tombstones().await.len(), 1);
        assert!(store.get(entry.id).await.unwrap().is_none());

        *remote.fail_batches.lock().unwrap() = false;
        let report = completed(engine.sync().await.unwrap());

        assert_eq!(report.deleted, 1);
        assert!(store.list_tombstones().await.is_empty());
        assert!(remote.entries.lock().unwrap().is_empty());
        assert!(store.get(entry.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_cycle_keeps_last_sync_time_and_reports_error() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let engine = engine_with(Arc::clone(&store), Arc::clone(&remote));
        store.put(Entry::new("pending")).await.unwrap();
        *remote.fail_batches.lock().unwrap() = true;

        let error = engine.sync().await.unwrap_err();

        assert!(error.is_retryable());
        assert_eq!(engine.last_sync_time().await, 0);
        assert!(!engine.is_running());
        let status = engine.status().borrow().clone();
        assert_eq!(status.state, SyncState::Error);
        assert!(status.last_error.is_some());
        assert_eq!(store.list_unsynced().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn signed_out_engine_does_nothing() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let remote = FakeRemote::new();
        let session = AuthSession::new(
            "http://127.0.0.1:9",
            reqwest::Client::new(),
            Arc::new(MemorySessionStore::new()),
        );
        let engine = SyncEngine::new(store, Arc::clone(&remote) as _, Arc::new(session));

        assert_eq!(
            engine.sync().await.unwrap(),
            SyncOutcome::Skipped(SkipReason::NotAuthenticated)
        );
        assert_eq!(remote.list_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_sync_is_a_no_op() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let gate = Arc::new(Semaphore::new(0));
        let remote = FakeRemote::gated(Arc::clone(&gate));
        let engine = Arc::new(engine_with(store, Arc::clone(&remote)));

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.sync().await }
        });
        while !engine.is_running() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            engine.sync().await.unwrap(),
            SyncOutcome::Skipped(SkipReason::AlreadyRunning)
        );

        gate.add_permits(1);
        completed(first.await.unwrap().unwrap());
        assert!(!engine.is_running());
        assert_eq!(remote.list_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_cycle_updates_indicator() {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let engine = engine_with(store, FakeRemote::new());

        let report = completed(engine.sync().await.unwrap());

        let status = engine.status().borrow().clone();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.last_sync_time, Some(report.finished_at));
        assert_eq!(engine.last_sync_time().await, report.finished_at);
    }
}
