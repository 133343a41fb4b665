//! Periodic sync while a session is active.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{SyncEngine, SyncOutcome};
use crate::config::ClientConfig;

/// Runs a cycle on start, every `interval`, and on each reconnect
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    enabled: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    #[must_use]
    pub const fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            enabled: true,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn from_config(engine: Arc<SyncEngine>, config: &ClientConfig) -> Self {
        Self {
            engine,
            interval: config.sync_interval,
            enabled: config.sync_enabled,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Start the loop. Returns false when sync is disabled, the session is
    /// signed out, or the loop is already running.
    pub fn start(&self) -> bool {
        if !self.enabled {
            tracing::debug!("Sync disabled, scheduler not started");
            return false;
        }
        if !self.engine.auth().is_authenticated() {
            tracing::debug!("Not signed in, scheduler not started");
            return false;
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        tracing::info!("Starting sync every {:?}", self.interval);
        *task = Some(tokio::spawn(run(Arc::clone(&self.engine), self.interval)));
        true
    }

    /// Cancel the loop and any cycle it is running
    pub fn stop(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            tracing::info!("Sync scheduler stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(engine: Arc<SyncEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signed_in = engine.auth().watch();
    let mut online = engine.connectivity().map(|monitor| monitor.watch());

    loop {
        tokio::select! {
            biased;
            changed = signed_in.changed() => {
                if changed.is_err() || !*signed_in.borrow_and_update() {
                    tracing::info!("Signed out, stopping scheduled sync");
                    break;
                }
            }
            transition = next_transition(&mut online) => match transition {
                Some(true) => {
                    engine.note_connectivity(true);
                    run_scheduled(&engine).await;
                }
                Some(false) => engine.note_connectivity(false),
                None => online = None,
            },
            _ = ticker.tick() => run_scheduled(&engine).await,
        }
    }
}

async fn next_transition(online: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match online {
        Some(receiver) => match receiver.changed().await {
            Ok(()) => Some(*receiver.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn run_scheduled(engine: &SyncEngine) {
    match engine.sync().await {
        Ok(SyncOutcome::Skipped(reason)) => tracing::debug!("Scheduled sync skipped: {reason:?}"),
        Ok(SyncOutcome::Completed(_)) => {}
        Err(error) => tracing::warn!("Scheduled sync failed: {error}"),
    }
}
