//! Connectivity monitor and offline retry queue.
//!
//! The monitor keeps a process-wide online flag that callers read
//! synchronously. Platform signals flip it immediately; a heartbeat probe
//! corrects missed signals in either direction. Requests that failed while
//! offline are queued and replayed in order once the device is back online.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{Error, Result};

/// Delay before the first retry of a queued request
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
/// Exponent cap for the retry backoff
pub const MAX_BACKOFF_EXPONENT: u32 = 6;
/// Replay attempts before a queued request is dropped
pub const MAX_REPLAY_ATTEMPTS: u32 = 8;

/// Backoff before the next replay after `attempts` failures
#[must_use]
pub fn retry_delay(attempts: u32) -> Duration {
    RETRY_BASE_DELAY.saturating_mul(2_u32.pow(attempts.min(MAX_BACKOFF_EXPONENT)))
}

/// A request that can be sent again later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path relative to the API base URL, starting with `/`
    pub path: String,
    pub body: Option<Value>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A failed request waiting in the retry queue
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request: OutboundRequest,
    /// Unix ms at which the request was first queued
    pub enqueued_at: i64,
    /// Failed replays so far
    pub attempts: u32,
    pub next_attempt_at: Instant,
}

/// Counts from one pass over the retry queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Online/offline signal reported by the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
    Online,
    Offline,
}

/// Sends queued requests
#[async_trait]
pub trait RequestReplayer: Send + Sync {
    async fn replay(&self, request: &OutboundRequest) -> Result<()>;
}

/// Active reachability check used by the heartbeat
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probe issuing `HEAD {base}/health`
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!("Heartbeat probe failed: {error}");
                false
            }
        }
    }
}

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

struct Inner {
    online: watch::Sender<bool>,
    subscribers: Mutex<BTreeMap<u64, Callback>>,
    next_subscriber: AtomicU64,
    queue: Mutex<VecDeque<QueuedRequest>>,
    draining: AtomicBool,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    replayer: Mutex<Option<Arc<dyn RequestReplayer>>>,
    heartbeat_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks connectivity and owns the retry queue
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Stop receiving transitions
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectivityMonitor {
    /// Monitor without an active probe; state follows platform signals only
    #[must_use]
    pub fn new(initially_online: bool) -> Self {
        Self::build(initially_online, None, Duration::from_secs(30))
    }

    /// Monitor that also probes every `heartbeat_interval` once started
    #[must_use]
    pub fn with_probe(
        initially_online: bool,
        probe: Arc<dyn ConnectivityProbe>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self::build(initially_online, Some(probe), heartbeat_interval)
    }

    fn build(
        initially_online: bool,
        probe: Option<Arc<dyn ConnectivityProbe>>,
        heartbeat_interval: Duration,
    ) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(Inner {
                online,
                subscribers: Mutex::new(BTreeMap::new()),
                next_subscriber: AtomicU64::new(0),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                probe,
                replayer: Mutex::new(None),
                heartbeat_interval,
                task: Mutex::new(None),
            }),
        }
    }

    /// Set who sends queued requests when they are replayed
    pub fn set_replayer(&self, replayer: Arc<dyn RequestReplayer>) {
        *self
            .inner
            .replayer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(replayer);
    }

    /// Current state; never blocks on I/O
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Receiver that observes every transition
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Register a callback. It runs now with the current state, then on each
    /// transition.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let callback: Callback = Arc::new(callback);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&callback));

        callback(self.is_online());
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Apply a new state. Returns whether it was a transition.
    ///
    /// Coming back online makes every queued request due immediately.
    pub fn set_online(&self, online: bool) -> bool {
        if online && !self.is_online() {
            self.make_queue_due();
        }
        let changed = self.inner.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            tracing::info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
            let callbacks: Vec<Callback> = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for callback in callbacks {
                callback(online);
            }
        }
        changed
    }

    pub fn handle_platform_signal(&self, signal: PlatformSignal) {
        self.set_online(signal == PlatformSignal::Online);
    }

    /// Probe actively and correct the flag. Without a probe the current state
    /// is returned unchanged.
    pub async fn check_connection(&self) -> bool {
        let Some(probe) = self.inner.probe.clone() else {
            return self.is_online();
        };
        let online = probe.probe().await;
        self.set_online(online);
        online
    }

    /// Queue a failed request for replay
    pub fn queue_request(&self, request: OutboundRequest) {
        tracing::debug!("Queueing {} {} for replay", request.method, request.path);
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(QueuedRequest {
                request,
                enqueued_at: crate::util::unix_millis_now(),
                attempts: 0,
                next_attempt_at: Instant::now(),
            });
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of the queue in replay order
    #[must_use]
    pub fn queued(&self) -> Vec<QueuedRequest> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Replay every due request, one at a time.
    ///
    /// Does nothing while offline or when another drain is in progress.
    pub async fn drain_queue(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.is_online() {
            return report;
        }
        let Some(replayer) = self
            .inner
            .replayer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return report;
        };
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return report;
        }
        let _guard = DrainGuard(&self.inner.draining);

        let due = self.take_due(Instant::now());
        for mut item in due {
            match replayer.replay(&item.request).await {
                Ok(()) => report.replayed += 1,
                Err(error) if is_permanent_failure(&error) => {
                    tracing::warn!(
                        "Dropping queued {} {}: {error}",
                        item.request.method,
                        item.request.path
                    );
                    report.dropped += 1;
                }
                Err(error) => {
                    item.attempts += 1;
                    if item.attempts >= MAX_REPLAY_ATTEMPTS {
                        tracing::warn!(
                            "Dropping queued {} {} after {} attempts: {error}",
                            item.request.method,
                            item.request.path,
                            item.attempts
                        );
                        report.dropped += 1;
                    } else {
                        item.next_attempt_at = Instant::now() + retry_delay(item.attempts);
                        tracing::debug!(
                            "Replay of {} {} failed (attempt {}): {error}",
                            item.request.method,
                            item.request.path,
                            item.attempts
                        );
                        self.inner
                            .queue
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push_back(item);
                        report.requeued += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            tracing::info!(
                "Retry queue drained: {} replayed, {} requeued, {} dropped",
                report.replayed,
                report.requeued,
                report.dropped
            );
        }
        report
    }

    fn make_queue_due(&self) {
        let now = Instant::now();
        for item in self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
        {
            item.next_attempt_at = item.next_attempt_at.min(now);
        }
    }

    fn take_due(&self, now: Instant) -> Vec<QueuedRequest> {
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (due, waiting): (VecDeque<_>, VecDeque<_>) = queue
            .drain(..)
            .partition(|item| item.next_attempt_at <= now);
        *queue = waiting;
        due.into_iter().collect()
    }

    /// Start the heartbeat and the drain-on-reconnect task
    pub fn start(&self) {
        let mut task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let monitor = self.clone();
        *task = Some(tokio::spawn(async move { monitor.run().await }));
    }

    /// Stop the background task started by [`start`](Self::start)
    pub fn stop(&self) {
        if let Some(handle) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    async fn run(self) {
        let mut heartbeat = tokio::time::interval(self.inner.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut online = self.watch();

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if self.check_connection().await {
                        self.drain_queue().await;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    if is_online {
                        self.drain_queue().await;
                    }
                }
            }
        }
    }
}

fn is_permanent_failure(error: &Error) -> bool {
    if error.is_auth_failure() || matches!(error, Error::Validation(_)) {
        return true;
    }
    error
        .status_code()
        .is_some_and(|status| (400..500).contains(&status) && !error.is_retryable())
}
