//! Provisioning Controller
//!
//! Runs the four long-lived loops that feed the reconciler:
//! - claim watch: cluster claim stream -> claim queue
//! - claim notification: claim queue -> reconciler
//! - volume watch: cluster volume stream -> volume queue
//! - volume notification: volume queue -> reconciler
//!
//! All loops share one cancellation token. Shutdown cancels it, then joins
//! the loops with a deadline and aborts any that are still running.

use super::reconciler::Reconciler;
use crate::domain::events::{ChangeType, ClaimEvent, VolumeEvent};
use crate::domain::ports::{ClusterApiRef, EventQueue, EventQueueRef, WatchItem, WatchStream};
use crate::error::{Error, ErrorAction, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Settings
// =============================================================================

/// Timing for the controller loops
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Idle wait of the notification loops and reconnect delay of the watches
    pub poll_interval: Duration,
    /// How long shutdown waits for the loops before aborting them
    pub shutdown_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct Controller {
    reconciler: Arc<Reconciler>,
    cluster: ClusterApiRef,
    claims: EventQueueRef<ClaimEvent>,
    volumes: EventQueueRef<VolumeEvent>,
    settings: LoopSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        cluster: ClusterApiRef,
        claims: EventQueueRef<ClaimEvent>,
        volumes: EventQueueRef<VolumeEvent>,
        settings: LoopSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            cluster,
            claims,
            volumes,
            settings,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the four loops; calling this twice has no effect
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Controller already started");
            return;
        }

        info!(
            "Starting controller as {} (poll interval {:?})",
            self.reconciler.identity(),
            self.settings.poll_interval
        );

        let cluster = self.cluster.clone();
        tasks.push(tokio::spawn(watch_loop(
            "claim",
            move || {
                let cluster = cluster.clone();
                async move { cluster.watch_claims().await }.boxed()
            },
            ClaimEvent::from_claim,
            self.claims.clone(),
            self.cluster.clone(),
            self.cancel.clone(),
            self.settings.poll_interval,
        )));

        let cluster = self.cluster.clone();
        tasks.push(tokio::spawn(watch_loop(
            "volume",
            move || {
                let cluster = cluster.clone();
                async move { cluster.watch_volumes().await }.boxed()
            },
            VolumeEvent::from_volume,
            self.volumes.clone(),
            self.cluster.clone(),
            self.cancel.clone(),
            self.settings.poll_interval,
        )));

        tasks.push(tokio::spawn(self.clone().claim_notification_loop()));
        tasks.push(tokio::spawn(self.clone().volume_notification_loop()));
    }

    /// Token cancelled when the controller stops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all loops, waiting at most the configured shutdown timeout
    pub async fn shutdown(&self) {
        info!("Stopping controller");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!("Controller loop did not stop in time, aborting it");
                task.abort();
            }
        }
        info!("Controller stopped");
    }

    // =========================================================================
    // Notification Loops
    // =========================================================================

    async fn claim_notification_loop(self: Arc<Self>) {
        loop {
            while let Some(event) = self.claims.try_dequeue() {
                if self.cancel.is_cancelled() {
                    return;
                }
                match self.reconciler.handle_claim(&event).await {
                    Ok(outcome) => trace!(
                        "Claim {}/{} handled: {:?}",
                        event.namespace,
                        event.name,
                        outcome
                    ),
                    Err(e) => {
                        let resource = format!("claim {}/{}", event.namespace, event.name);
                        self.on_processing_error(&resource, e).await;
                    }
                }
            }
            if !self.idle(self.claims.as_ref()).await {
                return;
            }
        }
    }

    async fn volume_notification_loop(self: Arc<Self>) {
        loop {
            while let Some(event) = self.volumes.try_dequeue() {
                if self.cancel.is_cancelled() {
                    return;
                }
                match self.reconciler.handle_volume(&event).await {
                    Ok(outcome) => trace!("Volume {} handled: {:?}", event.name, outcome),
                    Err(e) => {
                        let resource = format!("volume {}", event.name);
                        self.on_processing_error(&resource, e).await;
                    }
                }
            }
            if !self.idle(self.volumes.as_ref()).await {
                return;
            }
        }
    }

    /// Wait for new items, the poll interval or cancellation.
    /// Returns false once the controller is stopping.
    async fn idle<T: Send + 'static>(&self, queue: &dyn EventQueue<T>) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = queue.notified() => true,
            _ = tokio::time::sleep(self.settings.poll_interval) => true,
        }
    }

    /// The failed event is dropped; delivery of a later event for the same
    /// resource is the retry.
    async fn on_processing_error(&self, resource: &str, err: Error) {
        self.reconciler.metrics().events_dropped.inc();
        match err.action() {
            ErrorAction::ResetSession => {
                error!("Dropping event for {}: {}; resetting cluster session", resource, err);
                if let Err(e) = self.cluster.reset_session().await {
                    error!("Failed to reset cluster session: {}", e);
                }
            }
            ErrorAction::DropEvent if !err.is_transient() => {
                warn!("Dropping event for {}: {}", resource, err);
            }
            _ => {
                error!("Dropping event for {}: {}", resource, err);
            }
        }
    }
}

// =============================================================================
// Watch Loop
// =============================================================================

/// Keep a watch open, translating each item into an event on `queue`.
/// Reopens the watch after `retry_delay` whenever it ends or fails; a
/// failure whose action is `ResetSession` rebuilds the cluster session first.
async fn watch_loop<K, E, Open, Translate>(
    kind: &'static str,
    open: Open,
    translate: Translate,
    queue: EventQueueRef<E>,
    cluster: ClusterApiRef,
    cancel: CancellationToken,
    retry_delay: Duration,
) where
    K: Send + 'static,
    E: Send + 'static,
    Open: Fn() -> BoxFuture<'static, Result<WatchStream<K>>> + Send + Sync + 'static,
    Translate: Fn(ChangeType, &K) -> Result<E> + Send + Sync + 'static,
{
    while !cancel.is_cancelled() {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = open() => opened,
        };

        let failure = match opened {
            Ok(stream) => match pump(kind, stream, &translate, &queue, &cancel).await {
                Ok(true) => return,
                Ok(false) => None,
                Err(e) => {
                    warn!("{} watch interrupted: {}", kind, e);
                    Some(e)
                }
            },
            Err(e) => {
                warn!("Failed to open {} watch: {}", kind, e);
                Some(e)
            }
        };

        if let Some(e) = failure {
            if e.action() == ErrorAction::ResetSession {
                info!("Resetting cluster session after {} watch failure", kind);
                if let Err(e) = cluster.reset_session().await {
                    error!("Failed to reset cluster session: {}", e);
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
        debug!("Reopening {} watch", kind);
    }
}

/// Forward one watch stream into the queue. Returns `Ok(true)` when
/// cancelled, `Ok(false)` when the stream ended.
async fn pump<K, E, Translate>(
    kind: &str,
    mut stream: WatchStream<K>,
    translate: &Translate,
    queue: &EventQueueRef<E>,
    cancel: &CancellationToken,
) -> Result<bool>
where
    E: Send + 'static,
    Translate: Fn(ChangeType, &K) -> Result<E>,
{
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(true),
            item = stream.next() => item,
        };

        match item {
            Some(Ok(item)) => {
                let (change, object) = match item {
                    WatchItem::Added(o) => (ChangeType::Added, o),
                    WatchItem::Modified(o) => (ChangeType::Modified, o),
                    WatchItem::Deleted(o) => (ChangeType::Deleted, o),
                };
                match translate(change, &object) {
                    Ok(event) => queue.enqueue(event),
                    Err(e) => warn!("Skipping {} {} event: {}", kind, change, e),
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                debug!("{} watch ended", kind);
                return Ok(false);
            }
        }
    }
}
