//! The engine event loop tying the channel, merger, reveal controller, and
//! snapshot cache together.
//!
//! All state mutation happens inside one task, driven by the five trigger
//! sources: channel push events, the one-shot fallback pull, the manager's
//! reconnect supervision (surfacing as status events), the shared animation
//! tick, and the heartbeat (handled entirely inside the manager). Because the
//! merge is idempotent and per-field last-write-wins, any interleaving of
//! those sources converges to the same canonical state.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::dao::snapshot::SnapshotCache;
use crate::dto::channel::ChannelEvent;
use crate::dto::snapshot::DisplaySnapshot;
use crate::error::TransportResult;
use crate::services::connection::{ConnectionManager, ConnectionStatus, TopicHandle};
use crate::services::normalizer;
use crate::state::entity::DrawTemplate;
use crate::state::{EngineState, SharedEngineState};

/// Source of the idempotent fallback read used outside the live window.
///
/// Returns the same record shapes as a `latest` event. Only consulted when
/// the canonical set is still all-placeholder.
pub trait FallbackSource: Send + Sync {
    /// Fetch the current snapshot once.
    fn fetch_latest(&self) -> BoxFuture<'static, TransportResult<Value>>;
}

/// Lifecycle of the one-shot fallback pull.
enum PullState {
    Idle,
    InFlight,
    Done,
}

/// Entry point for one synchronized topic.
pub struct SyncEngine;

impl SyncEngine {
    /// Start the engine for a topic: pre-seeds from the snapshot cache,
    /// acquires the shared channel, and spawns the event loop.
    ///
    /// The returned handle is the scoped owner of every resource the engine
    /// holds; [`SyncHandle::shutdown`] stops all timers, unsubscribes, and
    /// releases the channel reference on every exit path.
    pub fn start(
        manager: Arc<ConnectionManager>,
        topic: impl Into<String>,
        template: DrawTemplate,
        config: Arc<SyncConfig>,
        fallback: Option<Arc<dyn FallbackSource>>,
    ) -> SyncHandle {
        let topic = topic.into();
        let state = EngineState::new(template, config.settle_delay);
        let cache = SnapshotCache::new(config.snapshot_dir.clone());
        let channel = manager.acquire(&topic);
        let status = channel.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            state.clone(),
            topic.clone(),
            channel,
            config,
            cache,
            fallback,
            shutdown_rx,
        ));

        info!(topic = %topic, "sync engine started");
        SyncHandle {
            state,
            topic,
            manager,
            status,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Running engine for one topic, and its teardown surface.
pub struct SyncHandle {
    state: SharedEngineState,
    topic: String,
    manager: Arc<ConnectionManager>,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Topic this engine synchronizes.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subscribe to display snapshots.
    pub fn snapshots(&self) -> broadcast::Receiver<DisplaySnapshot> {
        self.state.subscribe()
    }

    /// Watch the underlying connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Render the current state on demand.
    pub async fn current(&self) -> DisplaySnapshot {
        self.state.current().await
    }

    /// Stop the engine: animation tick first, then the event subscription,
    /// then the channel reference (which stops the heartbeat and closes the
    /// connection if this was the last consumer).
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if self.task.await.is_err() {
            warn!(topic = %self.topic, "engine task aborted during shutdown");
        }
        self.manager.release(&self.topic);
        info!(topic = %self.topic, "sync engine stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    state: SharedEngineState,
    topic: String,
    channel: TopicHandle,
    config: Arc<SyncConfig>,
    cache: SnapshotCache,
    fallback: Option<Arc<dyn FallbackSource>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Pre-seed from the prior session so the UI is never empty-by-default.
    if let Some(cached) = cache.load(&topic) {
        state.seed(cached).await;
    }

    let mut events = channel.subscribe();
    let mut tick = tokio::time::interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Mirror the connection status from the manager's watch channel; the
    // broadcast events cannot carry it, since a `Connected` sent before this
    // engine subscribed (a second consumer on a shared topic) is never
    // replayed.
    let mut status_rx = channel.status();
    let status = *status_rx.borrow_and_update();
    state.set_status(status).await;
    let mut status_live = true;

    let (pull_tx, mut pull_rx) = mpsc::channel::<TransportResult<Value>>(1);
    let mut pull = PullState::Idle;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = status_rx.changed(), if status_live => match changed {
                Ok(()) => {
                    let status = *status_rx.borrow_and_update();
                    state.set_status(status).await;
                }
                // Supervisor gone; the last status it sent stands.
                Err(_) => status_live = false,
            },
            event = events.recv() => match event {
                Ok(event) => handle_event(&state, &topic, &cache, event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Dropped events are recovered by a fresh snapshot.
                    warn!(topic = %topic, skipped, "event stream lagged; requesting snapshot");
                    let _ = channel.request_latest();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tick.tick() => {
                state.tick().await;
                if let Some(source) = &fallback
                    && matches!(pull, PullState::Idle)
                    && outside_live_window(&config)
                    && state.is_all_placeholder().await
                {
                    pull = PullState::InFlight;
                    debug!(topic = %topic, "starting fallback pull");
                    let fetch = source.fetch_latest();
                    let tx = pull_tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(fetch.await).await;
                    });
                }
            },
            Some(result) = pull_rx.recv() => {
                pull = PullState::Done;
                handle_pull_result(&state, &topic, &cache, result).await;
            },
        }
    }
    // Falling out of the loop drops the tick and the event subscription; the
    // caller releases the channel reference afterwards.
}

/// React to one fanned-out channel event.
async fn handle_event(
    state: &SharedEngineState,
    topic: &str,
    cache: &SnapshotCache,
    event: ChannelEvent,
) {
    match event {
        // Status transitions arrive through the watch channel; these markers
        // only matter for logging here.
        ChannelEvent::Connected => debug!(topic, "channel connected"),
        ChannelEvent::Disconnected => debug!(topic, "channel dropped; reconnecting"),
        ChannelEvent::ConnectionFailed { message } => {
            warn!(topic, %message, "channel failed terminally");
        }
        ChannelEvent::ServerError { message } => {
            warn!(topic, %message, "recoverable server error");
        }
        ChannelEvent::Payload { event, data } => {
            let updates = normalizer::normalize_event(&event, &data);
            if updates.is_empty() {
                return;
            }
            let outcome = state.apply_updates(&updates).await;
            if !outcome.is_noop() {
                cache.save(topic, &state.canonical_records().await);
            }
        }
    }
}

/// Apply the fallback pull result, unless live data has landed meanwhile.
async fn handle_pull_result(
    state: &SharedEngineState,
    topic: &str,
    cache: &SnapshotCache,
    result: TransportResult<Value>,
) {
    let payload = match result {
        Ok(payload) => payload,
        Err(err) => {
            debug!(topic, error = %err, "fallback pull failed; ignored");
            return;
        }
    };
    if !state.is_all_placeholder().await {
        debug!(topic, "live data arrived before the fallback pull; discarded");
        return;
    }
    let updates = normalizer::normalize(&payload);
    if updates.is_empty() {
        return;
    }
    let outcome = state.apply_updates(&updates).await;
    if !outcome.is_noop() {
        cache.save(topic, &state.canonical_records().await);
    }
}

/// Whether the current time of day falls outside the configured live window.
fn outside_live_window(config: &SyncConfig) -> bool {
    config
        .live_window
        .map(|window| !window.contains(OffsetDateTime::now_utc()))
        .unwrap_or(false)
}
