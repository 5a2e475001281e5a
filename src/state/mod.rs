//! Canonical state ownership and fan-out to consumers.

/// Canonical entity records and the period template.
pub mod entity;
/// Partial-update merging into the canonical set.
pub mod merge;
/// Per-field reveal animation state machine.
pub mod reveal;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::Instant;

use crate::dto::snapshot::DisplaySnapshot;
use crate::dto::update::PartialUpdate;
use crate::services::connection::ConnectionStatus;
use crate::state::entity::{DrawEntity, DrawTemplate};
use crate::state::merge::{CanonicalSet, MergeOutcome};
use crate::state::reveal::RevealController;

/// Shared handle to the engine state, cloned cheaply across tasks.
pub type SharedEngineState = Arc<EngineState>;

/// Broadcast hub fanning display snapshots out to any number of renderers.
pub struct SnapshotHub {
    sender: broadcast::Sender<DisplaySnapshot>,
}

impl SnapshotHub {
    /// Construct a hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<DisplaySnapshot> {
        self.sender.subscribe()
    }

    /// Send a snapshot to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, snapshot: DisplaySnapshot) {
        let _ = self.sender.send(snapshot);
    }
}

/// Central state of one engine instance: the canonical entity set, the reveal
/// controller, the last known connection status, and the snapshot hub.
///
/// Consumers never mutate the canonical set directly; every mutation goes
/// through [`apply_updates`] (or [`seed`] once at startup), which also drives
/// the reveal controller and publishes the resulting snapshot in one step so
/// a resolved value is never visible next to a stale placeholder.
///
/// [`apply_updates`]: EngineState::apply_updates
/// [`seed`]: EngineState::seed
pub struct EngineState {
    canonical: RwLock<CanonicalSet>,
    reveal: Mutex<RevealController>,
    status: RwLock<ConnectionStatus>,
    snapshots: SnapshotHub,
}

impl EngineState {
    /// Build the state for one period template, all fields at placeholder.
    pub fn new(template: DrawTemplate, settle_delay: Duration) -> SharedEngineState {
        let canonical = CanonicalSet::new(template);
        let mut reveal = RevealController::new(settle_delay);
        reveal.activate(&canonical);
        Arc::new(Self {
            canonical: RwLock::new(canonical),
            reveal: Mutex::new(reveal),
            status: RwLock::new(ConnectionStatus::Connecting),
            snapshots: SnapshotHub::new(16),
        })
    }

    /// Subscribe to display snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<DisplaySnapshot> {
        self.snapshots.subscribe()
    }

    /// Pre-seed field values from a cached prior session, then republish.
    pub async fn seed(&self, cached: Vec<DrawEntity>) {
        let mut canonical = self.canonical.write().await;
        canonical.seed(cached);
        let mut reveal = self.reveal.lock().await;
        reveal.activate(&canonical);
        let snapshot =
            DisplaySnapshot::render(&canonical, &reveal, *self.status.read().await);
        self.snapshots.broadcast(snapshot);
    }

    /// Merge a batch of partial updates and publish the resulting snapshot.
    ///
    /// The reveal controller absorbs the outcome under the same canonical
    /// write guard, before the snapshot leaves this function.
    pub async fn apply_updates(&self, updates: &[PartialUpdate]) -> MergeOutcome {
        let mut canonical = self.canonical.write().await;
        let outcome = canonical.merge(updates);
        if !outcome.is_noop() {
            let mut reveal = self.reveal.lock().await;
            reveal.absorb(&canonical, &outcome, Instant::now());
            let snapshot =
                DisplaySnapshot::render(&canonical, &reveal, *self.status.read().await);
            self.snapshots.broadcast(snapshot);
        }
        outcome
    }

    /// Advance the shared animation tick; publishes only on visible change.
    pub async fn tick(&self) -> bool {
        let canonical = self.canonical.read().await;
        let mut reveal = self.reveal.lock().await;
        let changed = reveal.tick(&canonical, Instant::now());
        if changed {
            let snapshot =
                DisplaySnapshot::render(&canonical, &reveal, *self.status.read().await);
            self.snapshots.broadcast(snapshot);
        }
        changed
    }

    /// Record a connection status change and republish the snapshot.
    pub async fn set_status(&self, status: ConnectionStatus) {
        {
            let mut held = self.status.write().await;
            if *held == status {
                return;
            }
            *held = status;
        }
        let canonical = self.canonical.read().await;
        let reveal = self.reveal.lock().await;
        let snapshot = DisplaySnapshot::render(&canonical, &reveal, status);
        self.snapshots.broadcast(snapshot);
    }

    /// Render the current state on demand.
    pub async fn current(&self) -> DisplaySnapshot {
        let canonical = self.canonical.read().await;
        let reveal = self.reveal.lock().await;
        DisplaySnapshot::render(&canonical, &reveal, *self.status.read().await)
    }

    /// Clone of the canonical records, for the snapshot cache writer.
    pub async fn canonical_records(&self) -> Vec<DrawEntity> {
        let canonical = self.canonical.read().await;
        canonical.entities().values().cloned().collect()
    }

    /// Whether no field of any entity has resolved yet.
    pub async fn is_all_placeholder(&self) -> bool {
        self.canonical.read().await.is_all_placeholder()
    }
}
