//! Persistence layer.

/// Best-effort per-topic snapshot cache.
pub mod snapshot;
