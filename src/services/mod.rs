//! Engine services.

/// Reference-counted channel subscriptions, reconnection, and heartbeat.
pub mod connection;
/// In-process transport pair for tests and demos.
pub mod loopback;
/// Payload shape normalization.
pub mod normalizer;
/// The engine event loop and its scoped handle.
pub mod sync_service;
