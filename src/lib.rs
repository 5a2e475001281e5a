//! Real-time result synchronization and reveal-animation engine.
//!
//! Keeps a fixed set of live-updating records (per-province draw results)
//! consistent under partial, out-of-order, duplicated updates from a shared
//! push channel, and drives the pending-field reveal animation.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod services;
pub mod state;
