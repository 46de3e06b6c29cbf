//! Reconciliation Engine
//!
//! - [`Engine`] - lifecycle and the background task
//! - `queue` - serial work queue with per-item retry records
//! - `events` - remote event handlers
//! - `repair` - periodic endpoint repair and orphan collection
//! - [`EngineStats`] - counters exposed to the admin server and metrics

mod engine;
mod events;
mod queue;
mod repair;
mod stats;

pub use engine::{Engine, EngineConfig, EngineState};
pub use stats::{EngineStats, StatsSnapshot};
