//! Per-engine counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::metrics::{
    cluster_labels, EVENTS_ABANDONED, EVENTS_PROCESSED, EVENTS_REQUEUED, REPAIR_PASSES,
    WATCH_RESTARTS,
};

/// Counters of one engine, also exported as OpenTelemetry metrics
#[derive(Debug)]
pub struct EngineStats {
    cluster: String,
    events_processed: AtomicU64,
    events_requeued: AtomicU64,
    events_abandoned: AtomicU64,
    repair_passes: AtomicU64,
    watch_restarts: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Events applied to the local cluster
    pub events_processed: u64,
    /// Event retries after transient failures
    pub events_requeued: u64,
    /// Events dropped without being applied
    pub events_abandoned: u64,
    /// Completed repair passes
    pub repair_passes: u64,
    /// Remote watch re-establishments
    pub watch_restarts: u64,
}

impl EngineStats {
    /// Zeroed counters for an engine mirroring `cluster`
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            events_processed: AtomicU64::new(0),
            events_requeued: AtomicU64::new(0),
            events_abandoned: AtomicU64::new(0),
            repair_passes: AtomicU64::new(0),
            watch_restarts: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        EVENTS_PROCESSED.add(1, &cluster_labels(&self.cluster));
    }

    pub(crate) fn record_requeued(&self) {
        self.events_requeued.fetch_add(1, Ordering::Relaxed);
        EVENTS_REQUEUED.add(1, &cluster_labels(&self.cluster));
    }

    pub(crate) fn record_abandoned(&self) {
        self.events_abandoned.fetch_add(1, Ordering::Relaxed);
        EVENTS_ABANDONED.add(1, &cluster_labels(&self.cluster));
    }

    pub(crate) fn record_repair_pass(&self) {
        self.repair_passes.fetch_add(1, Ordering::Relaxed);
        REPAIR_PASSES.add(1, &cluster_labels(&self.cluster));
    }

    pub(crate) fn record_watch_restart(&self) {
        self.watch_restarts.fetch_add(1, Ordering::Relaxed);
        WATCH_RESTARTS.add(1, &cluster_labels(&self.cluster));
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_requeued: self.events_requeued.load(Ordering::Relaxed),
            events_abandoned: self.events_abandoned.load(Ordering::Relaxed),
            repair_passes: self.repair_passes.load(Ordering::Relaxed),
            watch_restarts: self.watch_restarts.load(Ordering::Relaxed),
        }
    }
}
