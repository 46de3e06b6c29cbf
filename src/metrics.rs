//! OpenTelemetry metrics for the service mirror
//!
//! Counters are labelled with `cluster`, the remote cluster name of the
//! engine that recorded them. Each engine also keeps the same counts in
//! [`EngineStats`](crate::controller::EngineStats) for the admin endpoint.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// Global meter for service mirror metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("service-mirror"));

/// Counter of remote events applied to the local cluster
pub static EVENTS_PROCESSED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("service_mirror_events_processed_total")
        .with_description("Remote events applied to the local cluster")
        .with_unit("{events}")
        .build()
});

/// Counter of event retries after a transient failure
pub static EVENTS_REQUEUED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("service_mirror_events_requeued_total")
        .with_description("Remote events retried after a transient failure")
        .with_unit("{events}")
        .build()
});

/// Counter of events dropped after a permanent failure or too many retries
pub static EVENTS_ABANDONED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("service_mirror_events_abandoned_total")
        .with_description("Remote events abandoned without being applied")
        .with_unit("{events}")
        .build()
});

/// Counter of completed endpoint repair passes
pub static REPAIR_PASSES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("service_mirror_repair_passes_total")
        .with_description("Endpoint repair passes run")
        .with_unit("{passes}")
        .build()
});

/// Counter of remote watch re-establishments
pub static WATCH_RESTARTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("service_mirror_watch_restarts_total")
        .with_description("Remote watches re-established after closing")
        .with_unit("{restarts}")
        .build()
});

/// Label set for a remote cluster
pub fn cluster_labels(cluster: &str) -> [KeyValue; 1] {
    [KeyValue::new("cluster", cluster.to_string())]
}
