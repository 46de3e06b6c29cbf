//! Stories about the supervisor replacing engines
//!
//! The supervisor is driven directly with Link and secret values, the way
//! the Link watch drives it in production.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use service_mirror::controller::{Engine, EngineState};
use service_mirror::store::purge_cluster;
use service_mirror::supervisor::Supervisor;

use super::fakes::{
    eventually, link, secret, service, settings, FakeConnector, RecordingStore,
};

fn supervisor(connector: Arc<FakeConnector>, store: Arc<RecordingStore>) -> Supervisor {
    Supervisor::new(connector, store, settings(3, Duration::from_secs(3600)))
}

/// Story: the Link's credentials change three times in a row. At every
/// moment at most one engine is Running, and the survivor uses the most
/// recent credentials.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_at_most_one_engine_runs_across_link_changes() {
    let connector = Arc::new(FakeConnector::default());
    let store = RecordingStore::new();
    let supervisor = Arc::new(supervisor(connector.clone(), store));

    // Watch every engine the supervisor ever exposes, on its own thread
    let seen: Arc<Mutex<Vec<Arc<Engine>>>> = Arc::default();
    let done = Arc::new(AtomicBool::new(false));
    let monitor = tokio::spawn({
        let supervisor = supervisor.clone();
        let seen = seen.clone();
        let done = done.clone();
        async move {
            while !done.load(Ordering::SeqCst) {
                {
                    let mut seen = seen.lock();
                    if let Some(active) = supervisor.active() {
                        if !seen.iter().any(|e| Arc::ptr_eq(e, &active.engine)) {
                            seen.push(active.engine);
                        }
                    }
                    let running = seen
                        .iter()
                        .filter(|e| e.state() == EngineState::Running)
                        .count();
                    assert!(running <= 1, "{running} engines running at once");
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    });

    let servers = [
        "https://l1.example:6443",
        "https://l2.example:6443",
        "https://l3.example:6443",
    ];
    for server in servers {
        supervisor
            .on_link_event(&link("east"), &secret(server))
            .await
            .unwrap();

        let active = supervisor.active().unwrap();
        assert_eq!(active.api_server, server);
        assert_eq!(active.engine.state(), EngineState::Running);
        assert!(supervisor.is_ready());

        eventually("the monitor to see the new engine", || {
            seen.lock().iter().any(|e| Arc::ptr_eq(e, &active.engine))
        })
        .await;
    }

    done.store(true, Ordering::SeqCst);
    monitor.await.unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 3);
    for old in &seen[..2] {
        assert_eq!(old.state(), EngineState::Stopped);
    }
    assert_eq!(connector.connects(), servers.to_vec());

    let status = supervisor.status().unwrap();
    assert_eq!(status.link, "east");
    assert_eq!(status.api_server, "https://l3.example:6443");
    assert_eq!(status.state, EngineState::Running);

    supervisor.shutdown().await;
    assert!(!supervisor.is_ready());
}

/// Story: the credentials for "east" are rotated while the engine is busy.
/// The old engine finishes its queued work before the new one starts, so
/// the local cluster never sees writes from both.
#[tokio::test]
async fn story_credential_rotation_never_overlaps_writes() {
    let connector = Arc::new(FakeConnector::default());
    for server in ["https://east-1.example:6443", "https://east-2.example:6443"] {
        let remote = connector.remote_for(server);
        for i in 0..20 {
            remote.seed_service(service("default", &format!("svc-{i}"), 80));
        }
    }

    let store = RecordingStore::with_latency(Duration::from_millis(2));
    let supervisor = supervisor(connector.clone(), store.clone());

    supervisor
        .on_link_event(&link("east"), &secret("https://east-1.example:6443"))
        .await
        .unwrap();
    let first = supervisor.active().unwrap().engine;

    // Rotate while the first engine still has mirrors to create
    supervisor
        .on_link_event(&link("east"), &secret("https://east-2.example:6443"))
        .await
        .unwrap();

    assert_eq!(first.state(), EngineState::Stopped);
    assert_eq!(first.stats().events_processed, 20);

    let second = supervisor.active().unwrap();
    assert_eq!(second.api_server, "https://east-2.example:6443");
    assert_eq!(second.engine.state(), EngineState::Running);
    eventually("the new engine's sync", || {
        second.engine.stats().events_processed == 20
    })
    .await;

    assert_eq!(store.max_in_flight(), 1);
    assert_eq!(store.service_names().len(), 20);
    assert!(store
        .service_names()
        .iter()
        .all(|name| name.ends_with("-east")));

    supervisor.shutdown().await;
}

/// Re-delivering the same Link and secret keeps the running engine.
#[tokio::test]
async fn test_unchanged_link_keeps_engine() {
    let connector = Arc::new(FakeConnector::default());
    let supervisor = supervisor(connector.clone(), RecordingStore::new());

    let server = "https://east.example:6443";
    supervisor
        .on_link_event(&link("east"), &secret(server))
        .await
        .unwrap();
    let engine = supervisor.active().unwrap().engine;

    supervisor
        .on_link_event(&link("east"), &secret(server))
        .await
        .unwrap();
    supervisor
        .on_credentials_refresh(&link("east"), &secret(server))
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&engine, &supervisor.active().unwrap().engine));
    assert_eq!(connector.connects().len(), 1);

    supervisor.shutdown().await;
}

/// A secret rotated in place is picked up by the periodic refresh.
#[tokio::test]
async fn test_credentials_refresh_picks_up_rotated_secret() {
    let connector = Arc::new(FakeConnector::default());
    let supervisor = supervisor(connector.clone(), RecordingStore::new());

    supervisor
        .on_link_event(&link("east"), &secret("https://east-1.example:6443"))
        .await
        .unwrap();
    supervisor
        .on_credentials_refresh(&link("east"), &secret("https://east-2.example:6443"))
        .await
        .unwrap();

    let active = supervisor.active().unwrap();
    assert_eq!(active.api_server, "https://east-2.example:6443");
    assert_eq!(connector.connects().len(), 2);

    supervisor.shutdown().await;
}

/// Story: the Link is deleted. The engine stops at once but the mirrors
/// stay until an operator purges them.
#[tokio::test]
async fn story_link_deletion_leaves_mirrors_until_purged() {
    let connector = Arc::new(FakeConnector::default());
    let remote = connector.remote_for("https://east.example:6443");
    remote.seed_service(service("default", "svc-a", 80));
    remote.seed_service(service("default", "svc-b", 80));

    let store = RecordingStore::new();
    let supervisor = supervisor(connector.clone(), store.clone());
    supervisor
        .on_link_event(&link("east"), &secret("https://east.example:6443"))
        .await
        .unwrap();
    let engine = supervisor.active().unwrap().engine;
    eventually("both mirrors", || store.service_names().len() == 2).await;

    supervisor.on_link_deleted("east").await;

    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(supervisor.active().is_none());
    assert!(!supervisor.is_ready());
    assert_eq!(store.service_names().len(), 2);

    let removed = purge_cluster(store.as_ref(), "east").await.unwrap();
    assert_eq!(removed, 2);
    assert!(store.service_names().is_empty());
    assert!(store.endpoints("default", "svc-a-east").is_none());
}

/// A Link that fails validation starts nothing and connects nowhere.
#[tokio::test]
async fn test_invalid_link_starts_no_engine() {
    let connector = Arc::new(FakeConnector::default());
    let supervisor = supervisor(connector.clone(), RecordingStore::new());

    let result = supervisor
        .on_link_event(&link("Not_A_Label"), &secret("https://east.example:6443"))
        .await;

    assert!(result.is_err());
    assert!(supervisor.active().is_none());
    assert!(connector.connects().is_empty());
}

/// Story: the remote API server accepts the connection but never answers
/// the initial list. Deleting the Link still cancels the stuck engine
/// promptly instead of waiting behind its start.
#[tokio::test]
async fn story_link_deletion_cancels_engine_stuck_in_initial_sync() {
    let connector = Arc::new(FakeConnector::default());
    connector
        .remote_for("https://east.example:6443")
        .stop_answering();
    let supervisor = Arc::new(supervisor(connector.clone(), RecordingStore::new()));

    let start = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            supervisor
                .on_link_event(&link("east"), &secret("https://east.example:6443"))
                .await
        }
    });
    eventually("the engine to begin its sync", || supervisor.is_starting()).await;

    tokio::time::timeout(Duration::from_secs(2), supervisor.on_link_deleted("east"))
        .await
        .expect("deletion waited on the stuck start");

    let started = tokio::time::timeout(Duration::from_secs(2), start)
        .await
        .expect("start never returned")
        .unwrap();
    assert!(started.is_err());
    assert!(!supervisor.is_starting());
    assert!(supervisor.active().is_none());
}

/// Shutdown does not hang on an engine that never finishes starting.
#[tokio::test]
async fn test_shutdown_cancels_engine_stuck_in_initial_sync() {
    let connector = Arc::new(FakeConnector::default());
    connector
        .remote_for("https://east.example:6443")
        .stop_answering();
    let supervisor = Arc::new(supervisor(connector.clone(), RecordingStore::new()));

    let start = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            supervisor
                .on_link_event(&link("east"), &secret("https://east.example:6443"))
                .await
        }
    });
    eventually("the engine to begin its sync", || supervisor.is_starting()).await;

    tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
        .await
        .expect("shutdown waited on the stuck start");

    assert!(start.await.unwrap().is_err());
    assert!(supervisor.active().is_none());

    // Events that arrive after shutdown start nothing
    let late = supervisor
        .on_link_event(&link("east"), &secret("https://east-2.example:6443"))
        .await;
    assert!(late.is_err());
    assert!(supervisor.active().is_none());
    assert_eq!(connector.connects().len(), 1);
}

/// Story: the credentials secret disappears after the Link was updated.
/// The engine built from the old credentials is stopped, and once the
/// secret is readable again the next refresh brings an engine back.
#[tokio::test]
async fn story_unreadable_secret_stops_engine_until_it_returns() {
    let connector = Arc::new(FakeConnector::default());
    let supervisor = supervisor(connector.clone(), RecordingStore::new());
    let server = "https://east.example:6443";

    supervisor
        .on_link_event(&link("east"), &secret(server))
        .await
        .unwrap();
    let old = supervisor.active().unwrap().engine;

    supervisor.on_credentials_unavailable(&link("east")).await;

    assert_eq!(old.state(), EngineState::Stopped);
    assert!(supervisor.active().is_none());
    assert!(!supervisor.is_ready());

    // Same secret as before; still restarts because the last attempt was cleared
    supervisor
        .on_credentials_refresh(&link("east"), &secret(server))
        .await
        .unwrap();

    let active = supervisor.active().unwrap();
    assert!(!Arc::ptr_eq(&old, &active.engine));
    assert_eq!(active.engine.state(), EngineState::Running);
    assert_eq!(connector.connects().len(), 2);

    supervisor.shutdown().await;
}
