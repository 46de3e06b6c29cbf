//! In-memory stand-ins for the remote cluster, the connector, and the
//! local mirror store
//!
//! The fake remote feeds watch streams from channels so tests decide exactly
//! which changes are delivered as events and which only show up on a
//! relist or point read. The recording store keeps every mutation in order
//! and tracks how many mutations were in flight at once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Secret, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::WatchEvent;
use parking_lot::Mutex;

use service_mirror::config::EngineSettings;
use service_mirror::controller::{Engine, EngineConfig};
use service_mirror::credentials::{RemoteAccessConfig, KUBECONFIG_KEY, REMOTE_KUBECONFIG_SECRET_TYPE};
use service_mirror::crd::{Link, LinkSpec};
use service_mirror::mirror::{MirrorEndpoints, MirrorService, MirrorTarget};
use service_mirror::remote::{RemoteCluster, RemoteConnector, Snapshot, WatchStream};
use service_mirror::retry::RetryConfig;
use service_mirror::store::MirrorStore;
use service_mirror::Error;

type Key = (String, String);
type Sender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>, Error>>;

// =============================================================================
// Fixtures
// =============================================================================

/// A remote service exposing one TCP port
pub fn service(namespace: &str, name: &str, port: i32) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Remote endpoints with every address ready on port 8080
pub fn endpoints(namespace: &str, name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some("http".to_string()),
                port: 8080,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// Fast engine settings; `repair_period` controls the repair pass
pub fn settings(requeue_limit: u32, repair_period: Duration) -> EngineSettings {
    EngineSettings {
        requeue_limit,
        repair_period,
        requeue_backoff: RetryConfig::immediate(),
        reconnect_backoff: RetryConfig::immediate(),
    }
}

/// An engine mirroring `remote` for cluster "remote" with domain "cluster.remote"
pub fn engine(
    remote: Arc<FakeRemote>,
    store: Arc<RecordingStore>,
    settings: EngineSettings,
) -> Engine {
    Engine::new(
        EngineConfig {
            link_name: "remote".to_string(),
            target: MirrorTarget::new("remote", "cluster.remote"),
            settings,
        },
        remote,
        store,
    )
}

/// The "east" Link mirroring the given cluster
pub fn link(cluster: &str) -> Link {
    let mut link = Link::new(
        "east",
        LinkSpec {
            target_cluster_name: cluster.to_string(),
            target_cluster_domain: "cluster.local".to_string(),
            cluster_credentials_secret: "east-credentials".to_string(),
            selector: None,
        },
    );
    link.metadata.namespace = Some("service-mirror".to_string());
    link
}

/// A credentials secret whose kubeconfig points at `server`
pub fn secret(server: &str) -> Secret {
    let kubeconfig = format!(
        "apiVersion: v1\nkind: Config\ncurrent-context: east\nclusters:\n- name: east\n  cluster:\n    server: {}\ncontexts:\n- name: east\n  context:\n    cluster: east\n    user: mirror\nusers:\n- name: mirror\n  user:\n    token: abc\n",
        server
    );
    Secret {
        metadata: ObjectMeta {
            name: Some("east-credentials".to_string()),
            namespace: Some("service-mirror".to_string()),
            ..Default::default()
        },
        type_: Some(REMOTE_KUBECONFIG_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            KUBECONFIG_KEY.to_string(),
            ByteString(kubeconfig.into_bytes()),
        )])),
        ..Default::default()
    }
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn key_of(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

// =============================================================================
// Remote cluster
// =============================================================================

#[derive(Default)]
struct RemoteState {
    services: BTreeMap<Key, Service>,
    endpoints: BTreeMap<Key, Endpoints>,
    version: u64,
    service_watchers: Vec<Sender<Service>>,
    endpoint_watchers: Vec<Sender<Endpoints>>,
    watches_opened: usize,
    unresponsive: bool,
}

impl RemoteState {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

fn notify<K: Clone>(watchers: &mut Vec<Sender<K>>, event: WatchEvent<K>) {
    watchers.retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
}

/// A remote cluster held in memory
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    /// An empty remote cluster
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add or replace a service without emitting a watch event
    pub fn seed_service(&self, service: Service) {
        let mut state = self.state.lock();
        state.bump();
        state.services.insert(key_of(&service.metadata), service);
    }

    /// Add or replace endpoints without emitting a watch event
    pub fn seed_endpoints(&self, endpoints: Endpoints) {
        let mut state = self.state.lock();
        state.bump();
        state.endpoints.insert(key_of(&endpoints.metadata), endpoints);
    }

    /// Remove a service without emitting a watch event
    pub fn forget_service(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        state.bump();
        let key = (namespace.to_string(), name.to_string());
        state.services.remove(&key);
        state.endpoints.remove(&key);
    }

    /// Add a service and deliver an Added event
    pub fn add_service(&self, service: Service) {
        self.put_service(service, true);
    }

    /// Replace a service and deliver a Modified event
    pub fn modify_service(&self, service: Service) {
        self.put_service(service, false);
    }

    fn put_service(&self, mut service: Service, added: bool) {
        let mut state = self.state.lock();
        service.metadata.resource_version = Some(state.bump());
        state
            .services
            .insert(key_of(&service.metadata), service.clone());
        let event = if added {
            WatchEvent::Added(service)
        } else {
            WatchEvent::Modified(service)
        };
        notify(&mut state.service_watchers, event);
    }

    /// Remove a service and deliver a Deleted event
    pub fn delete_service(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        state.bump();
        let key = (namespace.to_string(), name.to_string());
        state.endpoints.remove(&key);
        if let Some(service) = state.services.remove(&key) {
            notify(&mut state.service_watchers, WatchEvent::Deleted(service));
        }
    }

    /// Add or replace endpoints and deliver the matching event
    pub fn set_endpoints(&self, mut endpoints: Endpoints) {
        let mut state = self.state.lock();
        endpoints.metadata.resource_version = Some(state.bump());
        let previous = state
            .endpoints
            .insert(key_of(&endpoints.metadata), endpoints.clone());
        let event = match previous {
            Some(_) => WatchEvent::Modified(endpoints),
            None => WatchEvent::Added(endpoints),
        };
        notify(&mut state.endpoint_watchers, event);
    }

    /// End every open watch stream, as an API server timeout would
    pub fn close_watches(&self) {
        let mut state = self.state.lock();
        state.service_watchers.clear();
        state.endpoint_watchers.clear();
    }

    /// Service lists never return from now on, as with an API server
    /// that accepts connections but stopped answering
    pub fn stop_answering(&self) {
        self.state.lock().unresponsive = true;
    }

    /// Number of watch streams opened so far (two per engine sync)
    pub fn watches_opened(&self) -> usize {
        self.state.lock().watches_opened
    }
}

#[async_trait]
impl RemoteCluster for FakeRemote {
    async fn list_services(&self) -> Result<Snapshot<Service>, Error> {
        if self.state.lock().unresponsive {
            futures::future::pending::<()>().await;
        }
        let state = self.state.lock();
        Ok(Snapshot {
            items: state.services.values().cloned().collect(),
            resource_version: state.version.to_string(),
        })
    }

    async fn list_endpoints(&self) -> Result<Snapshot<Endpoints>, Error> {
        let state = self.state.lock();
        Ok(Snapshot {
            items: state.endpoints.values().cloned().collect(),
            resource_version: state.version.to_string(),
        })
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, Error> {
        Ok(self
            .state
            .lock()
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn watch_services(&self, _resource_version: &str) -> Result<WatchStream<Service>, Error> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        state.service_watchers.push(tx);
        state.watches_opened += 1;
        Ok(rx.boxed())
    }

    async fn watch_endpoints(
        &self,
        _resource_version: &str,
    ) -> Result<WatchStream<Endpoints>, Error> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        state.endpoint_watchers.push(tx);
        state.watches_opened += 1;
        Ok(rx.boxed())
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Hands out one fake remote per API server URL
#[derive(Default)]
pub struct FakeConnector {
    remotes: Mutex<BTreeMap<String, Arc<FakeRemote>>>,
    connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    /// The remote reached through `api_server`, created on first use
    pub fn remote_for(&self, api_server: &str) -> Arc<FakeRemote> {
        self.remotes
            .lock()
            .entry(api_server.to_string())
            .or_insert_with(FakeRemote::new)
            .clone()
    }

    /// API servers connected to, in order
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        access: &RemoteAccessConfig,
        _selector: Option<String>,
    ) -> Result<Arc<dyn RemoteCluster>, Error> {
        self.connects.lock().push(access.api_server.clone());
        Ok(self.remote_for(&access.api_server))
    }
}

// =============================================================================
// Local store
// =============================================================================

/// One successful mutation of the local store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    EnsureNamespace(String),
    UpsertService(MirrorService),
    DeleteService(String, String),
    UpsertEndpoints(MirrorEndpoints),
    DeleteEndpoints(String, String),
}

#[derive(Default)]
struct StoreState {
    services: BTreeMap<Key, MirrorService>,
    endpoints: BTreeMap<Key, MirrorEndpoints>,
    calls: Vec<StoreCall>,
}

/// Decrements the in-flight counter even when the caller is aborted
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A local store held in memory that records every mutation
#[derive(Default)]
pub struct RecordingStore {
    state: Mutex<StoreState>,
    latency: Duration,
    failing: AtomicBool,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingStore {
    /// A store that applies mutations immediately
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A store where every mutation takes `latency`
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    /// Make every mutation fail with a retryable error
    pub fn fail_mutations(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful mutations, in order
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    /// Mutations attempted, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of mutations observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Stored mirror service
    pub fn service(&self, namespace: &str, name: &str) -> Option<MirrorService> {
        self.state
            .lock()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Stored mirror endpoint set
    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<MirrorEndpoints> {
        self.state
            .lock()
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of all stored mirror services
    pub fn service_names(&self) -> Vec<String> {
        self.state
            .lock()
            .services
            .values()
            .map(|s| s.name.clone())
            .collect()
    }

    async fn mutate(
        &self,
        call: StoreCall,
        apply: impl FnOnce(&mut StoreState),
    ) -> Result<(), Error> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::internal("injected store failure"));
        }

        let mut state = self.state.lock();
        apply(&mut state);
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl MirrorStore for RecordingStore {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error> {
        self.mutate(StoreCall::EnsureNamespace(namespace.to_string()), |_| {})
            .await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MirrorService>, Error> {
        Ok(self.service(namespace, name))
    }

    async fn list_services(&self, cluster_name: &str) -> Result<Vec<MirrorService>, Error> {
        Ok(self
            .state
            .lock()
            .services
            .values()
            .filter(|s| s.cluster_name == cluster_name)
            .cloned()
            .collect())
    }

    async fn upsert_service(&self, service: &MirrorService) -> Result<(), Error> {
        let stored = service.clone();
        self.mutate(StoreCall::UpsertService(service.clone()), move |state| {
            state
                .services
                .insert((stored.namespace.clone(), stored.name.clone()), stored);
        })
        .await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let key = (namespace.to_string(), name.to_string());
        self.mutate(
            StoreCall::DeleteService(key.0.clone(), key.1.clone()),
            move |state| {
                state.services.remove(&key);
            },
        )
        .await
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MirrorEndpoints>, Error> {
        Ok(self.endpoints(namespace, name))
    }

    async fn upsert_endpoints(&self, endpoints: &MirrorEndpoints) -> Result<(), Error> {
        let stored = endpoints.clone();
        self.mutate(StoreCall::UpsertEndpoints(endpoints.clone()), move |state| {
            state
                .endpoints
                .insert((stored.namespace.clone(), stored.name.clone()), stored);
        })
        .await
    }

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let key = (namespace.to_string(), name.to_string());
        self.mutate(
            StoreCall::DeleteEndpoints(key.0.clone(), key.1.clone()),
            move |state| {
                state.endpoints.remove(&key);
            },
        )
        .await
    }
}
