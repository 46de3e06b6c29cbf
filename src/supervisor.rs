//! Watcher Supervisor
//!
//! Owns the single active engine. Every Link event is handled under one
//! async mutex, and the hand-off is strictly "stop the old engine and wait
//! for it, then start the new one", so two engines never write mirrors for
//! the same link at the same time.
//!
//! An engine whose initial sync is still running sits in a separate slot
//! outside the transition lock, so a Link deletion or process shutdown can
//! cancel it without waiting for the sync to finish.
//!
//! A failed start (bad Link, bad credentials, unreachable remote) is logged
//! and leaves no engine behind. The supervisor does not retry on its own;
//! the next Link change (or a credentials change) triggers a new attempt.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::controller::{Engine, EngineConfig, EngineState, StatsSnapshot};
use crate::credentials::RemoteAccessConfig;
use crate::crd::Link;
use crate::kube_utils::deterministic_hash;
use crate::mirror::MirrorTarget;
use crate::remote::RemoteConnector;
use crate::store::MirrorStore;
use crate::Error;

/// The engine currently owned by the supervisor
#[derive(Clone)]
pub struct ActiveEngine {
    /// Link the engine serves
    pub link_name: String,
    /// Digest of the Link spec and credentials the engine was built from
    pub fingerprint: String,
    /// Remote API server the engine talks to
    pub api_server: String,
    /// The engine itself
    pub engine: Arc<Engine>,
}

/// Status of the active engine, served by the admin endpoint
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    /// Link name
    pub link: String,
    /// Remote cluster name
    pub cluster: String,
    /// Remote cluster domain
    pub domain: String,
    /// Remote API server
    pub api_server: String,
    /// Lifecycle state
    pub state: EngineState,
    /// Counters
    pub stats: StatsSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    LinkEvent,
    CredentialsRefresh,
}

/// Keeps at most one engine alive and hands off between generations
pub struct Supervisor {
    connector: Arc<dyn RemoteConnector>,
    store: Arc<dyn MirrorStore>,
    settings: EngineSettings,
    /// Serializes transitions; holds the fingerprint of the last start attempt
    transitions: Mutex<Option<String>>,
    /// Engine inside `start()`, reachable without the transition lock
    starting: SyncMutex<Option<Arc<Engine>>>,
    active: RwLock<Option<ActiveEngine>>,
    /// Cancelled by `shutdown`; no engine starts afterwards
    closing: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor with no active engine
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn MirrorStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            connector,
            store,
            settings,
            transitions: Mutex::new(None),
            starting: SyncMutex::new(None),
            active: RwLock::new(None),
            closing: CancellationToken::new(),
        }
    }

    /// Handle an Added/Modified Link event with its credentials secret.
    ///
    /// A repeated event with an unchanged spec and secret is ignored while
    /// the engine is Running. Otherwise the current engine is stopped
    /// gracefully and a new one is started from the given credentials.
    pub async fn on_link_event(&self, link: &Link, secret: &Secret) -> Result<(), Error> {
        self.handle(link, secret, Trigger::LinkEvent).await
    }

    /// Handle a periodic re-read of the credentials secret.
    ///
    /// Only restarts when the spec or secret changed since the last start
    /// attempt, so a permanently broken secret is not retried in a loop.
    pub async fn on_credentials_refresh(&self, link: &Link, secret: &Secret) -> Result<(), Error> {
        self.handle(link, secret, Trigger::CredentialsRefresh).await
    }

    async fn handle(&self, link: &Link, secret: &Secret, trigger: Trigger) -> Result<(), Error> {
        let link_name = link.name_any();
        let fingerprint = link_fingerprint(link, secret)?;
        let mut last_attempt = self.transitions.lock().await;
        if self.closing.is_cancelled() {
            return Err(Error::internal_with_context("supervisor", "shutting down"));
        }

        if let Some(active) = self.active() {
            if active.link_name == link_name
                && active.fingerprint == fingerprint
                && active.engine.state() == EngineState::Running
            {
                debug!(link = %link_name, "link and credentials unchanged, keeping engine");
                return Ok(());
            }
        }
        if trigger == Trigger::CredentialsRefresh && last_attempt.as_deref() == Some(&fingerprint)
        {
            return Ok(());
        }
        *last_attempt = Some(fingerprint.clone());

        let previous = self.active.write().take();
        if let Some(old) = previous {
            info!(
                link = %old.link_name,
                cluster = %old.engine.target().cluster_name,
                "link changed, stopping current engine"
            );
            old.engine.stop(false).await;
        }

        match self.launch(link, secret, fingerprint).await {
            Ok(active) => {
                info!(
                    link = %link_name,
                    cluster = %active.engine.target().cluster_name,
                    api_server = %active.api_server,
                    "engine started"
                );
                *self.active.write() = Some(active);
                Ok(())
            }
            Err(e) => {
                error!(
                    link = %link_name,
                    error = %e,
                    "failed to start engine, waiting for the next link or secret change"
                );
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        link: &Link,
        secret: &Secret,
        fingerprint: String,
    ) -> Result<ActiveEngine, Error> {
        link.validate()?;
        let access = RemoteAccessConfig::from_secret(secret)?;
        let remote = self
            .connector
            .connect(&access, link.spec.selector.clone())
            .await?;

        let link_name = link.name_any();
        let engine = Arc::new(Engine::new(
            EngineConfig {
                link_name: link_name.clone(),
                target: MirrorTarget::new(link.cluster_name(), link.cluster_domain()),
                settings: self.settings.clone(),
            },
            remote,
            self.store.clone(),
        ));
        *self.starting.lock() = Some(engine.clone());
        if self.closing.is_cancelled() {
            engine.stop(true).await;
        }
        let started = engine.start().await;
        self.starting.lock().take();
        started?;

        Ok(ActiveEngine {
            link_name,
            fingerprint,
            api_server: access.api_server,
            engine,
        })
    }

    /// Handle deletion of the Link: force-stop its engine.
    ///
    /// Mirror objects are left in place; operators remove them with
    /// `service-mirror purge <cluster>`.
    pub async fn on_link_deleted(&self, link_name: &str) {
        self.cancel_starting(link_name).await;
        let mut last_attempt = self.transitions.lock().await;
        *last_attempt = None;

        let previous = {
            let mut active = self.active.write();
            if active.as_ref().is_some_and(|a| a.link_name == link_name) {
                active.take()
            } else {
                None
            }
        };

        match previous {
            Some(old) => {
                let cluster = old.engine.target().cluster_name.clone();
                old.engine.stop(true).await;
                warn!(
                    link = %link_name,
                    cluster = %cluster,
                    "link deleted; mirror services were left in place, run `service-mirror purge {}` to remove them",
                    cluster
                );
            }
            None => debug!(link = %link_name, "link deleted with no active engine"),
        }
    }

    /// The credentials secret for `link` could not be loaded.
    ///
    /// The active engine is stopped gracefully rather than left running on
    /// credentials that may no longer be valid. The last attempt is cleared
    /// so the next refresh that finds a readable secret starts a new engine.
    pub async fn on_credentials_unavailable(&self, link: &Link) {
        let link_name = link.name_any();
        let mut last_attempt = self.transitions.lock().await;
        *last_attempt = None;

        let previous = self.active.write().take();
        if let Some(old) = previous {
            warn!(
                link = %link_name,
                cluster = %old.engine.target().cluster_name,
                "credentials secret unavailable, stopping engine"
            );
            old.engine.stop(false).await;
        }
    }

    /// Gracefully stop the active engine, if any. Later Link events start
    /// nothing.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let starting = self.starting.lock().take();
        if let Some(engine) = starting {
            engine.stop(false).await;
        }
        let _transitions = self.transitions.lock().await;
        let previous = self.active.write().take();
        if let Some(old) = previous {
            old.engine.stop(false).await;
        }
    }

    /// Force-stop an engine of `link_name` that is still in its initial sync.
    ///
    /// Its `start()` returns an error, which releases the transition lock.
    async fn cancel_starting(&self, link_name: &str) {
        let starting = {
            let mut slot = self.starting.lock();
            if slot.as_ref().is_some_and(|e| e.link_name() == link_name) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(engine) = starting {
            info!(link = %link_name, "cancelling engine that is still starting");
            engine.stop(true).await;
        }
    }

    /// Whether an engine is inside its initial sync
    pub fn is_starting(&self) -> bool {
        self.starting.lock().is_some()
    }

    /// The active engine, if any
    pub fn active(&self) -> Option<ActiveEngine> {
        self.active.read().clone()
    }

    /// Whether an engine is Running
    pub fn is_ready(&self) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|a| a.engine.state() == EngineState::Running)
    }

    /// Status of the active engine, if any
    pub fn status(&self) -> Option<EngineStatus> {
        self.active.read().as_ref().map(|a| EngineStatus {
            link: a.link_name.clone(),
            cluster: a.engine.target().cluster_name.clone(),
            domain: a.engine.target().cluster_domain.clone(),
            api_server: a.api_server.clone(),
            state: a.engine.state(),
            stats: a.engine.stats(),
        })
    }
}

/// Digest of everything an engine is built from
fn link_fingerprint(link: &Link, secret: &Secret) -> Result<String, Error> {
    let material = serde_json::to_vec(&(
        &link.spec,
        &secret.type_,
        &secret.data,
        &secret.string_data,
    ))
    .map_err(|e| Error::internal_with_context("supervisor", e.to_string()))?;
    Ok(deterministic_hash(&material))
}
