//! Link watch loop
//!
//! Watches the configured Link by name and drives the [`Supervisor`]:
//! Added/Modified events load the credentials secret and hand both over,
//! Deleted events force-stop the engine. The referenced secret is also
//! re-read periodically so that a rotated secret takes effect without a
//! Link change.
//!
//! A Link deleted while the watch was disconnected produces no Deleted
//! event; the watcher relists instead. A relist that finishes without the
//! Link is treated as its deletion.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::Link;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::supervisor::Supervisor;
use crate::Error;

/// Delay after a Link watcher error before polling it again
const WATCH_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Attempts to load the credentials secret per Link event
const SECRET_LOAD_ATTEMPTS: u32 = 3;

/// Where and what to watch
#[derive(Clone, Debug)]
pub struct LinkWatchConfig {
    /// Namespace holding the Link and its credentials secret
    pub namespace: String,
    /// Name of the Link to follow
    pub link_name: String,
    /// How often to re-read the credentials secret
    pub credentials_refresh: Duration,
}

/// Whether the Link showed up during the watcher's current relist
#[derive(Debug, Default)]
struct Relist {
    in_progress: bool,
    link_listed: bool,
}

impl Relist {
    fn begin(&mut self) {
        self.in_progress = true;
        self.link_listed = false;
    }

    fn listed(&mut self) {
        self.link_listed = true;
    }

    /// Ends the relist; true when it finished without the Link
    fn finish(&mut self) -> bool {
        let missing = self.in_progress && !self.link_listed;
        self.in_progress = false;
        missing
    }
}

/// Run the Link watch until `shutdown` is cancelled
pub async fn run_link_watch(
    client: Client,
    supervisor: Arc<Supervisor>,
    config: LinkWatchConfig,
    shutdown: CancellationToken,
) {
    let links: Api<Link> = Api::namespaced(client.clone(), &config.namespace);
    let secrets: Api<Secret> = Api::namespaced(client, &config.namespace);

    let watcher_config =
        watcher::Config::default().fields(&format!("metadata.name={}", config.link_name));
    let mut link_watcher = std::pin::pin!(watcher::watcher(links, watcher_config));

    let mut refresh = tokio::time::interval(config.credentials_refresh);
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    refresh.tick().await;

    // Last Link seen, for periodic secret refresh
    let mut current: Option<Link> = None;
    let mut relist = Relist::default();

    info!(
        namespace = %config.namespace,
        link = %config.link_name,
        "watching link"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = link_watcher.next() => {
                handle_link_event(&supervisor, &secrets, &config, event, &mut current, &mut relist)
                    .await;
            }
            _ = refresh.tick() => {
                if let Some(link) = &current {
                    refresh_credentials(&supervisor, &secrets, link).await;
                }
            }
        }
    }

    debug!(link = %config.link_name, "link watch stopped");
}

async fn handle_link_event(
    supervisor: &Supervisor,
    secrets: &Api<Secret>,
    config: &LinkWatchConfig,
    event: Result<Event<Link>, watcher::Error>,
    current: &mut Option<Link>,
    relist: &mut Relist,
) {
    match event {
        Ok(Event::Apply(link)) | Ok(Event::InitApply(link)) => {
            // The field selector already filters, but a watcher relist may not
            if link.name_any() != config.link_name {
                return;
            }
            relist.listed();
            *current = Some(link.clone());

            match load_secret(secrets, &link.spec.cluster_credentials_secret).await {
                // Failures are logged by the supervisor
                Ok(secret) => {
                    let _ = supervisor.on_link_event(&link, &secret).await;
                }
                Err(e) => {
                    warn!(
                        link = %config.link_name,
                        secret = %link.spec.cluster_credentials_secret,
                        error = %e,
                        "failed to load credentials secret"
                    );
                    supervisor.on_credentials_unavailable(&link).await;
                }
            }
        }
        Ok(Event::Delete(link)) => {
            if link.name_any() != config.link_name {
                return;
            }
            info!(link = %config.link_name, "link deleted");
            *current = None;
            supervisor.on_link_deleted(&config.link_name).await;
        }
        Ok(Event::Init) => {
            debug!(link = %config.link_name, "link watcher relisting");
            relist.begin();
        }
        Ok(Event::InitDone) => {
            if relist.finish() && current.take().is_some() {
                info!(link = %config.link_name, "link missing after relist, treating as deleted");
                supervisor.on_link_deleted(&config.link_name).await;
            } else {
                debug!(link = %config.link_name, "link watcher initialized");
            }
        }
        Err(e) => {
            warn!(error = %e, link = %config.link_name, "link watcher error, will retry");
            tokio::time::sleep(WATCH_ERROR_DELAY).await;
        }
    }
}

async fn refresh_credentials(supervisor: &Supervisor, secrets: &Api<Secret>, link: &Link) {
    match secrets.get_opt(&link.spec.cluster_credentials_secret).await {
        Ok(Some(secret)) => {
            let _ = supervisor.on_credentials_refresh(link, &secret).await;
        }
        Ok(None) => debug!(
            secret = %link.spec.cluster_credentials_secret,
            "credentials secret not found during refresh"
        ),
        Err(e) => debug!(error = %e, "failed to refresh credentials secret"),
    }
}

async fn load_secret(secrets: &Api<Secret>, name: &str) -> Result<Secret, Error> {
    retry_with_backoff(
        &RetryConfig::with_max_attempts(SECRET_LOAD_ATTEMPTS),
        "load_credentials_secret",
        || async { secrets.get(name).await.map_err(Error::from) },
    )
    .await
}
