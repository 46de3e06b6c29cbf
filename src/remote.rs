//! Remote cluster API seam
//!
//! [`RemoteCluster`] is everything an engine reads from the remote side:
//! list snapshots (with the resource version to resume watching from),
//! point reads for the repair pass, and raw watch streams. The kube-backed
//! implementation scopes every call with the Link's label selector and
//! excludes objects that are themselves mirrors.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::credentials::RemoteAccessConfig;
use crate::kube_utils::client_from_kubeconfig;
use crate::mirror::MIRRORED_SERVICE_LABEL;
use crate::Error;

/// Server-side watch timeout; the client read timeout must exceed it
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Raw watch stream from the remote API
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, Error>>;

/// A consistent list of remote objects
#[derive(Clone, Debug, Default)]
pub struct Snapshot<K> {
    /// Objects at `resource_version`
    pub items: Vec<K>,
    /// Resource version to start a watch from
    pub resource_version: String,
}

/// Read access to the remote cluster's services and endpoints
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteCluster: Send + Sync {
    /// List all in-scope remote services
    async fn list_services(&self) -> Result<Snapshot<Service>, Error>;

    /// List all in-scope remote endpoints
    async fn list_endpoints(&self) -> Result<Snapshot<Endpoints>, Error>;

    /// Read the current endpoints of one remote service
    async fn get_endpoints(&self, namespace: &str, name: &str)
        -> Result<Option<Endpoints>, Error>;

    /// Watch remote services from a resource version
    async fn watch_services(&self, resource_version: &str) -> Result<WatchStream<Service>, Error>;

    /// Watch remote endpoints from a resource version
    async fn watch_endpoints(&self, resource_version: &str)
        -> Result<WatchStream<Endpoints>, Error>;
}

/// Builds a [`RemoteCluster`] from parsed credentials
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect to the remote cluster; `selector` restricts mirrored services
    async fn connect(
        &self,
        access: &RemoteAccessConfig,
        selector: Option<String>,
    ) -> Result<Arc<dyn RemoteCluster>, Error>;
}

/// Label selector applied to every remote call: the Link's selector plus
/// exclusion of objects that are already mirrors
pub fn remote_selector(link_selector: Option<&str>) -> String {
    let exclude_mirrors = format!("!{}", MIRRORED_SERVICE_LABEL);
    match link_selector.map(str::trim).filter(|s| !s.is_empty()) {
        Some(selector) => format!("{},{}", selector, exclude_mirrors),
        None => exclude_mirrors,
    }
}

/// [`RemoteCluster`] backed by a kube client built from a remote kubeconfig
pub struct KubeRemoteCluster {
    client: Client,
    selector: String,
}

impl KubeRemoteCluster {
    /// Wrap a client for the remote cluster
    pub fn new(client: Client, link_selector: Option<&str>) -> Self {
        Self {
            client,
            selector: remote_selector(link_selector),
        }
    }

    fn list_params(&self) -> ListParams {
        ListParams::default().labels(&self.selector)
    }

    async fn list<K>(&self) -> Result<Snapshot<K>, Error>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let list = api.list(&self.list_params()).await?;
        Ok(Snapshot {
            items: list.items,
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn watch<K>(&self, resource_version: &str) -> Result<WatchStream<K>, Error>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + 'static,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let wp = WatchParams::default()
            .labels(&self.selector)
            .timeout(WATCH_TIMEOUT_SECS);
        let stream = api.watch(&wp, resource_version).await?;
        Ok(stream.map_err(Error::from).boxed())
    }
}

#[async_trait]
impl RemoteCluster for KubeRemoteCluster {
    async fn list_services(&self) -> Result<Snapshot<Service>, Error> {
        self.list().await
    }

    async fn list_endpoints(&self) -> Result<Snapshot<Endpoints>, Error> {
        self.list().await
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn watch_services(&self, resource_version: &str) -> Result<WatchStream<Service>, Error> {
        self.watch(resource_version).await
    }

    async fn watch_endpoints(
        &self,
        resource_version: &str,
    ) -> Result<WatchStream<Endpoints>, Error> {
        self.watch(resource_version).await
    }
}

/// Connector that builds kube clients from remote kubeconfigs
#[derive(Clone, Debug, Default)]
pub struct KubeRemoteConnector;

#[async_trait]
impl RemoteConnector for KubeRemoteConnector {
    async fn connect(
        &self,
        access: &RemoteAccessConfig,
        selector: Option<String>,
    ) -> Result<Arc<dyn RemoteCluster>, Error> {
        debug!(api_server = %access.api_server, "building remote cluster client");
        let client = client_from_kubeconfig(access.kubeconfig.clone()).await?;
        Ok(Arc::new(KubeRemoteCluster::new(client, selector.as_deref())))
    }
}
