//! Local Mirror Store
//!
//! The set of mirror objects materialized in the local cluster. The local
//! API server is the source of truth: nothing is cached here, so a freshly
//! started engine (or a repair pass after a restart) sees exactly what is
//! in the cluster.
//!
//! All mutations are idempotent. Upserts use server-side apply, deletes treat
//! 404 as success, and namespace creation treats 409 as success, so replaying
//! an event after a crash or a retry never fails on "already exists" or
//! "not found".

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::kube_utils::{ignore_already_exists, ignore_not_found};
use crate::mirror::{cluster_selector, MirrorEndpoints, MirrorService, FIELD_MANAGER};
use crate::Error;

/// Local cluster operations on mirror objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Create the namespace if it does not exist
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error>;

    /// Read a mirror service; `None` if absent or not a mirror
    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<MirrorService>, Error>;

    /// List every mirror service originating from `cluster_name`
    async fn list_services(&self, cluster_name: &str) -> Result<Vec<MirrorService>, Error>;

    /// Create or update a mirror service
    async fn upsert_service(&self, service: &MirrorService) -> Result<(), Error>;

    /// Delete a mirror service; absent is success
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Read a mirror endpoint set; `None` if absent
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MirrorEndpoints>, Error>;

    /// Replace a mirror endpoint set with the given content
    async fn upsert_endpoints(&self, endpoints: &MirrorEndpoints) -> Result<(), Error>;

    /// Delete a mirror endpoint set; absent is success
    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`MirrorStore`] backed by the local cluster API
pub struct KubeMirrorStore {
    client: Client,
}

impl KubeMirrorStore {
    /// Create a store wrapping the given local client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl MirrorStore for KubeMirrorStore {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(namespace).await?.is_some() {
            return Ok(());
        }

        debug!(namespace = %namespace, "creating namespace for mirror services");
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        ignore_already_exists(api.create(&PostParams::default(), &ns).await)
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MirrorService>, Error> {
        let service = self.services(namespace).get_opt(name).await?;
        Ok(service.as_ref().and_then(MirrorService::from_local))
    }

    async fn list_services(&self, cluster_name: &str) -> Result<Vec<MirrorService>, Error> {
        let api: Api<Service> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&cluster_selector(cluster_name));
        let list = api.list(&lp).await?;
        Ok(list.items.iter().filter_map(MirrorService::from_local).collect())
    }

    async fn upsert_service(&self, service: &MirrorService) -> Result<(), Error> {
        self.services(&service.namespace)
            .patch(
                &service.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&service.to_service()),
            )
            .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        ignore_not_found(
            self.services(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<MirrorEndpoints>, Error> {
        let endpoints = self.endpoints(namespace).get_opt(name).await?;
        Ok(endpoints.as_ref().and_then(MirrorEndpoints::from_local))
    }

    async fn upsert_endpoints(&self, endpoints: &MirrorEndpoints) -> Result<(), Error> {
        self.endpoints(&endpoints.namespace)
            .patch(
                &endpoints.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&endpoints.to_endpoints()),
            )
            .await?;
        Ok(())
    }

    async fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<(), Error> {
        ignore_not_found(
            self.endpoints(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }
}

/// Delete every mirror service and endpoint set of `cluster_name`.
///
/// Used by the operator-facing purge command; engines never call this.
/// Returns the number of mirror services removed.
pub async fn purge_cluster(store: &dyn MirrorStore, cluster_name: &str) -> Result<usize, Error> {
    let services = store.list_services(cluster_name).await?;
    for service in &services {
        store
            .delete_service(&service.namespace, &service.name)
            .await?;
        store
            .delete_endpoints(&service.namespace, &service.name)
            .await?;
    }
    Ok(services.len())
}
