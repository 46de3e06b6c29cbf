//! Remote event handlers
//!
//! Each handler maps one remote event to the local mutations it implies.
//! Handlers compare against the local cluster before writing, so replaying
//! an event (after a retry or a relist) produces no extra writes.
//!
//! A mirror name owned by another cluster's mirror is never written or
//! deleted; the event is skipped with a warning.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::engine::EngineContext;
use crate::mirror::{MirrorEndpoints, MirrorService, MIRRORED_SERVICE_LABEL};
use crate::watch::{Operation, RemoteEvent};
use crate::Error;

/// Whether a remote object is itself a mirror (never mirrored back)
pub(crate) fn is_mirror<K: ResourceExt>(obj: &K) -> bool {
    obj.labels().contains_key(MIRRORED_SERVICE_LABEL)
}

/// Apply one remote event to the local mirror store
pub(crate) async fn apply_event(ctx: &EngineContext, event: &RemoteEvent) -> Result<(), Error> {
    match event {
        RemoteEvent::Service(_, service) if is_mirror(service) => {
            debug!(service = %event.object_key(), "skipping remote service that is a mirror");
            Ok(())
        }
        RemoteEvent::Service(Operation::Added | Operation::Modified, service) => {
            upsert_service(ctx, service).await
        }
        RemoteEvent::Service(Operation::Deleted, service) => delete_service(ctx, service).await,
        RemoteEvent::Endpoints(_, endpoints) if is_mirror(endpoints) => Ok(()),
        RemoteEvent::Endpoints(Operation::Added | Operation::Modified, endpoints) => {
            let desired = MirrorEndpoints::from_remote(endpoints, &ctx.target)?;
            replace_endpoints(ctx, desired).await
        }
        RemoteEvent::Endpoints(Operation::Deleted, endpoints) => {
            let mut desired = MirrorEndpoints::from_remote(endpoints, &ctx.target)?;
            desired.subsets.clear();
            replace_endpoints(ctx, desired).await
        }
    }
}

async fn upsert_service(ctx: &EngineContext, remote: &Service) -> Result<(), Error> {
    let desired = MirrorService::from_remote(remote, &ctx.target)?;

    match ctx
        .store
        .get_service(&desired.namespace, &desired.name)
        .await?
    {
        None => {
            ctx.store.ensure_namespace(&desired.namespace).await?;
            ctx.store.upsert_service(&desired).await?;
            ctx.store
                .upsert_endpoints(&MirrorEndpoints::empty_for(&desired))
                .await?;
            info!(
                cluster = %ctx.target.cluster_name,
                namespace = %desired.namespace,
                mirror = %desired.name,
                "created mirror service"
            );
        }
        Some(current)
            if owned_elsewhere(ctx, &desired.namespace, &desired.name, &current.cluster_name) => {}
        Some(current) if current != desired => {
            ctx.store.upsert_service(&desired).await?;
            debug!(
                cluster = %ctx.target.cluster_name,
                namespace = %desired.namespace,
                mirror = %desired.name,
                "updated mirror service"
            );
        }
        Some(_) => {}
    }
    Ok(())
}

/// Warns and returns true when the mirror belongs to another cluster
fn owned_elsewhere(ctx: &EngineContext, namespace: &str, name: &str, owner: &str) -> bool {
    if owner == ctx.target.cluster_name {
        return false;
    }
    warn!(
        cluster = %ctx.target.cluster_name,
        namespace = %namespace,
        mirror = %name,
        owner = %owner,
        "mirror name is owned by another cluster, skipping"
    );
    true
}

async fn delete_service(ctx: &EngineContext, remote: &Service) -> Result<(), Error> {
    let mirror = MirrorService::from_remote(remote, &ctx.target)?;

    match ctx.store.get_service(&mirror.namespace, &mirror.name).await? {
        Some(current)
            if owned_elsewhere(ctx, &mirror.namespace, &mirror.name, &current.cluster_name) =>
        {
            return Ok(());
        }
        Some(_) => {
            ctx.store
                .delete_service(&mirror.namespace, &mirror.name)
                .await?;
        }
        None => {}
    }

    // Also reached on a retry after the service delete went through
    match ctx
        .store
        .get_endpoints(&mirror.namespace, &mirror.name)
        .await?
    {
        Some(current) if current.cluster_name == ctx.target.cluster_name => {
            ctx.store
                .delete_endpoints(&mirror.namespace, &mirror.name)
                .await?;
        }
        _ => {}
    }

    info!(
        cluster = %ctx.target.cluster_name,
        namespace = %mirror.namespace,
        mirror = %mirror.name,
        remote = %remote.name_any(),
        "deleted mirror service"
    );
    Ok(())
}

/// Replace the whole endpoint set of a mirror. Endpoints of services that
/// have no mirror yet are skipped; the repair pass fills them in.
async fn replace_endpoints(ctx: &EngineContext, desired: MirrorEndpoints) -> Result<(), Error> {
    match ctx
        .store
        .get_service(&desired.namespace, &desired.name)
        .await?
    {
        None => {
            debug!(
                cluster = %ctx.target.cluster_name,
                namespace = %desired.namespace,
                mirror = %desired.name,
                "no mirror service for endpoints, skipping"
            );
            return Ok(());
        }
        Some(service)
            if owned_elsewhere(ctx, &desired.namespace, &desired.name, &service.cluster_name) =>
        {
            return Ok(());
        }
        Some(_) => {}
    }

    let current = ctx
        .store
        .get_endpoints(&desired.namespace, &desired.name)
        .await?;
    if current.as_ref() == Some(&desired) {
        return Ok(());
    }

    ctx.store.upsert_endpoints(&desired).await?;
    debug!(
        cluster = %ctx.target.cluster_name,
        namespace = %desired.namespace,
        mirror = %desired.name,
        addresses = desired.addresses().len(),
        "replaced mirror endpoints"
    );
    Ok(())
}
