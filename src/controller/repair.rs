//! Repair pass and orphan collection
//!
//! The repair pass re-derives every mirror endpoint set from the remote
//! cluster's current state and writes only where the local copy differs.
//! Running it twice with no remote change writes nothing the second time.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::engine::EngineContext;
use crate::mirror::{MirrorEndpoints, MirrorService};
use crate::Error;

/// Result of one repair pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RepairOutcome {
    /// Mirror services examined
    pub checked: usize,
    /// Endpoint sets rewritten because they drifted
    pub updated: usize,
    /// Mirror services that could not be repaired this pass
    pub failed: usize,
}

/// Recompute the endpoint set of every mirror of this engine's cluster.
///
/// A failure for one service is logged and does not stop the pass; only
/// failing to list the local mirrors fails the whole pass.
pub(crate) async fn repair_endpoints(ctx: &EngineContext) -> Result<RepairOutcome, Error> {
    let mirrors = ctx.store.list_services(&ctx.target.cluster_name).await?;
    let mut outcome = RepairOutcome::default();

    for mirror in &mirrors {
        outcome.checked += 1;
        match repair_one(ctx, mirror).await {
            Ok(true) => outcome.updated += 1,
            Ok(false) => {}
            Err(e) => {
                outcome.failed += 1;
                warn!(
                    cluster = %ctx.target.cluster_name,
                    namespace = %mirror.namespace,
                    mirror = %mirror.name,
                    error = %e,
                    "failed to repair mirror endpoints"
                );
            }
        }
    }

    ctx.stats.record_repair_pass();
    if outcome.updated > 0 || outcome.failed > 0 {
        info!(
            cluster = %ctx.target.cluster_name,
            checked = outcome.checked,
            updated = outcome.updated,
            failed = outcome.failed,
            "repair pass corrected drift"
        );
    } else {
        debug!(
            cluster = %ctx.target.cluster_name,
            checked = outcome.checked,
            "repair pass found no drift"
        );
    }
    Ok(outcome)
}

/// Returns whether the endpoint set was rewritten
async fn repair_one(ctx: &EngineContext, mirror: &MirrorService) -> Result<bool, Error> {
    let desired = match ctx
        .remote
        .get_endpoints(&mirror.namespace, &mirror.remote_name)
        .await?
    {
        Some(remote) => MirrorEndpoints::from_remote(&remote, &ctx.target)?,
        None => MirrorEndpoints::empty_for(mirror),
    };

    let current = ctx
        .store
        .get_endpoints(&mirror.namespace, &mirror.name)
        .await?;
    if current.as_ref() == Some(&desired) {
        return Ok(false);
    }

    ctx.store.upsert_endpoints(&desired).await?;
    Ok(true)
}

/// Delete local mirrors whose remote service is not in `live`.
///
/// `live` holds `(namespace, remote name)` pairs from a fresh remote list.
/// Returns the number of mirrors removed.
pub(crate) async fn collect_orphans(
    ctx: &EngineContext,
    live: &BTreeSet<(String, String)>,
) -> Result<usize, Error> {
    let mirrors = ctx.store.list_services(&ctx.target.cluster_name).await?;
    let mut removed = 0;

    for mirror in mirrors {
        let key = (mirror.namespace.clone(), mirror.remote_name.clone());
        if live.contains(&key) {
            continue;
        }
        ctx.store
            .delete_service(&mirror.namespace, &mirror.name)
            .await?;
        ctx.store
            .delete_endpoints(&mirror.namespace, &mirror.name)
            .await?;
        removed += 1;
        info!(
            cluster = %ctx.target.cluster_name,
            namespace = %mirror.namespace,
            mirror = %mirror.name,
            "deleted orphaned mirror service"
        );
    }
    Ok(removed)
}
