//! Remote Watch Source
//!
//! Merges the remote services and endpoints watches into one stream of
//! typed [`RemoteEvent`]s. The source never retries: any stream error, API
//! error event, or end of stream is reported to the caller as
//! [`Error::WatchClosed`], and the caller decides whether to relist and
//! re-establish. Dropping the source releases both connections.

use std::fmt;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::WatchEvent;
use kube::ResourceExt;

use crate::remote::{RemoteCluster, WatchStream};
use crate::Error;

/// Operation carried by a remote event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Object created (or seen during a list)
    Added,
    /// Object updated
    Modified,
    /// Object removed
    Deleted,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Added => write!(f, "Added"),
            Operation::Modified => write!(f, "Modified"),
            Operation::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A typed remote event
#[derive(Clone, Debug)]
pub enum RemoteEvent {
    /// Remote Service changed
    Service(Operation, Service),
    /// Remote Endpoints changed
    Endpoints(Operation, Endpoints),
}

impl RemoteEvent {
    /// Resource kind of the snapshot
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteEvent::Service(..) => "Service",
            RemoteEvent::Endpoints(..) => "Endpoints",
        }
    }

    /// Operation tag
    pub fn operation(&self) -> Operation {
        match self {
            RemoteEvent::Service(op, _) | RemoteEvent::Endpoints(op, _) => *op,
        }
    }

    /// `namespace/name` of the remote object, for logging
    pub fn object_key(&self) -> String {
        let (ns, name) = match self {
            RemoteEvent::Service(_, s) => (s.namespace(), s.name_any()),
            RemoteEvent::Endpoints(_, e) => (e.namespace(), e.name_any()),
        };
        format!("{}/{}", ns.unwrap_or_default(), name)
    }
}

/// Open merged watch over remote services and endpoints
pub struct WatchSource {
    events: BoxStream<'static, Result<RemoteEvent, Error>>,
}

impl WatchSource {
    /// Open both watches from the given resource versions
    pub async fn open(
        remote: &dyn RemoteCluster,
        services_version: &str,
        endpoints_version: &str,
    ) -> Result<Self, Error> {
        let services = remote.watch_services(services_version).await?;
        let endpoints = remote.watch_endpoints(endpoints_version).await?;

        let services = typed(services, "services", RemoteEvent::Service);
        let endpoints = typed(endpoints, "endpoints", RemoteEvent::Endpoints);

        Ok(Self {
            events: stream::select(services, endpoints).boxed(),
        })
    }

    /// Wait for the next event. `Err` means the watch is closed and the
    /// source must be dropped.
    pub async fn next(&mut self) -> Result<RemoteEvent, Error> {
        match self.events.next().await {
            Some(event) => event,
            None => Err(Error::watch_closed("remote", "all streams ended")),
        }
    }
}

/// Map a raw watch stream to typed events, ending it with a closure error.
/// Bookmarks carry no object and are skipped.
fn typed<K>(
    raw: WatchStream<K>,
    resource: &'static str,
    wrap: fn(Operation, K) -> RemoteEvent,
) -> BoxStream<'static, Result<RemoteEvent, Error>>
where
    K: Send + 'static,
{
    raw.filter_map(move |item| async move {
        match item {
            Ok(WatchEvent::Added(obj)) => Some(Ok(wrap(Operation::Added, obj))),
            Ok(WatchEvent::Modified(obj)) => Some(Ok(wrap(Operation::Modified, obj))),
            Ok(WatchEvent::Deleted(obj)) => Some(Ok(wrap(Operation::Deleted, obj))),
            Ok(WatchEvent::Bookmark(_)) => None,
            Ok(WatchEvent::Error(e)) => Some(Err(Error::watch_closed(
                resource,
                format!("{} ({})", e.message, e.code),
            ))),
            Err(e) => Some(Err(Error::watch_closed(resource, e.to_string()))),
        }
    })
    .chain(stream::once(async move {
        Err(Error::watch_closed(resource, "stream ended"))
    }))
    .boxed()
}
