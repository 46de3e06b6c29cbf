//! Serial reconciliation queue
//!
//! Watch events and repair ticks both land here, so the engine applies at
//! most one mutation at a time and never races a repair pass against an
//! in-flight event on the same object. Items leave the queue in arrival
//! order; nothing is reordered or merged, except that a repair pass is not
//! queued twice.

use std::collections::{BTreeSet, VecDeque};

use crate::watch::RemoteEvent;

/// Unit of work for the engine
#[derive(Clone, Debug)]
pub(crate) enum WorkItem {
    /// A remote event (from a watch or a relist)
    Event(RemoteEvent),
    /// Delete local mirrors whose `(namespace, remote name)` is not listed
    GcOrphans(BTreeSet<(String, String)>),
    /// Recompute every mirror endpoint set from the remote cluster
    RepairEndpoints,
}

impl WorkItem {
    pub(crate) fn is_event(&self) -> bool {
        matches!(self, WorkItem::Event(_))
    }

    /// Short description for logs
    pub(crate) fn describe(&self) -> String {
        match self {
            WorkItem::Event(event) => format!(
                "{} {} {}",
                event.operation(),
                event.kind(),
                event.object_key()
            ),
            WorkItem::GcOrphans(live) => format!("orphan collection ({} live)", live.len()),
            WorkItem::RepairEndpoints => "endpoint repair".to_string(),
        }
    }
}

/// Outcome of recording a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Try the item again
    Requeue,
    /// Give up on the item
    Abandon,
}

/// Failure count of one queued item; dropped with the item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RetryRecord {
    pub(crate) failures: u32,
}

impl RetryRecord {
    /// Count a failure. An item is retried `limit` times, then abandoned.
    pub(crate) fn record_failure(&mut self, limit: u32) -> RetryDecision {
        self.failures += 1;
        if self.failures > limit {
            RetryDecision::Abandon
        } else {
            RetryDecision::Requeue
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueuedItem {
    pub(crate) item: WorkItem,
    pub(crate) retry: RetryRecord,
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    items: VecDeque<QueuedItem>,
}

impl WorkQueue {
    pub(crate) fn push(&mut self, item: WorkItem) {
        self.items.push_back(QueuedItem {
            item,
            retry: RetryRecord::default(),
        });
    }

    pub(crate) fn extend(&mut self, items: impl IntoIterator<Item = WorkItem>) {
        for item in items {
            self.push(item);
        }
    }

    /// Queue a repair pass unless one is already waiting
    pub(crate) fn push_repair(&mut self) -> bool {
        if self
            .items
            .iter()
            .any(|q| matches!(q.item, WorkItem::RepairEndpoints))
        {
            return false;
        }
        self.push(WorkItem::RepairEndpoints);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<QueuedItem> {
        self.items.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
