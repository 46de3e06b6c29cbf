//! Reconciliation Engine
//!
//! One engine mirrors one remote cluster. `start` lists the remote
//! services and endpoints, opens the watch from the listed versions, and
//! spawns a single background task that owns the work queue. That task
//! feeds watch events and repair ticks through the queue one at a time, so
//! the local store never sees two concurrent mutations from one engine.
//!
//! Lifecycle: `Starting -> Running -> Stopping -> Stopped`, or
//! `Starting -> Stopped` when start fails. Only a Running engine reads new
//! remote events.
//!
//! Stopping:
//! - graceful (`stop(false)`): stop reading the watch, finish what is
//!   queued without retrying failures, then release the watch.
//! - forced (`stop(true)`): cancel immediately and abort the task.
//!
//! Either way, once `stop` returns no further store mutation originates
//! from this engine.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::events::{apply_event, is_mirror};
use super::queue::{QueuedItem, RetryDecision, WorkItem, WorkQueue};
use super::repair::{collect_orphans, repair_endpoints};
use super::stats::{EngineStats, StatsSnapshot};
use crate::config::EngineSettings;
use crate::mirror::MirrorTarget;
use crate::remote::RemoteCluster;
use crate::retry::Backoff;
use crate::store::MirrorStore;
use crate::watch::{Operation, RemoteEvent, WatchSource};
use crate::Error;

/// Lifecycle state of an engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Listing the remote cluster and opening the watch
    Starting,
    /// Consuming remote events
    Running,
    /// Stop requested, task winding down
    Stopping,
    /// Task gone; terminal
    Stopped,
}

/// Everything an engine is constructed with
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Name of the Link this engine serves
    pub link_name: String,
    /// Remote cluster identity
    pub target: MirrorTarget,
    /// Process-wide settings
    pub settings: EngineSettings,
}

/// State shared between the engine handle and its task
pub(crate) struct EngineContext {
    pub(crate) link_name: String,
    pub(crate) target: MirrorTarget,
    pub(crate) settings: EngineSettings,
    pub(crate) remote: Arc<dyn RemoteCluster>,
    pub(crate) store: Arc<dyn MirrorStore>,
    pub(crate) stats: Arc<EngineStats>,
}

struct Lifecycle {
    state: EngineState,
    task: Option<JoinHandle<()>>,
}

/// Handle to a reconciliation engine
pub struct Engine {
    ctx: Arc<EngineContext>,
    lifecycle: Mutex<Lifecycle>,
    /// Cancels everything immediately (forced stop)
    shutdown: CancellationToken,
    /// Child of `shutdown`; stops intake and lets the queue drain
    drain: CancellationToken,
    started: AtomicBool,
}

impl Engine {
    /// Create an engine in the `Starting` state; nothing runs until [`Engine::start`]
    pub fn new(
        config: EngineConfig,
        remote: Arc<dyn RemoteCluster>,
        store: Arc<dyn MirrorStore>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let drain = shutdown.child_token();
        let stats = Arc::new(EngineStats::new(config.target.cluster_name.clone()));
        Self {
            ctx: Arc::new(EngineContext {
                link_name: config.link_name,
                target: config.target,
                settings: config.settings,
                remote,
                store,
                stats,
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Starting,
                task: None,
            }),
            shutdown,
            drain,
            started: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.lifecycle.lock().state
    }

    /// Link this engine serves
    pub fn link_name(&self) -> &str {
        &self.ctx.link_name
    }

    /// Remote cluster this engine mirrors
    pub fn target(&self) -> &MirrorTarget {
        &self.ctx.target
    }

    /// Current counter values
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Run the initial sync and spawn the engine task.
    ///
    /// Fails (and moves to `Stopped`) when the remote cluster cannot be
    /// listed or watched, or when a stop arrives before start completes.
    pub async fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal_with_context(
                "engine",
                "start called more than once",
            ));
        }

        info!(
            link = %self.ctx.link_name,
            cluster = %self.ctx.target.cluster_name,
            "starting engine"
        );

        let synced = tokio::select! {
            biased;
            _ = self.drain.cancelled() => Err(Error::internal_with_context(
                "engine",
                "stopped before start completed",
            )),
            result = initial_sync(&self.ctx) => result,
        };

        let mut lifecycle = self.lifecycle.lock();
        match synced {
            Ok((items, source)) if lifecycle.state == EngineState::Starting => {
                let worker = Worker::new(
                    self.ctx.clone(),
                    items,
                    source,
                    self.shutdown.clone(),
                    self.drain.clone(),
                );
                let span = info_span!(
                    "engine",
                    link = %self.ctx.link_name,
                    cluster = %self.ctx.target.cluster_name
                );
                lifecycle.task = Some(tokio::spawn(worker.run().instrument(span)));
                lifecycle.state = EngineState::Running;
                info!(cluster = %self.ctx.target.cluster_name, "engine running");
                Ok(())
            }
            Ok(_) => {
                lifecycle.state = EngineState::Stopped;
                Err(Error::internal_with_context(
                    "engine",
                    "stopped before start completed",
                ))
            }
            Err(e) => {
                lifecycle.state = EngineState::Stopped;
                Err(e)
            }
        }
    }

    /// Stop the engine and wait for its task to finish.
    ///
    /// Only the first call has an effect; a concurrent or later call
    /// returns immediately.
    pub async fn stop(&self, force: bool) {
        let task = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                EngineState::Starting | EngineState::Running => {
                    lifecycle.state = EngineState::Stopping;
                }
                EngineState::Stopping | EngineState::Stopped => {
                    debug!(cluster = %self.ctx.target.cluster_name, "stop already in effect");
                    return;
                }
            }
            lifecycle.task.take()
        };

        info!(
            cluster = %self.ctx.target.cluster_name,
            force,
            "stopping engine"
        );

        if force {
            self.shutdown.cancel();
            if let Some(task) = &task {
                task.abort();
            }
        } else {
            self.drain.cancel();
        }

        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(cluster = %self.ctx.target.cluster_name, error = %e, "engine task panicked");
                }
            }
        }

        self.lifecycle.lock().state = EngineState::Stopped;
        info!(cluster = %self.ctx.target.cluster_name, "engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// List services then endpoints, queue them in that order followed by an
/// orphan collection, and open the watch from the listed versions
async fn initial_sync(ctx: &EngineContext) -> Result<(Vec<WorkItem>, WatchSource), Error> {
    let services = ctx.remote.list_services().await?;
    let endpoints = ctx.remote.list_endpoints().await?;

    let live: BTreeSet<(String, String)> = services
        .items
        .iter()
        .filter(|s| !is_mirror(*s))
        .filter_map(|s| Some((s.metadata.namespace.clone()?, s.metadata.name.clone()?)))
        .collect();

    debug!(
        cluster = %ctx.target.cluster_name,
        services = services.items.len(),
        endpoints = endpoints.items.len(),
        "listed remote cluster"
    );

    let source = WatchSource::open(
        ctx.remote.as_ref(),
        &services.resource_version,
        &endpoints.resource_version,
    )
    .await?;

    let mut items = Vec::with_capacity(services.items.len() + endpoints.items.len() + 1);
    items.extend(
        services
            .items
            .into_iter()
            .map(|s| WorkItem::Event(RemoteEvent::Service(Operation::Added, s))),
    );
    items.extend(
        endpoints
            .items
            .into_iter()
            .map(|e| WorkItem::Event(RemoteEvent::Endpoints(Operation::Added, e))),
    );
    items.push(WorkItem::GcOrphans(live));

    Ok((items, source))
}

async fn dispatch(ctx: &EngineContext, item: &WorkItem) -> Result<(), Error> {
    match item {
        WorkItem::Event(event) => apply_event(ctx, event).await,
        WorkItem::GcOrphans(live) => collect_orphans(ctx, live).await.map(|_| ()),
        WorkItem::RepairEndpoints => repair_endpoints(ctx).await.map(|_| ()),
    }
}

enum Step {
    Stop,
    Repair,
    Event(Result<RemoteEvent, Error>),
}

/// The engine task
struct Worker {
    ctx: Arc<EngineContext>,
    queue: WorkQueue,
    source: Option<WatchSource>,
    shutdown: CancellationToken,
    drain: CancellationToken,
    reconnect: Backoff,
}

impl Worker {
    fn new(
        ctx: Arc<EngineContext>,
        items: Vec<WorkItem>,
        source: WatchSource,
        shutdown: CancellationToken,
        drain: CancellationToken,
    ) -> Self {
        let mut queue = WorkQueue::default();
        queue.extend(items);
        let reconnect = Backoff::new(&ctx.settings.reconnect_backoff);
        Self {
            ctx,
            queue,
            source: Some(source),
            shutdown,
            drain,
            reconnect,
        }
    }

    async fn run(mut self) {
        let period = self.ctx.settings.repair_period;
        let mut repair = interval_at(Instant::now() + period, period);
        repair.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(entry) = self.queue.pop() {
                self.process(entry).await;
                continue;
            }
            if self.drain.is_cancelled() {
                break;
            }

            let Some(source) = self.source.as_mut() else {
                self.reconnect().await;
                continue;
            };

            let step = tokio::select! {
                biased;
                _ = self.drain.cancelled() => Step::Stop,
                _ = repair.tick() => Step::Repair,
                event = source.next() => Step::Event(event),
            };

            match step {
                Step::Stop => continue,
                Step::Repair => {
                    if self.queue.push_repair() {
                        debug!("queued endpoint repair pass");
                    }
                }
                Step::Event(Ok(event)) => self.queue.push(WorkItem::Event(event)),
                Step::Event(Err(e)) => {
                    warn!(error = %e, "remote watch closed, re-establishing");
                    self.source = None;
                }
            }
        }

        // Dropping the source releases the remote watch connections
        self.source = None;
        debug!(pending = self.queue.len(), "engine task exited");
    }

    /// Apply one item, retrying transient failures up to the requeue limit.
    ///
    /// The failing item stays at the head of the queue while it is retried,
    /// so later events for the same object cannot overtake it.
    async fn process(&mut self, mut entry: QueuedItem) {
        let mut backoff = Backoff::new(&self.ctx.settings.requeue_backoff);

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                result = dispatch(&self.ctx, &entry.item) => result,
            };

            let err = match result {
                Ok(()) => {
                    if entry.item.is_event() {
                        self.ctx.stats.record_processed();
                    }
                    return;
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                self.abandon(&entry, &err, "permanent error");
                return;
            }
            if self.drain.is_cancelled() {
                self.abandon(&entry, &err, "engine stopping");
                return;
            }
            if entry.retry.record_failure(self.ctx.settings.requeue_limit)
                == RetryDecision::Abandon
            {
                self.abandon(&entry, &err, "requeue limit exceeded");
                return;
            }

            if entry.item.is_event() {
                self.ctx.stats.record_requeued();
            }
            let delay = backoff.next_delay();
            warn!(
                item = %entry.item.describe(),
                attempt = entry.retry.failures,
                error = %err,
                delay_ms = delay.as_millis(),
                "failed to apply, requeueing"
            );

            tokio::select! {
                biased;
                _ = self.drain.cancelled() => {
                    self.abandon(&entry, &err, "engine stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Local state is left as last applied; the next repair pass or relist
    /// re-derives it
    fn abandon(&self, entry: &QueuedItem, err: &Error, reason: &str) {
        if entry.item.is_event() {
            self.ctx.stats.record_abandoned();
        }
        error!(
            item = %entry.item.describe(),
            failures = entry.retry.failures,
            error = %err,
            reason,
            "abandoning work item"
        );
    }

    /// Relist and re-open the watch after a backoff delay
    async fn reconnect(&mut self) {
        let delay = self.reconnect.next_delay();
        let ctx = self.ctx.clone();

        let synced = tokio::select! {
            biased;
            _ = self.drain.cancelled() => return,
            result = async {
                tokio::time::sleep(delay).await;
                initial_sync(&ctx).await
            } => result,
        };

        match synced {
            Ok((items, source)) => {
                info!(queued = items.len(), "re-established remote watch");
                self.queue.extend(items);
                self.source = Some(source);
                self.reconnect.reset();
                self.ctx.stats.record_watch_restart();
            }
            Err(e) => {
                warn!(error = %e, delay_ms = delay.as_millis(), "failed to re-establish remote watch");
            }
        }
    }
}
