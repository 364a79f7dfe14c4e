//! # Reconciliation Loop
//!
//! Drives node refreshes: consumes trigger events and a periodic resync over
//! the status store, dedupes work per node through [`RefreshQueue`], and runs
//! the state machine on a bounded pool of workers.
//!
//! Per key a worker loads the request, advances it once, persists the result
//! and either archives it (terminal) or requeues it after the returned delay.
//! Errors never leave the loop: they are logged, counted and the key is
//! requeued after the error requeue interval. A key requeued with a delay is
//! not picked up early by resync or schedule triggers.
//!
//! Each resync also prunes the archive to the configured retention.

use crate::config::ControllerConfig;
use crate::controller::queue::{RefreshQueue, WorkItem};
use crate::controller::request::NodeRefreshRequest;
use crate::controller::state_machine::{Advance, Next, NodeRefreshStateMachine};
use crate::controller::trigger::{TriggerEvent, TriggerSource};
use crate::observability::metrics;
use crate::store::StatusStore;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub struct ReconciliationLoop {
    machine: Arc<NodeRefreshStateMachine>,
    store: Arc<dyn StatusStore>,
    queue: Arc<RefreshQueue>,
    workers: usize,
    resync_interval: Duration,
    error_requeue: Duration,
    history_retention: Duration,
    history_max_entries: usize,
}

impl fmt::Debug for ReconciliationLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationLoop")
            .field("workers", &self.workers)
            .field("resync_interval", &self.resync_interval)
            .field("error_requeue", &self.error_requeue)
            .field("history_retention", &self.history_retention)
            .field("history_max_entries", &self.history_max_entries)
            .finish_non_exhaustive()
    }
}

impl ReconciliationLoop {
    #[must_use]
    pub fn new(
        machine: Arc<NodeRefreshStateMachine>,
        store: Arc<dyn StatusStore>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            machine,
            store,
            queue: Arc::new(RefreshQueue::new()),
            workers: config.max_concurrent_reconciliations.max(1),
            resync_interval: config.resync_interval(),
            error_requeue: config.reconciliation_error_requeue_duration(),
            history_retention: config.history_retention(),
            history_max_entries: config.history_max_entries,
        }
    }

    #[must_use]
    pub fn queue(&self) -> Arc<RefreshQueue> {
        Arc::clone(&self.queue)
    }

    /// Run until `shutdown` flips to `true`
    ///
    /// Workers finish the key they are processing before the loop returns.
    pub async fn run(
        self,
        mut triggers: mpsc::Receiver<TriggerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let this = Arc::new(self);
        info!(workers = this.workers, "starting reconciliation loop");

        let mut workers = JoinSet::new();
        for id in 0..this.workers {
            let worker = Arc::clone(&this);
            workers.spawn(async move { worker.work(id).await });
        }

        let mut resync = tokio::time::interval(this.resync_interval.max(Duration::from_millis(1)));
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut triggers_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = triggers.recv(), if triggers_open => match event {
                    Some(event) => this.accept(event),
                    None => {
                        debug!("trigger channel closed");
                        triggers_open = false;
                    }
                },
                _ = resync.tick() => this.resync().await,
            }
        }

        info!("shutting down reconciliation loop");
        this.queue.close();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "reconciliation worker panicked");
            }
        }
        info!("reconciliation loop stopped");
    }

    fn accept(&self, event: TriggerEvent) {
        metrics::increment_triggers(event.source.as_str());
        debug!(node = %event.target_node_id, source = %event.source, "trigger received");
        self.queue.enqueue_trigger(event);
    }

    /// Re-enqueue every active request and prune the archive
    async fn resync(&self) {
        match self.store.list_active().await {
            Ok(requests) => {
                for request in requests {
                    metrics::increment_triggers(TriggerSource::Resync.as_str());
                    self.queue.enqueue(&request.target_node_id);
                }
            }
            Err(e) => {
                metrics::increment_loop_errors("resync");
                error!(error = %e, "resync failed to list active refreshes");
            }
        }
        self.prune_history().await;
    }

    async fn prune_history(&self) {
        let older_than = chrono::Duration::from_std(self.history_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(older_than) = older_than else {
            return;
        };
        match self
            .store
            .prune_history(older_than, self.history_max_entries)
            .await
        {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, "pruned refresh history"),
            Err(e) => {
                metrics::increment_loop_errors("prune");
                warn!(error = %e, "failed to prune refresh history");
            }
        }
    }

    async fn work(&self, id: usize) {
        while let Some(item) = self.queue.next().await {
            let key = item.key.clone();
            let span = info_span!("node_refresh", node = %key, worker = id);
            self.process(item).instrument(span).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "worker stopped");
    }

    /// One evaluation of one key
    pub(crate) async fn process(&self, item: WorkItem) {
        let WorkItem { key, trigger } = item;

        let loaded = match self.store.load(&key).await {
            Ok(loaded) => loaded,
            Err(e) => return self.fail_stage("load", &key, &e.to_string()),
        };

        let request = match (loaded, trigger) {
            (Some(existing), Some(trigger))
                if existing.is_terminal() && trigger.source == TriggerSource::Manual =>
            {
                info!(node = %key, previous = %existing.phase, "manual trigger resets finished refresh");
                match self.create(&key, &trigger).await {
                    Some(request) => request,
                    None => return,
                }
            }
            (Some(existing), _) if existing.is_terminal() => {
                // terminal but not yet archived (archive failed earlier)
                if let Err(e) = self.store.archive(&existing).await {
                    self.fail_stage("archive", &key, &e.to_string());
                }
                return;
            }
            (Some(existing), _) => existing,
            (None, Some(trigger)) => match self.create(&key, &trigger).await {
                Some(request) => request,
                None => return,
            },
            (None, None) => {
                debug!(node = %key, "no active refresh");
                return;
            }
        };

        metrics::inc_in_flight();
        let Advance { request, next } = self.machine.advance(request).await;
        metrics::dec_in_flight();

        if let Err(e) = self.store.save(&request).await {
            return self.fail_stage("save", &key, &e.to_string());
        }

        match next {
            Next::Terminal => {
                info!(node = %key, phase = %request.phase, "refresh finished");
                if let Err(e) = self.store.archive(&request).await {
                    self.fail_stage("archive", &key, &e.to_string());
                }
            }
            Next::Requeue(delay) => self.queue.enqueue_after(&key, delay),
        }
    }

    async fn create(&self, key: &str, trigger: &TriggerEvent) -> Option<NodeRefreshRequest> {
        let request =
            NodeRefreshRequest::new(key, trigger.requested_at).with_limits(trigger.limits);
        match self.store.save(&request).await {
            Ok(()) => {
                info!(node = %key, source = %trigger.source, "refresh requested");
                Some(request)
            }
            Err(e) => {
                // the trigger is kept so the retry still creates the request
                self.queue.hold_trigger(trigger.clone());
                self.fail_stage("create", key, &e.to_string());
                None
            }
        }
    }

    fn fail_stage(&self, stage: &str, key: &str, message: &str) {
        metrics::increment_loop_errors(stage);
        error!(node = %key, stage = stage, error = %message, "refresh step failed, requeueing");
        self.queue.enqueue_after(key, self.error_requeue);
    }
}
