//! # Refresh Queue
//!
//! Deduplicating work queue keyed by target node.
//!
//! - A key is queued at most once.
//! - A key handed to a worker is in flight until `done`; enqueueing it
//!   meanwhile marks it dirty, and it is queued again once released.
//! - Pending triggers are kept per key and handed over with the key.
//! - A key requeued with a delay is not queued again before that delay has
//!   passed, whatever else enqueues it. Only a manual trigger cuts the wait
//!   short.

use crate::controller::trigger::{TriggerEvent, TriggerSource};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    triggers: HashMap<String, TriggerEvent>,
    /// Earliest instant a delayed key may be queued again
    not_before: HashMap<String, Instant>,
    closed: bool,
}

/// Work item handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: String,
    pub trigger: Option<TriggerEvent>,
}

#[derive(Debug, Default)]
pub struct RefreshQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl RefreshQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already queued or still waiting out a delay
    pub fn enqueue(&self, key: &str) {
        self.push(key, false);
    }

    /// `expedite` drops any delay `key` is waiting out
    fn push(&self, key: &str, expedite: bool) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        if expedite {
            state.not_before.remove(key);
        } else if state
            .not_before
            .get(key)
            .is_some_and(|at| *at > Instant::now())
        {
            return;
        }
        if state.in_flight.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.ready.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Record a trigger for its node and queue the node
    ///
    /// Manual triggers are expedited; others respect a pending delay.
    pub fn enqueue_trigger(&self, event: TriggerEvent) {
        let key = event.target_node_id.clone();
        let manual = event.source == TriggerSource::Manual;
        self.hold_trigger(event);
        self.push(&key, manual);
    }

    /// Record a trigger to hand over with the next run of its node
    pub fn hold_trigger(&self, event: TriggerEvent) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        let key = event.target_node_id.clone();
        let merged = match state.triggers.remove(&key) {
            Some(pending) => pending.merge(event),
            None => event,
        };
        state.triggers.insert(key, merged);
    }

    /// Queue `key` after `delay`; until then plain enqueues of `key` are ignored
    pub fn enqueue_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.not_before.insert(key.to_string(), deadline);
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.enqueue(&key);
        });
    }

    /// Instant before which `key` is not queued again, if it is waiting
    #[must_use]
    pub fn not_before(&self, key: &str) -> Option<Instant> {
        let state = self.state();
        state
            .not_before
            .get(key)
            .copied()
            .filter(|at| *at > Instant::now())
    }

    /// Wait for the next key; `None` once the queue is closed
    pub async fn next(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.not_before.remove(&key);
                    state.in_flight.insert(key.clone());
                    let trigger = state.triggers.remove(&key);
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(WorkItem { key, trigger });
                }
            }
            notified.await;
        }
    }

    /// Release a key taken with `next`
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut state = self.state();
            state.in_flight.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.enqueue(key);
        }
    }

    /// Stop handing out work and wake every waiting worker
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.state().in_flight.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::trigger::TriggerSource;

    #[tokio::test]
    async fn test_duplicate_keys_are_collapsed() {
        let queue = RefreshQueue::new();
        queue.enqueue("n1");
        queue.enqueue("n1");
        queue.enqueue("n2");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await.unwrap().key, "n1");
        assert_eq!(queue.next().await.unwrap().key, "n2");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_key_is_rerun_once_after_done() {
        let queue = RefreshQueue::new();
        queue.enqueue("n1");
        let item = queue.next().await.unwrap();
        assert!(queue.is_in_flight("n1"));

        queue.enqueue("n1");
        queue.enqueue("n1");
        // not handed out again while in flight
        assert!(queue.is_empty());

        queue.done(&item.key);
        assert!(!queue.is_in_flight("n1"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await.unwrap().key, "n1");
    }

    #[tokio::test]
    async fn test_trigger_travels_with_key() {
        let queue = RefreshQueue::new();
        queue.enqueue_trigger(TriggerEvent::new("n1", TriggerSource::Manual));
        queue.enqueue_trigger(TriggerEvent::new("n1", TriggerSource::Schedule));
        let item = queue.next().await.unwrap();
        assert_eq!(item.trigger.map(|t| t.source), Some(TriggerSource::Manual));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_worker() {
        let queue = Arc::new(RefreshQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_key_ignores_plain_enqueues_until_due() {
        let queue = Arc::new(RefreshQueue::new());
        queue.enqueue_after("n1", Duration::from_secs(60));
        assert!(queue.not_before("n1").is_some());

        queue.enqueue("n1");
        queue.enqueue_trigger(TriggerEvent::new("n1", TriggerSource::Schedule));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(59)).await;
        queue.enqueue("n1");
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
        let item = queue.next().await.unwrap();
        // the held schedule trigger still travels with the key
        assert_eq!(item.trigger.map(|t| t.source), Some(TriggerSource::Schedule));
        assert!(queue.not_before("n1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_cuts_delay_short() {
        let queue = Arc::new(RefreshQueue::new());
        queue.enqueue_after("n1", Duration::from_secs(600));

        queue.enqueue_trigger(TriggerEvent::new("n1", TriggerSource::Manual));
        assert_eq!(queue.len(), 1);
        assert!(queue.not_before("n1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_delay() {
        let queue = Arc::new(RefreshQueue::new());
        queue.enqueue_after("n1", Duration::from_secs(10));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.len(), 1);
    }
}
