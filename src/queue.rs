//! Rate-limited, deduplicating work queue keyed by machine id.
//!
//! Semantics:
//! - enqueueing an id that is already pending or in flight collapses into a
//!   single logical entry, so at most one reconcile per id is ever active;
//! - an id re-added while in flight is queued again when `done` is called;
//! - `add_rate_limited` re-queues with per-id exponential backoff;
//! - `forget` resets the backoff after a successful reconcile;
//! - `shut_down` lets workers drain what is queued, then `get` returns `None`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue an id. A no-op if the id is already pending; if it is in
    /// flight it is marked dirty and re-queued once `done` runs.
    pub fn add(&self, id: &str) {
        let mut state = self.inner.state.lock().expect("queue lock");
        if state.shutting_down || !state.dirty.insert(id.to_string()) {
            return;
        }
        if state.processing.contains(id) {
            return;
        }
        state.queue.push_back(id.to_string());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Pop the next id, waiting if the queue is empty. Returns `None` once
    /// the queue has been shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.inner.state.lock().expect("queue lock");
                if let Some(id) = state.queue.pop_front() {
                    state.dirty.remove(&id);
                    state.processing.insert(id.clone());
                    return Some(id);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Mark an id as no longer in flight, re-queueing it if it was re-added
    /// while being processed.
    pub fn done(&self, id: &str) {
        let mut state = self.inner.state.lock().expect("queue lock");
        state.processing.remove(id);
        if state.dirty.contains(id) && !state.queue.iter().any(|q| q == id) {
            state.queue.push_back(id.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-queue after the id's exponential backoff delay.
    pub fn add_rate_limited(&self, id: &str) {
        let delay = {
            let mut state = self.inner.state.lock().expect("queue lock");
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(id.to_string()).or_insert(0);
            *failures = failures.saturating_add(1);
            backoff_delay(*failures)
        };

        let queue = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&id);
        });
    }

    /// Reset the failure counter for an id.
    pub fn forget(&self, id: &str) {
        self.inner.state.lock().expect("queue lock").failures.remove(id);
    }

    pub fn shut_down(&self) {
        self.inner.state.lock().expect("queue lock").shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.inner.state.lock().expect("queue lock").queue.len()
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(30);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("m-1");
        queue.add("m-1");
        queue.add("m-1");
        assert_eq!(queue.pending(), 1);

        assert_eq!(queue.get().await.as_deref(), Some("m-1"));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn add_while_processing_requeues_on_done() {
        let queue = WorkQueue::new();
        queue.add("m-1");
        let id = queue.get().await.unwrap();

        // Re-added while in flight: not queued yet.
        queue.add("m-1");
        assert_eq!(queue.pending(), 0);

        queue.done(&id);
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("m-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off() {
        let queue = WorkQueue::new();
        queue.add_rate_limited("m-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.get().await.as_deref(), Some("m-1"));
        queue.done("m-1");

        // Second failure doubles the delay.
        queue.add_rate_limited("m-1");
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.pending(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_backoff() {
        let queue = WorkQueue::new();
        for _ in 0..8 {
            queue.add_rate_limited("m-1");
        }
        queue.forget("m-1");
        queue.add_rate_limited("m-1");
        // After a forget the next delay is the base delay again.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.pending() >= 1);
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops() {
        let queue = WorkQueue::new();
        queue.add("m-1");
        queue.shut_down();
        assert_eq!(queue.get().await.as_deref(), Some("m-1"));
        assert_eq!(queue.get().await, None);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(3), Duration::from_millis(20));
        assert_eq!(backoff_delay(64), MAX_DELAY);
    }
}
