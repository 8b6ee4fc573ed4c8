//! A deduplicating, rate-limited queue of `namespace/name` keys awaiting reconciliation.
//!
//! A key is handed to at most one worker at a time: a key that is added again while it
//! is being processed is parked and only delivered again once [`WorkQueue::done`] was
//! called for it.

use fnv::{FnvHashMap, FnvHashSet};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, either queued or parked behind an in-flight key
    dirty: FnvHashSet<String>,
    processing: FnvHashSet<String>,
    failures: FnvHashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Clone, Default)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueues `key` without any delay
    pub fn add_immediate(&self, key: &str) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueues `key` after its current backoff delay, which grows with every call until the
    /// key is [forgotten](Self::forget)
    pub fn add(&self, key: &str) {
        let delay = self.next_delay(key);
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add_immediate(&key);
        });
    }

    fn next_delay(&self, key: &str) -> Duration {
        let mut state = self.lock();
        let failures = state.failures.entry(key.to_string()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);
        backoff(exponent)
    }

    /// Number of times `key` was added with backoff since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key, returns `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as processed, re-queueing it if it was added in the meantime
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        if state.processing.remove(key) && state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears the backoff history of `key`
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }
}

fn backoff(failures: u32) -> Duration {
    2u32.checked_pow(failures)
        .and_then(|factor| BASE_DELAY.checked_mul(factor))
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ns1/wordcount";

    #[test]
    fn test_backoff() {
        assert_eq!(backoff(0), Duration::from_millis(5));
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(4), Duration::from_millis(80));
        assert_eq!(backoff(30), MAX_DELAY);
        assert_eq!(backoff(64), MAX_DELAY);
    }

    #[tokio::test]
    async fn test_deduplicates_pending_keys() {
        let queue = WorkQueue::new();
        queue.add_immediate(KEY);
        queue.add_immediate(KEY);
        queue.add_immediate("ns1/other");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some(KEY));
        assert_eq!(queue.get().await.as_deref(), Some("ns1/other"));
    }

    #[tokio::test]
    async fn test_in_flight_key_is_redelivered_after_done() {
        let queue = WorkQueue::new();
        queue.add_immediate(KEY);
        let key = queue.get().await.unwrap();

        queue.add_immediate(KEY);
        // Parked until the in-flight reconciliation finishes
        assert_eq!(queue.len(), 0);

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = WorkQueue::new();
        queue.add_immediate(KEY);
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_done_for_idle_key_does_not_duplicate() {
        let queue = WorkQueue::new();
        queue.add_immediate(KEY);
        queue.done(KEY);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_add_with_backoff_and_forget() {
        let queue = WorkQueue::new();
        queue.add(KEY);
        queue.add(KEY);
        assert_eq!(queue.num_requeues(KEY), 2);

        assert_eq!(queue.get().await.as_deref(), Some(KEY));

        queue.forget(KEY);
        assert_eq!(queue.num_requeues(KEY), 0);
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiting_workers() {
        let queue = WorkQueue::new();
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(worker.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shut_down_drains_queued_keys_first() {
        let queue = WorkQueue::new();
        queue.add_immediate(KEY);
        queue.shut_down();
        queue.add_immediate("ns1/late");

        assert_eq!(queue.get().await.as_deref(), Some(KEY));
        assert_eq!(queue.get().await, None);
    }
}
