//! Deduplicated, rate-limited work queue of job keys
//!
//! Semantics follow the Kubernetes controller work queue: a key is held at
//! most once while queued; a key re-added during processing is marked dirty
//! and re-queued when its current tick finishes, so no two workers ever
//! process the same key concurrently. Failed keys come back through an
//! exponential per-key backoff that `forget` resets on success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use trainops_common::metrics;

/// First retry delay
const BACKOFF_BASE: Duration = Duration::from_millis(5);
/// Retry delay ceiling
const BACKOFF_MAX: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

/// Rate-limited, deduplicating queue of job keys
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    shutting_down: AtomicBool,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Enqueue a key.
    ///
    /// Deduplicated while queued; a key currently being processed is marked
    /// dirty and comes back once its tick completes. Ignored after
    /// shutdown.
    pub fn add(&self, key: &str) {
        if self.shutting_down.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.queue.push_back(key.to_string());
            metrics::set_queue_depth(state.queue.len() as i64);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key after a delay
    pub fn add_after(self: Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(&key);
        });
    }

    /// Enqueue a key through its per-key exponential backoff, counting the
    /// failure that brought it back.
    pub fn add_rate_limited(self: Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.state.lock().unwrap();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures
        };
        self.add_after(key, backoff_delay(failures));
    }

    /// Reset a key's failure history after a successful tick
    pub fn forget(&self, key: &str) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// How many rate-limited requeues the key has accumulated
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Pop the next key, waiting if the queue is empty.
    ///
    /// Marks the key as processing; the caller must pair this with
    /// [`WorkQueue::done`]. Returns None once the queue is shut down and
    /// drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::set_queue_depth(state.queue.len() as i64);
                    if !state.queue.is_empty() {
                        // Chain the wakeup so sibling workers keep draining
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if self.shutting_down.load(Ordering::Relaxed) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key's tick finished, re-queueing it if it was dirtied
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if state.dirty.remove(key)
            && !self.shutting_down.load(Ordering::Relaxed)
            && state.queued.insert(key.to_string())
        {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake all waiting workers to drain
    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Keys currently waiting (excludes in-flight keys)
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exponential per-key delay: 5ms, 10ms, 20ms, ... capped at 1000s
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(63);
    BACKOFF_BASE
        .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
        .map(|d| d.min(BACKOFF_MAX))
        .unwrap_or(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_next_roundtrip() {
        let queue = WorkQueue::new();
        queue.add("default/a");
        assert_eq!(queue.next().await.as_deref(), Some("default/a"));
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("default/a");
        queue.add("default/a");
        queue.add("default/b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await.as_deref(), Some("default/a"));
        assert_eq!(queue.next().await.as_deref(), Some("default/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_added_mid_processing_comes_back_after_done() {
        let queue = WorkQueue::new();
        queue.add("default/a");
        let key = queue.next().await.unwrap();

        // Event arrives while the worker holds the key
        queue.add("default/a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await.as_deref(), Some("default/a"));
    }

    #[tokio::test]
    async fn rate_limited_requeues_are_counted_and_forgotten() {
        let queue = Arc::new(WorkQueue::new());
        assert_eq!(queue.num_requeues("default/a"), 0);

        queue.clone().add_rate_limited("default/a");
        queue.clone().add_rate_limited("default/a");
        assert_eq!(queue.num_requeues("default/a"), 2);

        queue.forget("default/a");
        assert_eq!(queue.num_requeues("default/a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_key_arrives_after_backoff() {
        let queue = Arc::new(WorkQueue::new());
        queue.clone().add_rate_limited("default/a");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.next().await.as_deref(), Some("default/a"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes() {
        let queue = WorkQueue::new();
        queue.add("default/a");
        queue.shut_down();
        queue.add("default/b");
        assert_eq!(queue.next().await.as_deref(), Some("default/a"));
        assert_eq!(queue.next().await, None);
    }

    #[test]
    fn backoff_grows_exponentially_with_a_cap() {
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(3), Duration::from_millis(20));
        assert_eq!(backoff_delay(60), BACKOFF_MAX);
    }
}
