use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::*;

use crate::runtime::backoff::ExponentialBackoff;
use crate::runtime::identity::ResourceIdentity;

/// Longest delay [`WorkQueue::add_after`] waits; longer delays are clamped
pub const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A pending reconciliation. The generation orders entries by insertion.
#[derive(Clone, Debug, PartialEq, Eq)]
struct QueueEntry {
    identity: ResourceIdentity,
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    /// Entries ready to be handed out, in insertion order
    ready: VecDeque<QueueEntry>,
    /// Identities currently present in `ready`
    pending: HashSet<ResourceIdentity>,
    /// Identities handed to a worker and not yet marked done
    processing: HashSet<ResourceIdentity>,
    /// Identities added while processing; re-added exactly once on done
    dirty: HashSet<ResourceIdentity>,
    /// Earliest outstanding delayed add per identity
    delayed: HashMap<ResourceIdentity, Instant>,
    /// Consecutive rate-limited requeues per identity
    failures: HashMap<ResourceIdentity, u32>,
    generation: u64,
    shutting_down: bool,
}

impl QueueState {
    /// Returns true if a new ready entry was created
    fn add(&mut self, identity: ResourceIdentity) -> bool {
        if self.shutting_down {
            trace!("Ignoring add of {identity} during shutdown");
            return false;
        }
        if self.processing.contains(&identity) {
            self.dirty.insert(identity);
            return false;
        }
        if !self.pending.insert(identity.clone()) {
            return false;
        }
        self.generation += 1;
        self.ready.push_back(QueueEntry {
            identity,
            generation: self.generation,
        });
        true
    }
}

/// A deduplicating queue of identities awaiting reconciliation.
///
/// An identity is either absent, pending (waiting in the ready list), or
/// processing (held by exactly one worker). Adding a pending identity is a
/// no-op; adding a processing identity marks it dirty so that it is queued
/// again, once, when the worker calls [`WorkQueue::done`].
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl WorkQueue {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    // A panicking holder cannot leave the sets half-updated in a way that
    // breaks the invariants above, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, identity: ResourceIdentity) {
        let added = self.lock().add(identity);
        if added {
            self.notify.notify_one();
        }
    }

    /// Schedule an add after `delay`.
    ///
    /// Only the soonest outstanding delayed add per identity is kept. An
    /// immediate [`WorkQueue::add`] does not cancel it.
    pub fn add_after(self: &Arc<Self>, identity: ResourceIdentity, delay: Duration) {
        if delay.is_zero() {
            return self.add(identity);
        }
        if delay > MAX_DELAY {
            debug!("Clamping requeue of {identity} after {delay:?} to {MAX_DELAY:?}");
        }
        let deadline = Instant::now() + delay.min(MAX_DELAY);
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if state
                .delayed
                .get(&identity)
                .is_some_and(|existing| *existing <= deadline)
            {
                return;
            }
            state.delayed.insert(identity.clone(), deadline);
        }

        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(queue) = queue.upgrade() else {
                return;
            };
            let added = {
                let mut state = queue.lock();
                // superseded by a sooner delayed add
                if state.delayed.get(&identity) != Some(&deadline) {
                    return;
                }
                state.delayed.remove(&identity);
                state.add(identity)
            };
            if added {
                queue.notify.notify_one();
            }
        });
    }

    /// Add after the identity's current backoff delay and record the failure.
    /// Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, identity: ResourceIdentity) -> Duration {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(identity.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(identity, delay);
        delay
    }

    /// Reset the backoff of an identity, after it converged
    pub fn forget(&self, identity: &ResourceIdentity) {
        self.lock().failures.remove(identity);
    }

    pub fn num_requeues(&self, identity: &ResourceIdentity) -> u32 {
        self.lock().failures.get(identity).copied().unwrap_or(0)
    }

    /// Wait for the next identity to process. Returns `None` once the queue
    /// is shutting down.
    pub async fn get(&self) -> Option<ResourceIdentity> {
        loop {
            // enabled before inspecting the state so neither an add nor a
            // shutdown between the check and the await can be missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(entry) = state.ready.pop_front() {
                    state.pending.remove(&entry.identity);
                    state.processing.insert(entry.identity.clone());
                    trace!(
                        generation = entry.generation,
                        "Dequeued {}",
                        entry.identity
                    );
                    return Some(entry.identity);
                }
            }
            notified.await;
        }
    }

    /// Mark the identity as processed; it is queued again if it was added in
    /// the meantime.
    pub fn done(&self, identity: &ResourceIdentity) {
        let added = {
            let mut state = self.lock();
            state.processing.remove(identity);
            if state.dirty.remove(identity) {
                state.add(identity.clone())
            } else {
                false
            }
        };
        if added {
            self.notify.notify_one();
        }
    }

    /// Stop handing out work. Blocked and future [`WorkQueue::get`] calls
    /// return `None` and adds are ignored.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of identities ready to be handed out
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the identity is pending, processing or dirty
    pub fn is_tracked(&self, identity: &ResourceIdentity) -> bool {
        let state = self.lock();
        state.pending.contains(identity)
            || state.processing.contains(identity)
            || state.dirty.contains(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ResourceIdentity {
        ResourceIdentity::new(name).within("default")
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::default();
        queue.add(id("a"));
        queue.add(id("a"));
        queue.add(id("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(id("a")));
        assert_eq!(queue.get().await, Some(id("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_requeues_once_on_done() {
        let queue = WorkQueue::default();
        queue.add(id("a"));
        let a = queue.get().await.unwrap();

        queue.add(id("a"));
        queue.add(id("a"));
        // in flight identities are never handed to a second worker
        assert!(queue.is_empty());

        queue.done(&a);
        assert_eq!(queue.len(), 1);
        let again = queue.get().await.unwrap();
        queue.done(&again);
        assert!(queue.is_empty());
        assert!(!queue.is_tracked(&a));
    }

    #[tokio::test]
    async fn concurrent_adds_collapse_to_one_pending() {
        let queue = Arc::new(WorkQueue::default());
        queue.add(id("a"));
        let a = queue.get().await.unwrap();

        let adds: Vec<_> = (0..32)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.add(id("a")) })
            })
            .collect();
        for add in adds {
            add.await.unwrap();
        }
        assert!(queue.is_empty());
        queue.done(&a);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_workers() {
        let queue = Arc::new(WorkQueue::default());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(worker.await.unwrap(), None);

        queue.add(id("a"));
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let queue = Arc::new(WorkQueue::default());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(id("a"));
        assert_eq!(worker.await.unwrap(), Some(id("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_fires_after_delay() {
        let queue = Arc::new(WorkQueue::default());
        queue.add_after(id("a"), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sooner_delayed_add_wins() {
        let queue = Arc::new(WorkQueue::default());
        queue.add_after(id("a"), Duration::from_secs(60));
        queue.add_after(id("a"), Duration::from_secs(5));
        queue.add_after(id("a"), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.get().await, Some(id("a")));
        queue.done(&id("a"));

        // the superseded 60s timer does not fire again
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_add_not_suppressed_by_delayed_add() {
        let queue = Arc::new(WorkQueue::default());
        queue.add_after(id("a"), Duration::from_secs(60));
        queue.add(id("a"));
        assert_eq!(queue.get().await, Some(id("a")));
        queue.done(&id("a"));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_delays_are_clamped() {
        let queue = Arc::new(WorkQueue::default());
        queue.add_after(id("a"), Duration::MAX);
        assert!(!queue.is_tracked(&id("a")));

        queue.add_after(id("b"), Duration::MAX);
        tokio::time::sleep(MAX_DELAY - Duration::from_secs(1)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn every_add_wakes_a_waiting_worker() {
        let queue = Arc::new(WorkQueue::default());
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.add(id("a"));
        queue.add(id("b"));

        let mut got = Vec::new();
        for worker in workers {
            let identity = tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .expect("worker stayed asleep")
                .unwrap();
            got.push(identity.unwrap());
        }
        got.sort();
        assert_eq!(got, [id("a"), id("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_backoff_grows_and_resets() {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
        )));
        let delays: Vec<_> = (0..4).map(|_| queue.add_rate_limited(id("a"))).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 4].map(Duration::from_secs).to_vec()
        );
        assert_eq!(queue.num_requeues(&id("a")), 4);

        queue.forget(&id("a"));
        assert_eq!(queue.num_requeues(&id("a")), 0);
        assert_eq!(queue.add_rate_limited(id("a")), Duration::from_secs(1));
    }
}
