//! Pending-operation tracker.
//!
//! Reference-counts in-flight long operations (sync runs, recurrence
//! expansion) and collapses them into one boolean "busy" signal. Observers
//! hear about the 0→1 and 1→0 edges only, exactly once per edge.
//!
//! ```
//! use calbridge_core::PendingTracker;
//!
//! let tracker = PendingTracker::new();
//! {
//!     let _sync = tracker.guard();
//!     assert!(tracker.is_pending());
//! }
//! assert!(!tracker.is_pending());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error};

/// Edge reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTransition {
    BecamePending,
    BecameIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PendingError {
    /// A decrement without a matching increment.
    #[error("pending counter decremented while idle")]
    Underflow,
}

/// Handle returned by [`PendingTracker::on_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(PendingTransition) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    list: Vec<(ObserverId, Observer)>,
}

struct Inner {
    /// Authoritative count; edges are computed while holding it.
    count: Mutex<usize>,
    /// Lock-free mirror for readers.
    snapshot: AtomicUsize,
    /// Held across observer delivery so edges are observed in order.
    delivery: Mutex<()>,
    observers: Mutex<Observers>,
    busy: watch::Sender<bool>,
}

/// Shared, cloneable counter of in-flight operations.
///
/// Observers run on the thread that caused the edge and must not call
/// [`increment`](Self::increment) or [`decrement`](Self::decrement)
/// themselves. Reading [`is_pending`](Self::is_pending) is fine.
#[derive(Clone)]
pub struct PendingTracker {
    inner: Arc<Inner>,
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PendingTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTracker")
            .field("count", &self.count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PendingTracker {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                count: Mutex::new(0),
                snapshot: AtomicUsize::new(0),
                delivery: Mutex::new(()),
                observers: Mutex::new(Observers::default()),
                busy,
            }),
        }
    }

    /// Registers one more in-flight operation.
    pub fn increment(&self) {
        let mut count = lock(&self.inner.count);
        *count += 1;
        self.inner.snapshot.store(*count, Ordering::SeqCst);
        if *count == 1 {
            let _order = lock(&self.inner.delivery);
            drop(count);
            self.publish(PendingTransition::BecamePending);
        }
    }

    /// Marks one operation as finished.
    ///
    /// # Errors
    ///
    /// [`PendingError::Underflow`] when nothing is pending. The counter is
    /// left at zero.
    pub fn decrement(&self) -> Result<(), PendingError> {
        let mut count = lock(&self.inner.count);
        if *count == 0 {
            error!("pending counter decremented while idle");
            return Err(PendingError::Underflow);
        }
        *count -= 1;
        self.inner.snapshot.store(*count, Ordering::SeqCst);
        if *count == 0 {
            let _order = lock(&self.inner.delivery);
            drop(count);
            self.publish(PendingTransition::BecameIdle);
        }
        Ok(())
    }

    /// Increments now and decrements exactly once when the guard drops.
    pub fn guard(&self) -> PendingGuard {
        self.increment();
        PendingGuard {
            tracker: Some(self.clone()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.count() > 0
    }

    pub fn count(&self) -> usize {
        self.inner.snapshot.load(Ordering::SeqCst)
    }

    /// Calls `observer` on every edge until removed.
    pub fn on_transition<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(PendingTransition) + Send + Sync + 'static,
    {
        let mut observers = lock(&self.inner.observers);
        let id = ObserverId(observers.next_id);
        observers.next_id += 1;
        observers.list.push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.inner.observers);
        let before = observers.list.len();
        observers.list.retain(|(existing, _)| *existing != id);
        observers.list.len() != before
    }

    /// Busy flag as a watch channel, for async consumers.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.busy.subscribe()
    }

    /// Resolves once nothing is pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    fn publish(&self, transition: PendingTransition) {
        debug!(?transition, "pending state changed");
        self.inner
            .busy
            .send_replace(transition == PendingTransition::BecamePending);

        let observers: Vec<Observer> = lock(&self.inner.observers)
            .list
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(transition);
        }
    }
}

/// Keeps one operation pending for its lifetime.
#[must_use = "dropping the guard immediately ends the pending operation"]
pub struct PendingGuard {
    tracker: Option<PendingTracker>,
}

impl PendingGuard {
    /// Ends the operation now instead of on drop.
    pub fn release(mut self) -> Result<(), PendingError> {
        match self.tracker.take() {
            Some(tracker) => tracker.decrement(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PendingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingGuard")
            .field("armed", &self.tracker.is_some())
            .finish()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            let _ = tracker.decrement();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn recording(tracker: &PendingTracker) -> Arc<Mutex<Vec<PendingTransition>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tracker.on_transition(move |t| sink.lock().unwrap().push(t));
        seen
    }

    #[test]
    fn balanced_sequence_ends_idle_with_one_edge_each() {
        let tracker = PendingTracker::new();
        let seen = recording(&tracker);

        tracker.increment();
        tracker.increment();
        tracker.increment();
        tracker.decrement().unwrap();
        tracker.increment();
        tracker.decrement().unwrap();
        tracker.decrement().unwrap();
        tracker.decrement().unwrap();

        assert!(!tracker.is_pending());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PendingTransition::BecamePending,
                PendingTransition::BecameIdle
            ]
        );
    }

    #[test]
    fn each_cycle_fires_its_own_edges() {
        let tracker = PendingTracker::new();
        let seen = recording(&tracker);

        for _ in 0..2 {
            tracker.increment();
            tracker.decrement().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn decrement_while_idle_underflows() {
        let tracker = PendingTracker::new();
        assert_eq!(tracker.decrement(), Err(PendingError::Underflow));
        assert_eq!(tracker.count(), 0);

        tracker.increment();
        tracker.decrement().unwrap();
        assert_eq!(tracker.decrement(), Err(PendingError::Underflow));
    }

    #[test]
    fn concurrent_pairs_inside_an_outer_operation() {
        let tracker = PendingTracker::new();
        let seen = recording(&tracker);

        tracker.increment();
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        tracker.increment();
                        tracker.decrement().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        tracker.decrement().unwrap();

        assert!(!tracker.is_pending());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                PendingTransition::BecamePending,
                PendingTransition::BecameIdle
            ]
        );
    }

    #[test]
    fn free_running_threads_see_alternating_edges() {
        let tracker = PendingTracker::new();
        let seen = recording(&tracker);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        tracker.increment();
                        tracker.decrement().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert!(!tracker.is_pending());
        assert!(!seen.is_empty());
        assert_eq!(seen.len() % 2, 0);
        for (index, transition) in seen.iter().enumerate() {
            let expected = if index % 2 == 0 {
                PendingTransition::BecamePending
            } else {
                PendingTransition::BecameIdle
            };
            assert_eq!(*transition, expected);
        }
    }

    #[test]
    fn guard_decrements_once_on_drop() {
        let tracker = PendingTracker::new();
        let guard = tracker.guard();
        assert_eq!(tracker.count(), 1);
        drop(guard);
        assert_eq!(tracker.count(), 0);
        assert_eq!(tracker.decrement(), Err(PendingError::Underflow));
    }

    #[test]
    fn released_guard_does_not_decrement_again() {
        let tracker = PendingTracker::new();
        tracker.increment();
        let guard = tracker.guard();
        guard.release().unwrap();
        assert_eq!(tracker.count(), 1);
    }

    #[test]
    fn removed_observer_is_silent() {
        let tracker = PendingTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = tracker.on_transition(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tracker.remove_observer(id));
        assert!(!tracker.remove_observer(id));

        tracker.increment();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn observer_may_read_state() {
        let tracker = PendingTracker::new();
        let reader = tracker.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tracker.on_transition(move |_| sink.lock().unwrap().push(reader.is_pending()));

        tracker.increment();
        tracker.decrement().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn watch_channel_follows_edges() {
        let tracker = PendingTracker::new();
        let rx = tracker.subscribe();
        assert!(!*rx.borrow());

        let guard = tracker.guard();
        assert!(*rx.borrow());

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        drop(guard);
        waiter.await.unwrap();
        assert!(!*rx.borrow());
    }
}
