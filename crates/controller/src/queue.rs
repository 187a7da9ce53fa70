//! Work queue for queue controllers.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Coalescing queue with FIFO order and fixed capacity. A key pushed while
/// pending keeps its place; when full the oldest pending key is dropped.
/// Keys handed out stay "in flight" until `done`; pushes meanwhile are parked
/// and re-queued on `done`, so one key never runs twice at once.
pub(crate) struct Coalescer<K> {
    pending: FxHashMap<K, u32>,
    order: VecDeque<K>,
    in_flight: FxHashSet<K>,
    parked: FxHashMap<K, u32>,
    cap: usize,
    dropped: u64,
}

impl<K: Clone + Eq + Hash> Coalescer<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            pending: FxHashMap::default(),
            order: VecDeque::new(),
            in_flight: FxHashSet::default(),
            parked: FxHashMap::default(),
            cap: cap.max(1),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize { self.pending.len() }
    pub fn dropped(&self) -> u64 { self.dropped }

    /// Queue `key`; `attempt` counts previous failures and only grows.
    pub fn push(&mut self, key: K, attempt: u32) {
        if self.in_flight.contains(&key) {
            let slot = self.parked.entry(key).or_insert(attempt);
            *slot = (*slot).max(attempt);
            return;
        }
        if let Some(slot) = self.pending.get_mut(&key) {
            *slot = (*slot).max(attempt);
            return;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.pending.remove(&old);
                self.dropped += 1;
            }
        }
        self.order.push_back(key.clone());
        self.pending.insert(key, attempt);
    }

    pub fn pop(&mut self) -> Option<(K, u32)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(attempt) = self.pending.remove(&key) {
                self.in_flight.insert(key.clone());
                return Some((key, attempt));
            }
        }
        None
    }

    /// Release an in-flight key; returns true when a parked push was re-queued.
    pub fn done(&mut self, key: &K) -> bool {
        self.in_flight.remove(key);
        match self.parked.remove(key) {
            Some(attempt) => {
                self.push(key.clone(), attempt);
                true
            }
            None => false,
        }
    }
}

/// `Coalescer` shared between the mapper and the workers.
pub(crate) struct WorkQueue<K> {
    inner: Mutex<Coalescer<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new(cap: usize) -> Self { Self { inner: Mutex::new(Coalescer::with_capacity(cap)), notify: Notify::new() } }

    fn lock(&self) -> MutexGuard<'_, Coalescer<K>> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Returns the pending length after the push.
    pub fn push(&self, key: K, attempt: u32) -> usize {
        let len = {
            let mut q = self.lock();
            q.push(key, attempt);
            q.len()
        };
        self.notify.notify_one();
        len
    }

    pub fn done(&self, key: &K) {
        if self.lock().done(key) { self.notify.notify_one(); }
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn dropped(&self) -> u64 { self.lock().dropped() }

    /// Wait for the next key; `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<(K, u32)> {
        loop {
            let notified = self.notify.notified();
            let popped = self.lock().pop();
            if popped.is_some() {
                return popped;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_and_keeps_fifo() {
        let mut q = Coalescer::with_capacity(8);
        q.push("a", 0);
        q.push("b", 0);
        q.push("a", 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(("a", 2)));
        assert_eq!(q.pop(), Some(("b", 0)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn drops_oldest_when_full() {
        let mut q = Coalescer::with_capacity(2);
        q.push(1, 0);
        q.push(2, 0);
        q.push(3, 0);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop().map(|(k, _)| k), Some(2));
        assert_eq!(q.pop().map(|(k, _)| k), Some(3));
    }

    #[test]
    fn in_flight_keys_are_parked() {
        let mut q = Coalescer::with_capacity(4);
        q.push("a", 0);
        assert_eq!(q.pop(), Some(("a", 0)));
        q.push("a", 0);
        assert_eq!(q.pop(), None);
        assert!(q.done(&"a"));
        assert_eq!(q.pop(), Some(("a", 0)));
        assert!(!q.done(&"a"));
    }

    #[tokio::test]
    async fn next_wakes_on_push_and_cancel() {
        let q = std::sync::Arc::new(WorkQueue::new(4));
        let cancel = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.next(&cancel).await })
        };
        tokio::task::yield_now().await;
        q.push("k", 0);
        assert_eq!(waiter.await.unwrap(), Some(("k", 0)));

        cancel.cancel();
        assert_eq!(q.next(&cancel).await, None);
    }
}
