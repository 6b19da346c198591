// src/agent/queue.rs

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Batches of process IDs whose local state changed and must be published.
///
/// Semantics:
/// - `push` never blocks. When `capacity` batches are already waiting, the
///   oldest one is dropped and a warning is logged. The periodic full
///   publish covers whatever a dropped batch contained.
/// - `next` waits until at least one batch is queued and pops it.
/// - Empty batches are ignored.
#[derive(Debug)]
pub struct PublishQueue {
    capacity: usize,
    batches: Mutex<VecDeque<Vec<String>>>,
    notify: Notify,
}

impl PublishQueue {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            batches: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, proc_ids: Vec<String>) {
        if proc_ids.is_empty() {
            return;
        }
        {
            let mut batches = self.batches.lock();
            while batches.len() >= self.capacity {
                if let Some(dropped) = batches.pop_front() {
                    warn!(
                        dropped = ?dropped,
                        capacity = self.capacity,
                        "publish queue full; dropping oldest batch"
                    );
                }
            }
            batches.push_back(proc_ids);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Vec<String>> {
        self.batches.lock().pop_front()
    }

    pub async fn next(&self) -> Vec<String> {
        loop {
            let notified = self.notify.notified();
            if let Some(batch) = self.try_pop() {
                return batch;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn overflow_drops_oldest_batch() {
        let q = PublishQueue::new(2);
        q.push(ids(&["1"]));
        q.push(ids(&["2"]));
        q.push(ids(&["3", "4"]));

        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop(), Some(ids(&["2"])));
        assert_eq!(q.try_pop(), Some(ids(&["3", "4"])));
        assert!(q.is_empty());
    }

    #[test]
    fn empty_batches_are_ignored() {
        let q = PublishQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.push(Vec::new());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn next_waits_for_a_push() {
        let q = Arc::new(PublishQueue::new(10));
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.next().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(ids(&["10000"]));

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, ids(&["10000"]));
    }
}
