//! Priority queues connecting the pipeline stages.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{SchedError, SchedResult};
use crate::job::Priority;
use crate::task::Prioritized;

/// Entry in the priority queue.
#[derive(Debug)]
struct QueueEntry<T> {
    /// Job priority.
    priority: Priority,

    /// Insertion order (for FIFO ordering of same-priority tasks).
    insertion_order: u64,

    task: T,
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.insertion_order == other.insertion_order
    }
}

impl<T> Eq for QueueEntry<T> {}

impl<T> PartialOrd for QueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the lowest priority value and the
        // earliest insertion must compare greatest.
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other_cmp => other_cmp,
        }
    }
}

#[derive(Debug)]
struct QueueState<T> {
    heap: BinaryHeap<QueueEntry<T>>,
    insertion_counter: u64,
    closed: bool,
}

/// A multi-producer/multi-consumer priority queue.
///
/// Tasks are dequeued by ascending priority value (0 before 20). Among
/// tasks with the same priority, tasks are dequeued in FIFO order. There is
/// no fairness between priority classes.
#[derive(Debug)]
pub struct TaskQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    available: Notify,
}

impl<T: Prioritized> TaskQueue<T> {
    /// Create a new empty queue.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                insertion_counter: 0,
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // A panic while holding the lock cannot leave the heap half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Push a task. Never blocks; fails only once the queue is closed.
    pub fn put(&self, task: T) -> SchedResult<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(SchedError::ChannelClosed(self.name.to_string()));
            }
            let entry = QueueEntry {
                priority: task.priority(),
                insertion_order: state.insertion_counter,
                task,
            };
            state.insertion_counter += 1;
            state.heap.push(entry);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the most urgent task without waiting.
    pub fn try_get(&self) -> Option<T> {
        self.lock().heap.pop().map(|entry| entry.task)
    }

    /// Wait for the most urgent task.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(entry) = state.heap.pop() {
                    return Some(entry.task);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Wait at most `timeout` for a task.
    pub async fn get_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.get()).await.ok().flatten()
    }

    /// Refuse further puts and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    /// Whether the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Get the number of queued tasks.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: String,
        priority: Priority,
    }

    impl Prioritized for Item {
        fn priority(&self) -> Priority {
            self.priority
        }
    }

    fn item(name: &str, priority: i64) -> Item {
        Item {
            name: name.to_string(),
            priority: Priority::new(priority).unwrap(),
        }
    }

    #[test]
    fn test_priority_ordering() {
        let queue = TaskQueue::new("test");
        queue.put(item("a", 20)).unwrap();
        queue.put(item("b", 5)).unwrap();
        queue.put(item("c", 5)).unwrap();
        queue.put(item("d", 1)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.try_get())
            .map(|i| (i.priority.value(), i.name))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, "d".to_string()),
                (5, "b".to_string()),
                (5, "c".to_string()),
                (20, "a".to_string()),
            ]
        );
    }

    #[test]
    fn test_fifo_same_priority() {
        let queue = TaskQueue::new("test");
        for name in ["first", "second", "third"] {
            queue.put(item(name, 10)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_get().unwrap().name, "first");
        assert_eq!(queue.try_get().unwrap().name, "second");
        assert_eq!(queue.try_get().unwrap().name, "third");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue = Arc::new(TaskQueue::new("test"));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.put(item("late", 3)).unwrap();
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.name, "late");
    }

    #[tokio::test]
    async fn test_get_timeout_and_close() {
        let queue: TaskQueue<Item> = TaskQueue::new("test");
        assert!(queue.get_timeout(Duration::from_millis(10)).await.is_none());

        queue.put(item("left", 0)).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert!(queue.put(item("refused", 0)).is_err());
        // Queued work is still drained after close.
        assert_eq!(queue.get().await.unwrap().name, "left");
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_many_consumers_each_task_once() {
        let queue = Arc::new(TaskQueue::<Item>::new("test"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(i) = queue.get().await {
                    seen.push(i.name);
                }
                seen
            }));
        }
        for n in 0..100 {
            queue.put(item(&n.to_string(), n % 21)).unwrap();
        }
        queue.close();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_by_key(|s| s.parse::<u32>().unwrap());
        assert_eq!(all, (0..100).map(|n| n.to_string()).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn prop_drain_is_sorted_and_stable(priorities in prop::collection::vec(0i64..=20, 0..64)) {
            let queue = TaskQueue::new("prop");
            for (i, p) in priorities.iter().enumerate() {
                queue.put(item(&i.to_string(), *p)).unwrap();
            }
            let drained: Vec<(u8, usize)> = std::iter::from_fn(|| queue.try_get())
                .map(|i| (i.priority.value(), i.name.parse().unwrap()))
                .collect();
            let mut expected: Vec<(u8, usize)> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| (*p as u8, i))
                .collect();
            expected.sort();
            prop_assert_eq!(drained, expected);
        }
    }
}
