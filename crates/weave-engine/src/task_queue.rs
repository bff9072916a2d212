//! Admission queue for incoming queries.
//!
//! The response manager only needs the four operations of [`TaskQueue`];
//! priority ordering and per-peer fairness are the queue's business. The
//! bundled [`RoundRobinTaskQueue`] orders by priority within a peer and
//! rotates across peers so one chatty peer cannot starve the rest.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use weave_core::{PeerId, Priority, RequestId};

/// One admitted query waiting for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub peer: PeerId,
    pub request_id: RequestId,
    pub priority: Priority,
}

#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Admit a task.
    fn push(&self, task: Task);

    /// Next task to run. Suspends until one is available.
    async fn pop(&self) -> Task;

    /// Withdraw a task that has not been popped yet. No-op otherwise.
    fn remove(&self, request_id: RequestId, peer: PeerId);

    /// Release any back-pressure freeze. The default queue never freezes,
    /// so this only nudges parked workers.
    fn thaw_round(&self);
}

// ── Default implementation ────────────────────────────────────────────────────

struct QueuedTask {
    priority: Priority,
    seq: u64,
    request_id: RequestId,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first, then oldest.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    rotation: VecDeque<PeerId>,
    tasks: HashMap<PeerId, BinaryHeap<QueuedTask>>,
}

#[derive(Default)]
pub struct RoundRobinTaskQueue {
    state: Mutex<QueueState>,
    available: Notify,
    next_seq: AtomicU64,
}

impl RoundRobinTaskQueue {
    pub fn new() -> Self {
        RoundRobinTaskQueue::default()
    }

    fn try_pop(&self) -> Option<Task> {
        let mut state = self.state.lock();
        for _ in 0..state.rotation.len() {
            let peer = state.rotation.pop_front()?;
            let Some(heap) = state.tasks.get_mut(&peer) else {
                continue;
            };
            let Some(task) = heap.pop() else {
                state.tasks.remove(&peer);
                continue;
            };
            if heap.is_empty() {
                state.tasks.remove(&peer);
            } else {
                state.rotation.push_back(peer);
            }
            return Some(Task {
                peer,
                request_id: task.request_id,
                priority: task.priority,
            });
        }
        None
    }
}

#[async_trait]
impl TaskQueue for RoundRobinTaskQueue {
    fn push(&self, task: Task) {
        {
            let mut state = self.state.lock();
            if !state.rotation.contains(&task.peer) {
                state.rotation.push_back(task.peer);
            }
            state.tasks.entry(task.peer).or_default().push(QueuedTask {
                priority: task.priority,
                seq: self.next_seq.fetch_add(1, AtomicOrdering::SeqCst),
                request_id: task.request_id,
            });
        }
        self.available.notify_one();
    }

    async fn pop(&self) -> Task {
        loop {
            let notified = self.available.notified();
            if let Some(task) = self.try_pop() {
                return task;
            }
            notified.await;
        }
    }

    fn remove(&self, request_id: RequestId, peer: PeerId) {
        let mut state = self.state.lock();
        if let Some(heap) = state.tasks.get_mut(&peer) {
            heap.retain(|t| t.request_id != request_id);
            if heap.is_empty() {
                state.tasks.remove(&peer);
            }
        }
    }

    fn thaw_round(&self) {
        self.available.notify_waiters();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::testutil::random_peer;

    const TICK: Duration = Duration::from_secs(1);

    fn task(peer: PeerId, id: i32, priority: i32) -> Task {
        Task {
            peer,
            request_id: RequestId(id),
            priority: Priority(priority),
        }
    }

    #[tokio::test]
    async fn priority_orders_within_a_peer() {
        let queue = RoundRobinTaskQueue::new();
        let peer = random_peer();
        queue.push(task(peer, 1, 1));
        queue.push(task(peer, 2, 10));
        queue.push(task(peer, 3, 5));

        assert_eq!(queue.pop().await.request_id, RequestId(2));
        assert_eq!(queue.pop().await.request_id, RequestId(3));
        assert_eq!(queue.pop().await.request_id, RequestId(1));
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let queue = RoundRobinTaskQueue::new();
        let peer = random_peer();
        for id in 1..=3 {
            queue.push(task(peer, id, 7));
        }
        for id in 1..=3 {
            assert_eq!(queue.pop().await.request_id, RequestId(id));
        }
    }

    #[tokio::test]
    async fn peers_take_turns() {
        let queue = RoundRobinTaskQueue::new();
        let a = random_peer();
        let b = random_peer();
        queue.push(task(a, 1, 0));
        queue.push(task(a, 2, 0));
        queue.push(task(b, 3, 0));
        queue.push(task(b, 4, 0));

        let order: Vec<PeerId> = [
            queue.pop().await,
            queue.pop().await,
            queue.pop().await,
            queue.pop().await,
        ]
        .iter()
        .map(|t| t.peer)
        .collect();
        assert_eq!(order, vec![a, b, a, b]);
    }

    #[tokio::test]
    async fn removed_tasks_are_never_popped() {
        let queue = RoundRobinTaskQueue::new();
        let peer = random_peer();
        queue.push(task(peer, 1, 0));
        queue.push(task(peer, 2, 0));
        queue.remove(RequestId(1), peer);

        assert_eq!(queue.pop().await.request_id, RequestId(2));
        assert!(timeout(Duration::from_millis(20), queue.pop()).await.is_err());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(RoundRobinTaskQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let peer = random_peer();
        queue.push(task(peer, 9, 0));
        let popped = timeout(TICK, popper).await.unwrap().unwrap();
        assert_eq!(popped.request_id, RequestId(9));
    }
}
