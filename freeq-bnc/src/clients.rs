//! Connected clients and their outbound queues.
//!
//! The broadcast loop must never wait on a slow client, so each client gets
//! a bounded queue drained by its own writer task. When the queue is full
//! the oldest line is evicted to make room.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::line::Line;

/// Per-process session number, in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

struct QueueInner {
    lines: VecDeque<Line>,
    closed: bool,
}

/// Bounded outbound queue with drop-oldest on overflow.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                lines: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without waiting. Returns false once the queue is closed.
    pub fn push(&self, line: Line) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            if inner.lines.len() >= self.capacity {
                inner.lines.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            inner.lines.push_back(line);
        }
        self.notify.notify_one();
        true
    }

    /// Next line, or `None` once closed and drained.
    pub async fn pop(&self) -> Option<Line> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(line) = inner.lines.pop_front() {
                    return Some(line);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take an already-queued line without waiting.
    pub fn try_pop(&self) -> Option<Line> {
        self.inner.lock().lines.pop_front()
    }

    /// Stop accepting lines. Queued lines can still be drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        // Covers futures created by `pop` but not yet polled.
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines evicted so far because the client fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Every client currently receiving broadcasts, in admission order.
#[derive(Default)]
pub struct ClientSet {
    clients: Mutex<Vec<(ClientId, Arc<OutboundQueue>)>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, id: ClientId, queue: Arc<OutboundQueue>) {
        self.clients.lock().push((id, queue));
    }

    /// Forget a client and close its queue. Unknown ids are ignored.
    pub fn remove(&self, id: ClientId) {
        let removed = {
            let mut clients = self.clients.lock();
            clients
                .iter()
                .position(|(cid, _)| *cid == id)
                .map(|i| clients.remove(i))
        };
        if let Some((_, queue)) = removed {
            queue.close();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a line for every client. Never blocks on a client.
    ///
    /// Returns the number of clients the line was queued for.
    pub fn broadcast(&self, line: &Line) -> usize {
        let clients = self.clients.lock();
        let mut queued = 0;
        for (_, queue) in clients.iter() {
            if queue.push(line.clone()) {
                queued += 1;
            }
        }
        queued
    }

    /// Close every queue and empty the set.
    pub fn close_all(&self) {
        let clients = std::mem::take(&mut *self.clients.lock());
        for (_, queue) in clients {
            queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn client_ids_are_distinct_and_ordered() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert!(a < b);
        assert!(a.to_string().starts_with("client-"));
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let queue = OutboundQueue::new(2);
        assert!(queue.push(Line::from("A")));
        assert!(queue.push(Line::from("B")));
        assert!(queue.push(Line::from("C")));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(Line::from("B")));
        assert_eq!(queue.try_pop(), Some(Line::from("C")));
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let queue = OutboundQueue::new(0);
        queue.push(Line::from("A"));
        queue.push(Line::from("B"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop(), Some(Line::from("B")));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Line::from("late"));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(Line::from("late")));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.push(Line::from("last"));
        queue.close();
        assert!(!queue.push(Line::from("rejected")));
        assert_eq!(queue.pop().await, Some(Line::from("last")));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn close_wakes_waiting_pop() {
        let queue = Arc::new(OutboundQueue::new(4));
        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn broadcast_reaches_every_client_in_order() {
        let set = ClientSet::new();
        let a = Arc::new(OutboundQueue::new(8));
        let b = Arc::new(OutboundQueue::new(8));
        set.admit(ClientId::next(), Arc::clone(&a));
        set.admit(ClientId::next(), Arc::clone(&b));

        for text in ["A", "B", "C"] {
            assert_eq!(set.broadcast(&Line::from(text)), 2);
        }
        for queue in [&a, &b] {
            let got: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
            assert_eq!(got, vec![Line::from("A"), Line::from("B"), Line::from("C")]);
        }
    }

    #[test]
    fn late_client_misses_earlier_broadcasts() {
        let set = ClientSet::new();
        let early = Arc::new(OutboundQueue::new(8));
        set.admit(ClientId::next(), Arc::clone(&early));
        set.broadcast(&Line::from("A"));

        let late = Arc::new(OutboundQueue::new(8));
        set.admit(ClientId::next(), Arc::clone(&late));
        set.broadcast(&Line::from("B"));

        assert_eq!(early.len(), 2);
        assert_eq!(late.try_pop(), Some(Line::from("B")));
        assert!(late.is_empty());
    }

    #[test]
    fn removed_client_is_closed_and_skipped() {
        let set = ClientSet::new();
        let id = ClientId::next();
        let queue = Arc::new(OutboundQueue::new(8));
        set.admit(id, Arc::clone(&queue));
        set.remove(id);
        set.remove(id);
        assert!(set.is_empty());
        assert!(!queue.push(Line::from("after remove")));
        assert_eq!(set.broadcast(&Line::from("X")), 0);
    }

    #[test]
    fn close_all_empties_the_set() {
        let set = ClientSet::new();
        let queues: Vec<_> = (0..3).map(|_| Arc::new(OutboundQueue::new(1))).collect();
        for q in &queues {
            set.admit(ClientId::next(), Arc::clone(q));
        }
        set.close_all();
        assert!(set.is_empty());
        assert!(queues.iter().all(|q| !q.push(Line::from("late"))));
    }
}
