//! In-memory queue broker.
//!
//! Implements the queue service semantics the RPC core depends on:
//! - receive hands out at most one message and moves it in flight
//! - a message stays in flight until deleted with its receipt handle
//! - long-polls return as soon as a message arrives, or `None` at the deadline
//!
//! Two nodes sharing one broker with swapped queue names talk to each other.
//! Faults can be injected to exercise the retry path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::domain::TransportError;
use crate::ports::{QueueMessage, QueueTransport, ReceiptHandle};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    body: String,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<ReceiptHandle, StoredMessage>,
    counters: QueueCounters,
}

/// Per-queue operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub sent: u64,
    pub received: u64,
    pub deleted: u64,
}

#[derive(Debug, Default)]
struct Faults {
    failing_receives: usize,
    receive_error: Option<TransportError>,
    receive_always: Option<TransportError>,
    send_error: Option<TransportError>,
    delete_error: Option<TransportError>,
}

/// Queue broker held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    faults: Mutex<Faults>,
    arrivals: Notify,
    next_id: AtomicU64,
    receive_attempts: AtomicU64,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body, bypassing send faults
    pub fn push_raw(&self, queue: &str, body: impl Into<String>) {
        self.enqueue(queue, body.into());
    }

    /// Messages waiting to be received
    pub fn depth(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages received but not yet deleted
    pub fn in_flight(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |q| q.in_flight.len())
    }

    pub fn counters(&self, queue: &str) -> QueueCounters {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.counters)
            .unwrap_or_default()
    }

    /// Bodies waiting on `queue`, oldest first
    pub fn peek_all(&self, queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Receive calls made against any queue, including failed ones
    pub fn receive_attempts(&self) -> u64 {
        self.receive_attempts.load(Ordering::Relaxed)
    }

    /// Make every in-flight message on `queue` visible again, as a queue
    /// service does once the visibility timeout lapses.
    pub fn requeue_in_flight(&self, queue: &str) -> usize {
        let count = {
            let mut queues = self.queues.lock();
            let Some(state) = queues.get_mut(queue) else {
                return 0;
            };
            let mut returned: Vec<StoredMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
            returned.sort_by_key(|m| m.id);
            let count = returned.len();
            for message in returned.into_iter().rev() {
                state.ready.push_front(message);
            }
            count
        };
        if count > 0 {
            self.arrivals.notify_waiters();
        }
        count
    }

    /// Fail the next `count` receives with `error`
    pub fn fail_next_receives(&self, count: usize, error: TransportError) {
        let mut faults = self.faults.lock();
        faults.failing_receives = count;
        faults.receive_error = Some(error);
    }

    /// Fail every receive with `error` until faults are cleared
    pub fn fail_all_receives(&self, error: TransportError) {
        self.faults.lock().receive_always = Some(error);
    }

    /// Fail every send with `error` until faults are cleared
    pub fn fail_sends(&self, error: TransportError) {
        self.faults.lock().send_error = Some(error);
    }

    /// Fail every delete with `error` until faults are cleared
    pub fn fail_deletes(&self, error: TransportError) {
        self.faults.lock().delete_error = Some(error);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn enqueue(&self, queue: &str, body: String) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut queues = self.queues.lock();
            let state = queues.entry(queue.to_string()).or_default();
            state.ready.push_back(StoredMessage { id, body });
            state.counters.sent += 1;
        }
        self.arrivals.notify_waiters();
    }

    fn receive_fault(&self) -> Option<TransportError> {
        let mut faults = self.faults.lock();
        if let Some(error) = &faults.receive_always {
            return Some(error.clone());
        }
        if faults.failing_receives > 0 {
            faults.failing_receives -= 1;
            return faults.receive_error.clone();
        }
        None
    }

    fn try_take(&self, queue: &str) -> Option<QueueMessage> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;

        let nonce = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receipt = ReceiptHandle::new(format!("{}-{}-{}", queue, message.id, nonce));
        let body = message.body.clone();
        state.in_flight.insert(receipt.clone(), message);
        state.counters.received += 1;

        Some(QueueMessage {
            body,
            receipt_handle: receipt,
        })
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn send(&self, queue: &str, body: String) -> Result<(), TransportError> {
        if let Some(error) = self.faults.lock().send_error.clone() {
            return Err(error);
        }
        trace!(queue = queue, "Message enqueued");
        self.enqueue(queue, body);
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<QueueMessage>, TransportError> {
        self.receive_attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self.receive_fault() {
            return Err(error);
        }

        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking, so a send in between is not missed
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if let Some(message) = self.try_take(queue) {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn delete(&self, queue: &str, receipt: &ReceiptHandle) -> Result<(), TransportError> {
        if let Some(error) = self.faults.lock().delete_error.clone() {
            return Err(error);
        }

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| TransportError::UnknownReceipt(receipt.to_string()))?;
        state.counters.deleted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_send_receive_delete() {
        let broker = InMemoryQueue::new();
        broker.send("q", "hello".into()).await.unwrap();
        assert_eq!(broker.depth("q"), 1);

        let message = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(message.body, "hello");
        assert_eq!(broker.depth("q"), 0);
        assert_eq!(broker.in_flight("q"), 1);

        broker.delete("q", &message.receipt_handle).await.unwrap();
        assert_eq!(broker.in_flight("q"), 0);
        assert_eq!(
            broker.counters("q"),
            QueueCounters {
                sent: 1,
                received: 1,
                deleted: 1
            }
        );
    }

    #[tokio::test]
    async fn test_delete_twice_fails() {
        let broker = InMemoryQueue::new();
        broker.push_raw("q", "x");
        let message = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();

        broker.delete("q", &message.receipt_handle).await.unwrap();
        assert!(matches!(
            broker.delete("q", &message.receipt_handle).await,
            Err(TransportError::UnknownReceipt(_))
        ));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = InMemoryQueue::new();
        broker.push_raw("q", "1");
        broker.push_raw("q", "2");

        let first = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        let second = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.body, "1");
        assert_eq!(second.body, "2");
        assert_ne!(first.receipt_handle, second.receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let broker = InMemoryQueue::new();
        let started = Instant::now();
        let received = broker.receive("q", Duration::from_secs(30)).await.unwrap();
        assert!(received.is_none());
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let broker = Arc::new(InMemoryQueue::new());
        let sender = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            sender.send("q", "late".into()).await.unwrap();
        });

        let started = Instant::now();
        let message = broker.receive("q", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(message.body, "late");
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_requeue_in_flight() {
        let broker = InMemoryQueue::new();
        broker.push_raw("q", "a");
        broker.push_raw("q", "b");
        let _ = broker.receive("q", Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(broker.requeue_in_flight("q"), 1);
        assert_eq!(broker.peek_all("q"), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_receive_faults() {
        let broker = InMemoryQueue::new();
        broker.push_raw("q", "x");
        broker.fail_next_receives(2, TransportError::Unavailable("down".into()));

        assert!(broker.receive("q", Duration::ZERO).await.is_err());
        assert!(broker.receive("q", Duration::ZERO).await.is_err());
        assert!(broker.receive("q", Duration::ZERO).await.unwrap().is_some());
        assert_eq!(broker.receive_attempts(), 3);
    }

    #[tokio::test]
    async fn test_send_fault_and_clear() {
        let broker = InMemoryQueue::new();
        broker.fail_sends(TransportError::Unavailable("down".into()));
        assert!(broker.send("q", "x".into()).await.is_err());
        assert_eq!(broker.depth("q"), 0);

        broker.clear_faults();
        broker.send("q", "x".into()).await.unwrap();
        assert_eq!(broker.depth("q"), 1);
    }
}
