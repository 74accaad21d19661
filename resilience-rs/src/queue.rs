//! # Queue Client
//!
//! The boundary to the external at-least-once queue that holds dead-lettered
//! work and receives retries, plus an in-process implementation for tests
//! and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a queue client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The client or its runtime is shutting down; callers treat this as a
    /// silent no-op
    #[error("queue client is shutting down")]
    ShuttingDown,

    #[error("unknown receipt handle {0}")]
    UnknownReceipt(String),

    #[error("queue transport error: {0}")]
    Transport(String),
}

/// A message received from a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    /// Handle used to acknowledge (delete) this delivery
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// A message to enqueue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub body: String,
    pub delay_seconds: u32,
    pub attributes: HashMap<String, String>,
}

/// Client for an at-least-once queue with visibility semantics
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receives up to `max_messages`, waiting at most `wait` for the first
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledges a delivery so it is not redelivered
    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Enqueues a message and returns its id
    async fn send(&self, queue_url: &str, request: SendRequest) -> Result<String, QueueError>;
}

/// A message held by [`InMemoryQueue`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub body: String,
    pub delay_seconds: u32,
    pub attributes: HashMap<String, String>,
    pub receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
}

/// In-process queue keyed by URL
///
/// Delays are recorded on the stored message but not enforced. Received
/// messages stay in flight until deleted or until
/// [`release_in_flight`](Self::release_in_flight) simulates an expired
/// visibility timeout.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    shutting_down: AtomicBool,
    reject_sends: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_running(&self) -> Result<(), QueueError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        Ok(())
    }

    /// Places a message directly on a queue, as a producer would
    pub fn push<S: Into<String>>(&self, queue_url: &str, body: S, attributes: HashMap<String, String>) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.lock()
            .entry(queue_url.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                message_id: message_id.clone(),
                body: body.into(),
                delay_seconds: 0,
                attributes,
                receive_count: 0,
            });
        message_id
    }

    /// Messages waiting to be received
    pub fn ready_messages(&self, queue_url: &str) -> Vec<StoredMessage> {
        self.lock()
            .get(queue_url)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of received but unacknowledged messages
    pub fn in_flight_count(&self, queue_url: &str) -> usize {
        self.lock().get(queue_url).map(|q| q.in_flight.len()).unwrap_or(0)
    }

    /// Makes every unacknowledged delivery visible again
    pub fn release_in_flight(&self, queue_url: &str) {
        if let Some(queue) = self.lock().get_mut(queue_url) {
            let released: Vec<StoredMessage> = queue.in_flight.drain().map(|(_, m)| m).collect();
            queue.ready.extend(released);
        }
    }

    /// Puts the client into the shutting-down state
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Makes subsequent sends fail with a transport error while set
    pub fn set_reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive(
        &self,
        queue_url: &str,
        max_messages: usize,
        _wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.check_running()?;

        let mut queues = self.lock();
        let queue = queues.entry(queue_url.to_string()).or_default();
        let mut delivered = Vec::new();

        while delivered.len() < max_messages {
            let Some(mut stored) = queue.ready.pop_front() else {
                break;
            };
            stored.receive_count += 1;
            let receipt_handle = Uuid::new_v4().to_string();
            delivered.push(QueueMessage {
                message_id: stored.message_id.clone(),
                receipt_handle: receipt_handle.clone(),
                body: stored.body.clone(),
                attributes: stored.attributes.clone(),
            });
            queue.in_flight.insert(receipt_handle, stored);
        }

        Ok(delivered)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        self.check_running()?;

        self.lock()
            .get_mut(queue_url)
            .and_then(|queue| queue.in_flight.remove(receipt_handle))
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))
    }

    async fn send(&self, queue_url: &str, request: SendRequest) -> Result<String, QueueError> {
        self.check_running()?;
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(QueueError::Transport(format!("send to {} rejected", queue_url)));
        }

        let message_id = Uuid::new_v4().to_string();
        self.lock()
            .entry(queue_url.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                message_id: message_id.clone(),
                body: request.body,
                delay_seconds: request.delay_seconds,
                attributes: request.attributes,
                receive_count: 0,
            });
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "memory://dlq";

    #[tokio::test]
    async fn test_receive_and_delete() {
        let queue = InMemoryQueue::new();
        queue.push(URL, "one", HashMap::new());
        queue.push(URL, "two", HashMap::new());
        queue.push(URL, "three", HashMap::new());

        let batch = queue.receive(URL, 2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, "one");
        assert_eq!(queue.in_flight_count(URL), 2);
        assert_eq!(queue.ready_messages(URL).len(), 1);

        queue.delete(URL, &batch[0].receipt_handle).await.unwrap();
        assert_eq!(queue.in_flight_count(URL), 1);

        let again = queue.delete(URL, &batch[0].receipt_handle).await;
        assert!(matches!(again, Err(QueueError::UnknownReceipt(_))));
    }

    #[tokio::test]
    async fn test_release_redelivers() {
        let queue = InMemoryQueue::new();
        let id = queue.push(URL, "payload", HashMap::new());

        let first = queue.receive(URL, 10, Duration::ZERO).await.unwrap();
        queue.release_in_flight(URL);
        let second = queue.receive(URL, 10, Duration::ZERO).await.unwrap();

        assert_eq!(first[0].message_id, id);
        assert_eq!(second[0].message_id, id);
        assert_ne!(first[0].receipt_handle, second[0].receipt_handle);
    }

    #[tokio::test]
    async fn test_send_records_delay_and_attributes() {
        let queue = InMemoryQueue::new();
        let mut attributes = HashMap::new();
        attributes.insert("RetryCount".to_string(), "1".to_string());

        queue
            .send(
                "memory://retry",
                SendRequest {
                    body: "{}".to_string(),
                    delay_seconds: 60,
                    attributes,
                },
            )
            .await
            .unwrap();

        let ready = queue.ready_messages("memory://retry");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].delay_seconds, 60);
        assert_eq!(ready[0].attributes["RetryCount"], "1");
    }

    #[tokio::test]
    async fn test_shutdown_and_rejected_sends() {
        let queue = InMemoryQueue::new();
        queue.set_reject_sends(true);
        let request = SendRequest {
            body: "x".to_string(),
            delay_seconds: 0,
            attributes: HashMap::new(),
        };
        assert!(matches!(
            queue.send(URL, request.clone()).await,
            Err(QueueError::Transport(_))
        ));

        queue.shutdown();
        assert_eq!(
            queue.receive(URL, 1, Duration::ZERO).await,
            Err(QueueError::ShuttingDown)
        );
        assert_eq!(queue.send(URL, request).await, Err(QueueError::ShuttingDown));
    }
}
