//! Job transport: request ids handed from producers to the dispatcher.

use tokio::sync::mpsc;

use sitegen_core::RequestId;

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job queue closed")]
    Closed,
}

/// Publishing side of the job transport.
///
/// Delivery is at-least-once: consumers must tolerate duplicates. Publishing
/// never waits for the job to run.
pub trait JobQueue: Send + Sync + 'static {
    fn publish(&self, request_id: RequestId) -> Result<(), QueueError>;
}

/// In-process queue over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct InMemoryJobQueue {
    tx: mpsc::UnboundedSender<RequestId>,
}

/// Consuming side of [`InMemoryJobQueue`].
#[derive(Debug)]
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<RequestId>,
}

impl InMemoryJobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, JobReceiver { rx })
    }
}

impl JobQueue for InMemoryJobQueue {
    fn publish(&self, request_id: RequestId) -> Result<(), QueueError> {
        self.tx.send(request_id).map_err(|_| QueueError::Closed)
    }
}

impl JobReceiver {
    /// Wait for the next delivery; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<RequestId> {
        self.rx.recv().await
    }

    /// Take everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<RequestId> {
        let mut ids = Vec::new();
        while let Ok(id) = self.rx.try_recv() {
            ids.push(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_in_order_and_reports_closure() {
        let (queue, mut receiver) = InMemoryJobQueue::new();

        queue.publish(RequestId::new(1)).unwrap();
        queue.publish(RequestId::new(2)).unwrap();
        assert_eq!(receiver.drain(), vec![RequestId::new(1), RequestId::new(2)]);

        drop(receiver);
        assert_eq!(queue.publish(RequestId::new(3)), Err(QueueError::Closed));
    }
}
