use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::wire::message::RawMessage;

/// A decoded message plus where and when it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedMessage {
    pub worker_id: u64,
    pub received_at: DateTime<Utc>,
    pub message: RawMessage,
}

/// Unbounded FIFO between connection workers and the consumer loop.
///
/// Senders are handed out freely; the receiving end is taken exactly once by
/// the consumer.
pub struct IngestionQueue {
    sender: Sender<QueuedMessage>,
    receiver: Receiver<QueuedMessage>,
}

#[derive(Clone)]
pub struct IngestionSender {
    sender: Sender<QueuedMessage>,
}

pub struct IngestionReceiver {
    receiver: Receiver<QueuedMessage>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Dequeue {
    Empty,
    Disconnected,
}

impl IngestionQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    pub fn split(self) -> (IngestionSender, IngestionReceiver) {
        (
            IngestionSender {
                sender: self.sender,
            },
            IngestionReceiver {
                receiver: self.receiver,
            },
        )
    }
}

impl Default for IngestionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestionSender {
    /// Never blocks. Returns the message back if the consumer is gone, which
    /// only happens during shutdown.
    pub fn enqueue(&self, worker_id: u64, message: RawMessage) -> Result<(), RawMessage> {
        self.sender
            .send(QueuedMessage {
                worker_id,
                received_at: Utc::now(),
                message,
            })
            .map_err(|error| error.0.message)
    }
}

impl IngestionReceiver {
    #[cfg(test)]
    pub fn dequeue(&self) -> Result<QueuedMessage, Dequeue> {
        self.receiver.recv().map_err(|_| Dequeue::Disconnected)
    }

    /// Blocks for at most `timeout`, so the consumer can notice shutdown.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<QueuedMessage, Dequeue> {
        self.receiver.recv_timeout(timeout).map_err(|error| match error {
            RecvTimeoutError::Timeout => Dequeue::Empty,
            RecvTimeoutError::Disconnected => Dequeue::Disconnected,
        })
    }
}
