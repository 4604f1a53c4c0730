//! Ordered hand-off of client messages into the agent's input stream.
//!
//! The feeder is the producer half of an unbounded channel: the session
//! manager enqueues each (decorated) client message, and the agent runtime
//! pulls them one at a time, suspending while the queue is empty. Items are
//! delivered in exact enqueue order; closing the feeder ends the stream once
//! the remaining items have drained.

use tokio::sync::mpsc;

/// Returned when enqueueing after the feeder has been closed.
#[derive(Debug, thiserror::Error)]
#[error("input feeder is closed")]
pub struct FeederClosed;

/// Producer half of the agent's input stream.
pub struct InputFeeder {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl InputFeeder {
    /// Creates a feeder and the receiver the agent runtime will consume.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Appends one item to the stream, waking the runtime if it is parked.
    pub fn enqueue(&self, text: impl Into<String>) -> Result<(), FeederClosed> {
        match &self.tx {
            Some(tx) => tx.send(text.into()).map_err(|_| FeederClosed),
            None => Err(FeederClosed),
        }
    }

    /// Ends the stream after the current backlog drains. Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}
