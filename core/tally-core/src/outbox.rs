//! Best-effort delivery of sync messages out of a monitor.
//!
//! `send` never blocks and never fails: with nobody listening the message is
//! dropped. Anything that needs to know whether the coordinator saw a message
//! has to query it.

use chat_tally_protocol::SyncMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub trait Outbox: Send + Sync {
    fn send(&self, message: SyncMessage);
}

impl<T: Outbox + ?Sized> Outbox for Arc<T> {
    fn send(&self, message: SyncMessage) {
        (**self).send(message)
    }
}

impl<T: Outbox + ?Sized> Outbox for Box<T> {
    fn send(&self, message: SyncMessage) {
        (**self).send(message)
    }
}

/// Forwards into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelOutbox {
    sender: mpsc::UnboundedSender<SyncMessage>,
}

impl ChannelOutbox {
    pub fn new(sender: mpsc::UnboundedSender<SyncMessage>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl Outbox for ChannelOutbox {
    fn send(&self, message: SyncMessage) {
        if let Err(err) = self.sender.send(message) {
            debug!(kind = err.0.kind(), "No listener for sync message");
        }
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutbox;

impl Outbox for NullOutbox {
    fn send(&self, _message: SyncMessage) {}
}
