//! The error queue between resolution tasks and the logger.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::ResolveError;

/// Sending half of the error queue, shared by every resolution task.
///
/// Publishing never blocks and never fails: once the queue is closed,
/// late errors from tasks still in flight are dropped.
#[derive(Debug, Clone)]
pub struct ErrorQueue {
    sender: Arc<Mutex<Option<UnboundedSender<ResolveError>>>>,
}

impl ErrorQueue {
    pub fn new() -> (Self, UnboundedReceiver<ResolveError>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        };
        (queue, receiver)
    }

    /// Returns whether the error was queued.
    pub fn publish(&self, error: ResolveError) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(error).is_ok(),
            None => false,
        }
    }

    /// Close the queue. The receiver drains what is queued, then ends.
    pub fn close(&self) {
        self.sender.lock().take();
    }
}
