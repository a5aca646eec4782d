//! Bidirectional in-process channel between the broker and one module thread
//!
//! The two directions have different shapes:
//!
//! - module→broker is an unbounded queue, so a module can always flush its
//!   final status report without blocking. Frames pushed before close stay
//!   drainable by the broker (the close linger).
//! - broker→module is a bounded tokio channel; the broker suspends when the
//!   module stops consuming, which is exactly the hazard the FINALIZING
//!   handshake exists to prevent.
//!
//! Each direction preserves send order; there is no ordering guarantee
//! between directions.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::module::error::ModuleError;
use crate::module::protocol::Message;

/// Default bound on the broker→module direction.
pub(crate) const DEFAULT_SEND_CAPACITY: usize = 1000;

/// Readability events reported to the broker-end watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueEvent {
    /// New frames arrived since the last wait.
    Readable,
    /// The module end closed; remaining frames are still drainable.
    Closed,
}

/// Unbounded frame queue with a readability notification for the watcher.
pub(crate) struct FrameQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

struct QueueInner {
    frames: VecDeque<Message>,
    closed: bool,
    /// Set on push, cleared when the watcher observes it; makes
    /// `readable()` edge-triggered so a non-consuming watcher cannot spin.
    fresh: bool,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                closed: false,
                fresh: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append one frame. Never blocks.
    pub fn push(&self, msg: Message) -> Result<(), ModuleError> {
        {
            let mut q = self.inner.lock().unwrap();
            if q.closed {
                return Err(ModuleError::Disconnected);
            }
            q.frames.push_back(msg);
            q.fresh = true;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop one frame without waiting. Frames queued before close remain
    /// available until drained.
    pub fn try_pop(&self) -> Result<Message, ModuleError> {
        let mut q = self.inner.lock().unwrap();
        if let Some(msg) = q.frames.pop_front() {
            Ok(msg)
        } else if q.closed {
            Err(ModuleError::Disconnected)
        } else {
            Err(ModuleError::NotReady)
        }
    }

    /// Wait until new frames arrive or the queue closes.
    pub async fn readable(&self) -> QueueEvent {
        loop {
            // Register before checking state to avoid missed wakeups
            let notified = self.notify.notified();
            {
                let mut q = self.inner.lock().unwrap();
                if q.fresh {
                    q.fresh = false;
                    return QueueEvent::Readable;
                }
                if q.closed {
                    return QueueEvent::Closed;
                }
            }
            notified.await;
        }
    }

    /// Mark the queue closed. Queued frames stay drainable.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }
}

/// Broker-owned endpoint.
pub(crate) struct BrokerEnd {
    /// broker→module sends
    pub tx: mpsc::Sender<Message>,
    /// module→broker receives
    pub inbox: std::sync::Arc<FrameQueue>,
}

/// Module-owned endpoint; moved onto the module thread.
pub(crate) struct ModuleEnd {
    /// module→broker sends
    pub outbox: std::sync::Arc<FrameQueue>,
    /// broker→module receives (blocking on the module thread)
    pub rx: mpsc::Receiver<Message>,
}

impl Drop for ModuleEnd {
    fn drop(&mut self) {
        // Closing the handle; the broker drains whatever was flushed.
        self.outbox.close();
    }
}

/// Create a connected endpoint pair.
pub(crate) fn channel_pair(capacity: usize) -> (BrokerEnd, ModuleEnd) {
    let (tx, rx) = mpsc::channel(capacity);
    let inbox = std::sync::Arc::new(FrameQueue::new());
    (
        BrokerEnd {
            tx,
            inbox: inbox.clone(),
        },
        ModuleEnd { outbox: inbox, rx },
    )
}
