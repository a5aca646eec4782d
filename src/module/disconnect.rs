//! Disconnect tracking
//!
//! Records which services a module has outstanding interactions with, so
//! that when the module goes away, each of those services receives a
//! synthetic `<service>.disconnect` request and can release per-sender
//! state.

use std::collections::HashSet;
use std::sync::Arc;

use crate::module::error::ModuleError;
use crate::module::protocol::Message;

/// Receives the synthetic disconnect requests emitted at teardown.
pub type DisconnectCallback = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DisconnectKey {
    sender: String,
    service: String,
    matchtag: u32,
}

pub struct DisconnectTracker {
    cb: DisconnectCallback,
    /// Armed tuples, deduplicated per (sender, service).
    armed: Vec<DisconnectKey>,
    seen: HashSet<(String, String)>,
}

impl DisconnectTracker {
    pub fn new(cb: DisconnectCallback) -> Self {
        Self {
            cb,
            armed: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Record the (sender, matchtag) of `msg`. One disconnect per
    /// (sender, service) pair is enough, so repeats are dropped.
    pub fn arm(&mut self, msg: &Message) -> Result<(), ModuleError> {
        let sender = msg
            .route
            .first()
            .ok_or_else(|| ModuleError::Routing("message has no sender route".to_string()))?
            .to_string();
        let service = service_of(&msg.topic).to_string();
        if !self.seen.insert((sender.clone(), service.clone())) {
            return Ok(());
        }
        self.armed.push(DisconnectKey {
            sender,
            service,
            matchtag: msg.matchtag,
        });
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.armed.len()
    }

    /// Emit one synthetic disconnect per armed tuple and consume the
    /// tracker. The disconnect carries the recorded matchtag so a service
    /// can match it to per-request state.
    pub fn destroy(self) {
        for key in self.armed {
            let mut msg = Message::request(format!("{}.disconnect", key.service))
                .with_matchtag(key.matchtag);
            msg.route.push(key.sender);
            (self.cb)(msg);
        }
    }
}

/// Service part of a topic: `"kvs.get"` -> `"kvs"`.
fn service_of(topic: &str) -> &str {
    match topic.find('.') {
        Some(pos) => &topic[..pos],
        None => topic,
    }
}
