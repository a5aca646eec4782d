//! Message frame protocol
//!
//! Defines the opaque frame carried on the broker/module channel: type,
//! route stack, topic, credentials, matchtag and payload. The broker routes
//! on the frame header only; payloads are opaque bytes (structured bodies
//! such as status reports use JSON).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::module::error::ModuleError;

/// Topic of the status-report RPC a module sends on state changes.
pub const MODULE_STATUS_TOPIC: &str = "broker.module-status";

/// Topics of the event subscription RPCs handled on the broker side.
pub const EVENT_SUBSCRIBE_TOPIC: &str = "event.subscribe";
pub const EVENT_UNSUBSCRIBE_TOPIC: &str = "event.unsubscribe";

/// Topic of the control frame that interrupts a module at its next
/// suspension point.
pub const CONTROL_CANCEL_TOPIC: &str = "cancel";

/// Matchtag reserved for fire-and-forget requests (no response expected).
pub const MATCHTAG_NONE: u32 = 0;

/// Message type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Request, expects a response unless matchtag is `MATCHTAG_NONE`
    Request,
    /// Response to a request
    Response,
    /// Published event
    Event,
    /// Channel control frame
    Control,
}

bitflags! {
    /// Credential role bits carried on every frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleMask: u32 {
        /// Sender is the instance owner and may assert other users'
        /// credentials.
        const OWNER = 1;
        /// Ordinary authenticated user.
        const USER = 2;
        /// Sender is local to this broker.
        const LOCAL = 4;
    }
}

impl Serialize for RoleMask {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for RoleMask {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(d)?;
        Ok(RoleMask::from_bits_truncate(bits))
    }
}

/// `(userid, rolemask)` tuple carried on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub userid: u32,
    pub rolemask: RoleMask,
}

impl Credentials {
    /// Sentinel userid meaning "not asserted by the sender".
    pub const UNKNOWN_USERID: u32 = u32::MAX;

    /// Credentials asserted on nothing; normalized on receive.
    pub fn unknown() -> Self {
        Self {
            userid: Self::UNKNOWN_USERID,
            rolemask: RoleMask::empty(),
        }
    }

    /// Fixed channel credentials: the calling process uid with owner and
    /// local roles.
    pub fn owner() -> Self {
        #[cfg(unix)]
        let userid = nix::unistd::getuid().as_raw();
        #[cfg(not(unix))]
        let userid = 0;
        Self {
            userid,
            rolemask: RoleMask::OWNER | RoleMask::LOCAL,
        }
    }
}

/// Ordered list of identity strings used to deliver responses back to the
/// originator. `push` stacks a new hop on top; `delete_last` pops the most
/// recently pushed hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStack(Vec<String>);

impl RouteStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: impl Into<String>) {
        self.0.push(id.into());
    }

    pub fn delete_last(&mut self) -> Result<String, ModuleError> {
        self.0
            .pop()
            .ok_or_else(|| ModuleError::Routing("route stack is empty".to_string()))
    }

    /// Most recently pushed hop.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }

    /// Originating hop (first pushed).
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One frame on the broker/module channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub topic: String,
    pub route: RouteStack,
    pub cred: Credentials,
    /// Correlates responses with requests; `MATCHTAG_NONE` marks
    /// fire-and-forget requests.
    pub matchtag: u32,
    /// Response error number (0 = success); unused on other types.
    pub errnum: i32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(topic: impl Into<String>) -> Self {
        Self::new(MessageType::Request, topic)
    }

    pub fn event(topic: impl Into<String>) -> Self {
        Self::new(MessageType::Event, topic)
    }

    pub fn control(topic: impl Into<String>) -> Self {
        Self::new(MessageType::Control, topic)
    }

    fn new(msg_type: MessageType, topic: impl Into<String>) -> Self {
        Self {
            msg_type,
            topic: topic.into(),
            route: RouteStack::new(),
            cred: Credentials::unknown(),
            matchtag: MATCHTAG_NONE,
            errnum: 0,
            payload: Vec::new(),
        }
    }

    /// Build a success response to `req`, inheriting its topic, matchtag,
    /// credentials and route stack.
    pub fn response_to(req: &Message) -> Self {
        Self {
            msg_type: MessageType::Response,
            topic: req.topic.clone(),
            route: req.route.clone(),
            cred: req.cred,
            matchtag: req.matchtag,
            errnum: 0,
            payload: Vec::new(),
        }
    }

    /// Build an error response to `req` carrying `errnum`.
    pub fn error_response_to(req: &Message, errnum: i32) -> Self {
        let mut msg = Self::response_to(req);
        msg.errnum = errnum;
        msg
    }

    pub fn with_matchtag(mut self, matchtag: u32) -> Self {
        self.matchtag = matchtag;
        self
    }

    pub fn with_cred(mut self, cred: Credentials) -> Self {
        self.cred = cred;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a JSON body.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, ModuleError> {
        self.payload = serde_json::to_vec(body)?;
        Ok(self)
    }

    /// Decode the payload as a JSON body.
    pub fn json_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ModuleError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// True for requests that expect a response.
    pub fn wants_response(&self) -> bool {
        self.msg_type == MessageType::Request && self.matchtag != MATCHTAG_NONE
    }
}

/// Body of the `broker.module-status` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errnum: Option<i32>,
}

/// Body of the `event.subscribe` / `event.unsubscribe` RPCs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub topic: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_stack_push_pop() {
        let mut route = RouteStack::new();
        assert!(route.is_empty());
        route.push("a");
        route.push("b");
        assert_eq!(route.last(), Some("b"));
        assert_eq!(route.first(), Some("a"));
        assert_eq!(route.delete_last().unwrap(), "b");
        assert_eq!(route.last(), Some("a"));
        assert_eq!(route.delete_last().unwrap(), "a");
        assert!(route.delete_last().is_err());
    }

    #[test]
    fn test_response_inherits_request_header() {
        let mut req = Message::request("kvs.get").with_matchtag(7);
        req.route.push("client-1");
        let resp = Message::response_to(&req);
        assert_eq!(resp.msg_type, MessageType::Response);
        assert_eq!(resp.topic, "kvs.get");
        assert_eq!(resp.matchtag, 7);
        assert_eq!(resp.route.last(), Some("client-1"));
        assert_eq!(resp.errnum, 0);
    }

    #[test]
    fn test_error_response_carries_errnum() {
        let req = Message::request("x.y").with_matchtag(1);
        let resp = Message::error_response_to(&req, libc::ENOSYS);
        assert_eq!(resp.errnum, libc::ENOSYS);
    }

    #[test]
    fn test_wants_response() {
        assert!(Message::request("a").with_matchtag(3).wants_response());
        assert!(!Message::request("a").wants_response());
        assert!(!Message::event("a").with_matchtag(3).wants_response());
    }

    #[test]
    fn test_status_report_body() {
        let msg = Message::request(MODULE_STATUS_TOPIC)
            .with_json(&StatusReport {
                status: 2,
                errnum: None,
            })
            .unwrap();
        let body: StatusReport = msg.json_payload().unwrap();
        assert_eq!(body.status, 2);
        assert!(body.errnum.is_none());
    }

    #[test]
    fn test_rolemask_serde_roundtrip() {
        let cred = Credentials::owner();
        let json = serde_json::to_string(&cred).unwrap();
        let back: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rolemask, RoleMask::OWNER | RoleMask::LOCAL);
    }
}
