//! Built-in per-module services
//!
//! Every module answers a small set of `<name>.*` methods regardless of
//! what its entry point does: shutdown, ping, stats and a debug toggle.
//! They are installed by the thread runtime before the entry point runs
//! and dispatched from whatever receive loop the module drives (see
//! [`ModuleHandle::run_default_loop`]).

use serde_json::json;

use crate::module::error::ModuleError;
use crate::module::protocol::{Message, MessageType};
use crate::module::runtime::ModuleHandle;

/// Methods served on behalf of every module.
pub const BUILTIN_METHODS: &[&str] = &["shutdown", "ping", "stats-get", "stats-clear", "debug"];

/// Install the built-in services on `h`.
pub fn register(h: &mut ModuleHandle) -> Result<(), ModuleError> {
    h.enable_builtins();
    Ok(())
}

/// Try to handle `msg` as a built-in service request. Returns `Ok(true)`
/// when the message was consumed.
pub fn dispatch(h: &mut ModuleHandle, msg: &Message) -> Result<bool, ModuleError> {
    if !h.builtins_enabled() || msg.msg_type != MessageType::Request {
        return Ok(false);
    }
    let method = {
        let prefix = format!("{}.", h.name());
        match msg.topic.strip_prefix(&prefix) {
            Some(method) => method.to_string(),
            None => return Ok(false),
        }
    };
    match method.as_str() {
        "shutdown" => {
            if msg.wants_response() {
                h.respond(msg, Vec::new())?;
            }
            h.request_shutdown();
            Ok(true)
        }
        "ping" => {
            // Echo the payload back.
            h.respond(msg, msg.payload.clone())?;
            Ok(true)
        }
        "stats-get" => {
            let stats = h.stats();
            let body = json!({
                "tx_count": stats.tx_count,
                "rx_count": stats.rx_count,
            });
            h.respond(msg, serde_json::to_vec(&body)?)?;
            Ok(true)
        }
        "stats-clear" => {
            h.clear_stats();
            if msg.wants_response() {
                h.respond(msg, Vec::new())?;
            }
            Ok(true)
        }
        "debug" => {
            let enabled = h.toggle_debug();
            h.respond(msg, serde_json::to_vec(&json!({ "debug": enabled }))?)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
