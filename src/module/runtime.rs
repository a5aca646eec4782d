//! Module thread runtime
//!
//! The code executed on each module-owned OS thread: open the broker
//! handle over the channel, prime the attribute cache, install built-in
//! services, block signals, run the entry point, then synchronize the
//! FINALIZING/EXITED shutdown handshake with the broker.
//!
//! The FINALIZING report is synchronous on purpose: the broker must stop
//! dispatching new requests to this module before the handle closes, or a
//! request could be queued toward a module that will never drain it. Any
//! request that slips in before the acknowledgment is answered with ENOSYS
//! by the drain step.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{AttrTable, BrokerConfig};
use crate::module::channel::ModuleEnd;
use crate::module::error::ModuleError;
use crate::module::loader::ModEntry;
use crate::module::modservice;
use crate::module::protocol::{
    Message, MessageType, StatusReport, SubscribeRequest, CONTROL_CANCEL_TOPIC,
    EVENT_SUBSCRIBE_TOPIC, EVENT_UNSUBSCRIBE_TOPIC, MATCHTAG_NONE, MODULE_STATUS_TOPIC,
};
use crate::module::record::ModuleStatus;

/// Everything the module thread needs, captured before `start` and
/// immutable afterwards.
pub(crate) struct ModuleThreadCtx {
    pub name: String,
    pub uuid_str: String,
    pub rank: u32,
    pub attrs: std::sync::Arc<AttrTable>,
    /// Independent copy of the broker configuration snapshot.
    pub conf: BrokerConfig,
    pub args: Vec<String>,
    pub entry: ModEntry,
    pub end: ModuleEnd,
    pub cancel: CancellationToken,
}

/// Message counters reported by the built-in stats service.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandleStats {
    pub tx_count: u64,
    pub rx_count: u64,
}

/// The module side of the channel: what the entry point receives.
///
/// All operations are blocking; the handle lives on the module's own
/// thread and never touches broker-side record state.
pub struct ModuleHandle {
    name: String,
    uuid: String,
    uri: String,
    rank: u32,
    attr_cache: HashMap<String, String>,
    conf: BrokerConfig,
    /// Both channel legs; closes on drop so the broker observes the end of
    /// this module even on early failure paths.
    end: ModuleEnd,
    /// Requests set aside while waiting for a synchronous RPC response;
    /// replayed by `recv` and the shutdown drain.
    backlog: VecDeque<Message>,
    next_matchtag: u32,
    cancel: CancellationToken,
    builtins_enabled: bool,
    shutdown_requested: bool,
    debug_enabled: bool,
    stats: HandleStats,
}

impl ModuleHandle {
    fn open(
        name: &str,
        uuid: &str,
        rank: u32,
        conf: BrokerConfig,
        end: ModuleEnd,
        cancel: CancellationToken,
    ) -> Result<Self, ModuleError> {
        if end.outbox.is_closed() {
            return Err(ModuleError::Disconnected);
        }
        Ok(Self {
            name: name.to_string(),
            uuid: uuid.to_string(),
            uri: format!("shmem://{uuid}"),
            rank,
            attr_cache: HashMap::new(),
            conf,
            end,
            backlog: VecDeque::new(),
            next_matchtag: 1,
            cancel,
            builtins_enabled: false,
            shutdown_requested: false,
            debug_enabled: false,
            stats: HandleStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn conf(&self) -> &BrokerConfig {
        &self.conf
    }

    /// Look up a broker attribute from the primed cache.
    pub fn attr_get(&self, name: &str) -> Option<&str> {
        self.attr_cache.get(name).map(|s| s.as_str())
    }

    pub fn stats(&self) -> HandleStats {
        self.stats
    }

    pub(crate) fn clear_stats(&mut self) {
        self.stats = HandleStats::default();
    }

    pub(crate) fn enable_builtins(&mut self) {
        self.builtins_enabled = true;
    }

    pub(crate) fn builtins_enabled(&self) -> bool {
        self.builtins_enabled
    }

    /// Ask the dispatch loop to exit after the current message.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub(crate) fn toggle_debug(&mut self) -> bool {
        self.debug_enabled = !self.debug_enabled;
        self.debug_enabled
    }

    fn alloc_matchtag(&mut self) -> u32 {
        let tag = self.next_matchtag;
        self.next_matchtag = self.next_matchtag.wrapping_add(1).max(1);
        tag
    }

    fn prime_attr_cache(&mut self, attrs: &AttrTable) {
        self.attr_cache = attrs.immutables();
    }

    /// Send one frame toward the broker. Never blocks.
    pub fn send(&mut self, msg: Message) -> Result<(), ModuleError> {
        self.end.outbox.push(msg)?;
        self.stats.tx_count += 1;
        Ok(())
    }

    /// Receive one frame, blocking until one arrives. Returns
    /// [`ModuleError::Disconnected`] when the broker end closed or the
    /// module was canceled.
    pub fn recv(&mut self) -> Result<Message, ModuleError> {
        if let Some(msg) = self.backlog.pop_front() {
            self.stats.rx_count += 1;
            return Ok(msg);
        }
        if self.cancel.is_cancelled() {
            return Err(ModuleError::Disconnected);
        }
        match self.end.rx.blocking_recv() {
            None => Err(ModuleError::Disconnected),
            Some(msg) if is_cancel(&msg) => Err(ModuleError::Disconnected),
            Some(msg) => {
                self.stats.rx_count += 1;
                Ok(msg)
            }
        }
    }

    /// Receive one frame without blocking.
    pub fn try_recv(&mut self) -> Result<Message, ModuleError> {
        if let Some(msg) = self.backlog.pop_front() {
            self.stats.rx_count += 1;
            return Ok(msg);
        }
        match self.end.rx.try_recv() {
            Ok(msg) if is_cancel(&msg) => Err(ModuleError::Disconnected),
            Ok(msg) => {
                self.stats.rx_count += 1;
                Ok(msg)
            }
            Err(mpsc::error::TryRecvError::Empty) => Err(ModuleError::NotReady),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ModuleError::Disconnected),
        }
    }

    /// Synchronous RPC: send a request and block until its response.
    /// Requests that arrive while waiting are set aside for later receipt.
    pub fn rpc<T: serde::Serialize>(&mut self, topic: &str, body: &T) -> Result<Message, ModuleError> {
        self.rpc_inner(topic, body, true)
    }

    fn rpc_inner<T: serde::Serialize>(
        &mut self,
        topic: &str,
        body: &T,
        interruptible: bool,
    ) -> Result<Message, ModuleError> {
        if interruptible && self.cancel.is_cancelled() {
            return Err(ModuleError::Disconnected);
        }
        let tag = self.alloc_matchtag();
        let req = Message::request(topic).with_matchtag(tag).with_json(body)?;
        self.send(req)?;
        loop {
            match self.end.rx.blocking_recv() {
                None => return Err(ModuleError::Disconnected),
                Some(msg) if is_cancel(&msg) => {
                    if interruptible {
                        return Err(ModuleError::Disconnected);
                    }
                    // Shutdown handshake in progress; the ack still matters.
                }
                Some(msg) if msg.msg_type == MessageType::Response && msg.matchtag == tag => {
                    self.stats.rx_count += 1;
                    if msg.errnum != 0 {
                        return Err(ModuleError::Rpc {
                            topic: topic.to_string(),
                            errnum: msg.errnum,
                        });
                    }
                    return Ok(msg);
                }
                Some(msg) if msg.msg_type == MessageType::Request => {
                    self.backlog.push_back(msg);
                }
                Some(msg) => {
                    debug!(topic = %msg.topic, "discarding unexpected frame during rpc wait");
                }
            }
        }
    }

    /// Fire-and-forget RPC (no response expected).
    pub fn rpc_noresponse<T: serde::Serialize>(
        &mut self,
        topic: &str,
        body: &T,
    ) -> Result<(), ModuleError> {
        let req = Message::request(topic)
            .with_matchtag(MATCHTAG_NONE)
            .with_json(body)?;
        self.send(req)
    }

    /// Respond to `req` with a success payload.
    pub fn respond(&mut self, req: &Message, payload: Vec<u8>) -> Result<(), ModuleError> {
        self.send(Message::response_to(req).with_payload(payload))
    }

    /// Respond to `req` with an error number.
    pub fn respond_error(&mut self, req: &Message, errnum: i32) -> Result<(), ModuleError> {
        self.send(Message::error_response_to(req, errnum))
    }

    /// Subscribe to events whose topic starts with `topic`.
    pub fn event_subscribe(&mut self, topic: &str) -> Result<(), ModuleError> {
        self.rpc(
            EVENT_SUBSCRIBE_TOPIC,
            &SubscribeRequest {
                topic: topic.to_string(),
            },
        )?;
        Ok(())
    }

    /// Drop one matching event subscription.
    pub fn event_unsubscribe(&mut self, topic: &str) -> Result<(), ModuleError> {
        self.rpc(
            EVENT_UNSUBSCRIBE_TOPIC,
            &SubscribeRequest {
                topic: topic.to_string(),
            },
        )?;
        Ok(())
    }

    /// Simple dispatch loop for modules without their own event loop:
    /// handles built-in services, answers unknown requests with ENOSYS,
    /// and returns once shutdown is requested.
    pub fn run_default_loop(&mut self) -> Result<(), i32> {
        loop {
            let msg = match self.recv() {
                Ok(msg) => msg,
                Err(ModuleError::Disconnected) => return Err(libc::ECONNRESET),
                Err(_) => continue,
            };
            match modservice::dispatch(self, &msg) {
                Ok(true) => {}
                Ok(false) => {
                    if msg.wants_response() {
                        let _ = self.respond_error(&msg, libc::ENOSYS);
                    }
                }
                Err(e) => {
                    warn!(topic = %msg.topic, "service dispatch failed: {e}");
                }
            }
            if self.shutdown_requested {
                return Ok(());
            }
        }
    }
}

fn is_cancel(msg: &Message) -> bool {
    msg.msg_type == MessageType::Control && msg.topic == CONTROL_CANCEL_TOPIC
}

/// Synchronize the FINALIZING state with the broker, so the broker stops
/// feeding messages to this module until it is fully shut down.
fn report_finalizing(h: &mut ModuleHandle) -> Result<(), ModuleError> {
    h.rpc_inner(
        MODULE_STATUS_TOPIC,
        &StatusReport {
            status: ModuleStatus::Finalizing.as_code(),
            errnum: None,
        },
        false,
    )?;
    Ok(())
}

#[cfg(unix)]
fn block_signals() -> Result<(), ModuleError> {
    // Only the broker's main thread should observe signals.
    nix::sys::signal::SigSet::all()
        .thread_block()
        .map_err(|e| ModuleError::Thread(format!("sigmask: {e}")))
}

#[cfg(not(unix))]
fn block_signals() -> Result<(), ModuleError> {
    Ok(())
}

/// Body of the module-owned thread.
pub(crate) fn module_thread(ctx: ModuleThreadCtx) {
    let span = tracing::info_span!("module", name = %ctx.name);
    let _guard = span.enter();

    let ModuleThreadCtx {
        name,
        uuid_str,
        rank,
        attrs,
        conf,
        args,
        entry,
        end,
        cancel,
    } = ctx;

    // Open the broker handle, prime the attribute cache, install built-in
    // services and block signals. Failure here skips the entry point; the
    // broker observes the channel close and marks the module EXITED.
    let mut h = match ModuleHandle::open(&name, &uuid_str, rank, conf, end, cancel) {
        Ok(h) => h,
        Err(e) => {
            error!("{name}: error opening broker handle: {e}");
            return;
        }
    };
    h.prime_attr_cache(&attrs);
    if let Err(e) = modservice::register(&mut h) {
        error!("{name}: error registering built-in services: {e}");
        return;
    }
    if let Err(e) = block_signals() {
        error!("{name}: {e}");
        return;
    }
    if let Err(e) = h.rpc_noresponse(
        MODULE_STATUS_TOPIC,
        &StatusReport {
            status: ModuleStatus::Running.as_code(),
            errnum: None,
        },
    ) {
        error!("{name}: error reporting RUNNING: {e}");
        return;
    }

    // Run the module's main().
    let mut mod_main_errnum = 0;
    if let Err(errnum) = entry.invoke(&mut h, &args) {
        mod_main_errnum = if errnum == 0 { libc::ECONNRESET } else { errnum };
        error!("module exiting abnormally");
    }

    // Mute this module in the broker before answering residual requests;
    // otherwise the broker may queue a message toward a handle that is
    // about to close.
    if let Err(e) = report_finalizing(&mut h) {
        warn!("broker.module-status FINALIZING error: {e}");
    }

    // Answer unhandled requests received during shutdown with ENOSYS.
    loop {
        match h.try_recv() {
            Ok(msg) if msg.wants_response() => {
                debug!("responding to post-shutdown {}", msg.topic);
                if let Err(e) = h.respond_error(&msg, libc::ENOSYS) {
                    warn!("responding to post-shutdown {}: {e}", msg.topic);
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    if let Err(e) = h.rpc_noresponse(
        MODULE_STATUS_TOPIC,
        &StatusReport {
            status: ModuleStatus::Exited.as_code(),
            errnum: Some(mod_main_errnum),
        },
    ) {
        warn!("broker.module-status EXITED error: {e}");
    }
    // The handle closes when it drops; frames flushed above stay drainable
    // on the broker side.
}
