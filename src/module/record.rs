//! Module record and host API
//!
//! One [`Module`] record is the ownership root for one loaded module: the
//! dynamic handle, identity, credentials, channel endpoint, thread handle,
//! lifecycle state, pending administrative messages, subscription set and
//! disconnect tracker.
//!
//! The record is owned by the broker side. Fields the module thread reads
//! are written only before [`Module::start`] and immutable afterwards; the
//! channel is the only cross-thread mutable object.
//!
//! The channel is point-to-point but must look like a DEALER/ROUTER pair
//! to both sides, so [`Module::sendmsg`] and [`Module::recvmsg`] rewrite
//! the route stack:
//!
//! - receive: responses lose their last route hop; requests and events
//!   gain this module's uuid so the broker knows who sent them.
//! - send: requests gain the broker's own uuid as the outbound hop;
//!   responses lose their last hop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{AttrTable, BrokerConfig};
use crate::module::channel::{channel_pair, BrokerEnd, QueueEvent};
use crate::module::disconnect::{DisconnectCallback, DisconnectTracker};
use crate::module::error::ModuleError;
use crate::module::loader::{
    check_legacy_name, module_name_from_path, ModEntry, ModuleDso, NativeMainFn,
};
use crate::module::protocol::{
    Credentials, Message, MessageType, RoleMask, CONTROL_CANCEL_TOPIC, MODULE_STATUS_TOPIC,
};
use crate::module::runtime::{self, ModuleThreadCtx};
use crate::module::subscription::SubscriptionSet;

/// Module lifecycle state. Transitions are monotone: INIT can never be
/// reentered and EXITED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Init,
    Running,
    Finalizing,
    Exited,
}

impl ModuleStatus {
    /// Wire code used in status-report bodies.
    pub fn as_code(self) -> i32 {
        match self {
            ModuleStatus::Init => 0,
            ModuleStatus::Running => 1,
            ModuleStatus::Finalizing => 2,
            ModuleStatus::Exited => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ModuleStatus::Init),
            1 => Some(ModuleStatus::Running),
            2 => Some(ModuleStatus::Finalizing),
            3 => Some(ModuleStatus::Exited),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModuleStatus::Init => "init",
            ModuleStatus::Running => "running",
            ModuleStatus::Finalizing => "finalizing",
            ModuleStatus::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Invoked from the reactor watcher whenever the module's channel becomes
/// readable (or closes).
pub type PollerCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked on every lifecycle transition with `(previous, current)`.
pub type StatusCallback = Arc<dyn Fn(ModuleStatus, ModuleStatus) + Send + Sync>;

/// One loaded module.
pub struct Module {
    name: String,
    path: PathBuf,
    uuid_str: String,
    parent_uuid: String,
    rank: u32,
    cred: Credentials,

    // Channel, broker end. The sender is dropped by destroy so a module
    // parked in a receive observes the close and unwinds.
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbox: Arc<crate::module::channel::FrameQueue>,

    // Consumed by start().
    thread_ctx: Mutex<Option<ModuleThreadCtx>>,

    // Broker-side mutable state.
    status: Mutex<ModuleStatus>,
    errnum: AtomicI32,
    muted: AtomicBool,
    last_seen: Mutex<Option<Instant>>,
    poller_cb: Mutex<Option<PollerCallback>>,
    status_cb: Mutex<Option<StatusCallback>>,
    rmmod: Mutex<VecDeque<Message>>,
    insmod: Mutex<Option<Message>>,
    subs: SubscriptionSet,
    disconnect: Mutex<Option<DisconnectTracker>>,
    cancel: CancellationToken,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,

    // Declared last: released only after the thread has been joined and
    // every symbol reference is gone.
    dso: Mutex<Option<ModuleDso>>,
}

impl Module {
    /// Load the artifact at `path` and build a record for it.
    ///
    /// Resolves `mod_main`, checks the legacy `mod_name` symbol if present,
    /// generates the instance uuid and binds the broker end of the channel.
    /// The reactor watcher and module thread are not started yet.
    pub fn create(
        parent_uuid: &str,
        name: Option<&str>,
        path: &Path,
        rank: u32,
        attrs: Arc<AttrTable>,
        conf: Arc<BrokerConfig>,
        args: Vec<String>,
    ) -> Result<Arc<Module>, ModuleError> {
        if parent_uuid.is_empty() {
            return Err(ModuleError::Invalid("empty parent uuid".to_string()));
        }
        let dso = ModuleDso::load(path)?;
        let entry = dso.entry()?;
        let name = match name {
            Some(name) => name.to_string(),
            None => module_name_from_path(path)?,
        };
        // Legacy 'mod_name' symbol - not recommended for new modules but
        // double check that it's sane if present.
        check_legacy_name(dso.legacy_name().as_deref(), &name)?;

        Self::new_record(
            parent_uuid,
            name,
            path.to_path_buf(),
            rank,
            attrs,
            conf,
            args,
            ModEntry::Symbol(entry),
            Some(dso),
        )
    }

    /// Build a record around a native entry point, for built-in modules
    /// and tests. Same semantics as [`Module::create`] minus the artifact.
    pub fn create_native(
        parent_uuid: &str,
        name: &str,
        rank: u32,
        attrs: Arc<AttrTable>,
        conf: Arc<BrokerConfig>,
        args: Vec<String>,
        main: NativeMainFn,
    ) -> Result<Arc<Module>, ModuleError> {
        if parent_uuid.is_empty() {
            return Err(ModuleError::Invalid("empty parent uuid".to_string()));
        }
        if name.is_empty() {
            return Err(ModuleError::Invalid("empty module name".to_string()));
        }
        Self::new_record(
            parent_uuid,
            name.to_string(),
            PathBuf::from(format!("builtin:{name}")),
            rank,
            attrs,
            conf,
            args,
            ModEntry::Native(main),
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new_record(
        parent_uuid: &str,
        name: String,
        path: PathBuf,
        rank: u32,
        attrs: Arc<AttrTable>,
        conf: Arc<BrokerConfig>,
        args: Vec<String>,
        entry: ModEntry,
        dso: Option<ModuleDso>,
    ) -> Result<Arc<Module>, ModuleError> {
        let uuid_str = Uuid::new_v4().to_string();
        let (broker_end, module_end) = channel_pair(conf.module_send_capacity.max(1));
        let BrokerEnd { tx, inbox } = broker_end;
        let cancel = CancellationToken::new();

        let ctx = ModuleThreadCtx {
            name: name.clone(),
            uuid_str: uuid_str.clone(),
            rank,
            attrs,
            // The thread gets its own copy so it can mutate its view
            // without racing the broker.
            conf: (*conf).clone(),
            args,
            entry,
            end: module_end,
            cancel: cancel.clone(),
        };

        Ok(Arc::new(Module {
            name,
            path,
            uuid_str,
            parent_uuid: parent_uuid.to_string(),
            rank,
            // Point to point connection between broker threads: always the
            // instance owner.
            cred: Credentials::owner(),
            tx: Mutex::new(Some(tx)),
            inbox,
            thread_ctx: Mutex::new(Some(ctx)),
            status: Mutex::new(ModuleStatus::Init),
            errnum: AtomicI32::new(0),
            muted: AtomicBool::new(false),
            last_seen: Mutex::new(None),
            poller_cb: Mutex::new(None),
            status_cb: Mutex::new(None),
            rmmod: Mutex::new(VecDeque::new()),
            insmod: Mutex::new(None),
            subs: SubscriptionSet::new(),
            disconnect: Mutex::new(None),
            cancel,
            watcher: Mutex::new(None),
            thread: Mutex::new(None),
            dso: Mutex::new(dso),
        }))
    }

    /// Start the reactor watcher and spawn the module thread.
    pub fn start(self: &Arc<Self>) -> Result<(), ModuleError> {
        let ctx = self
            .thread_ctx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ModuleError::Invalid(format!("module {} already started", self.name)))?;

        let m = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            loop {
                let event = m.inbox.readable().await;
                if event == QueueEvent::Readable {
                    *m.last_seen.lock().unwrap() = Some(Instant::now());
                }
                let cb = m.poller_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb();
                }
                if event == QueueEvent::Closed {
                    break;
                }
            }
        });
        *self.watcher.lock().unwrap() = Some(watcher);

        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || runtime::module_thread(ctx))
            .map_err(|e| {
                if let Some(w) = self.watcher.lock().unwrap().take() {
                    w.abort();
                }
                ModuleError::Thread(format!("spawning {}: {e}", self.name))
            })?;
        *self.thread.lock().unwrap() = Some(thread);
        Ok(())
    }

    /// Request graceful termination: a fire-and-forget request to the
    /// module's `<name>.shutdown` topic. Does not wait.
    pub async fn stop(&self) -> Result<(), ModuleError> {
        let msg = Message::request(format!("{}.shutdown", self.name)).with_cred(self.cred);
        self.sendmsg(&msg).await
    }

    /// Cancel the module thread asynchronously. The entry point observes
    /// the cancellation at its next suspension point. Succeeds when the
    /// thread has already exited.
    pub fn cancel(&self) -> Result<(), ModuleError> {
        self.cancel.cancel();
        // Best effort: a parked recv needs a frame to wake up.
        if let Some(tx) = self.tx.lock().unwrap().clone() {
            let _ = tx.try_send(Message::control(CONTROL_CANCEL_TOPIC));
        }
        Ok(())
    }

    /// Tear the record down: join the thread, force the EXITED transition
    /// if it has not happened, emit armed disconnects, and release the
    /// dynamic handle.
    pub async fn destroy(&self) {
        // Stop watching before joining; the thread is never joined while
        // the broker end is still watched.
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.abort();
        }
        // Unblock a thread that never reached its entry point.
        drop(self.thread_ctx.lock().unwrap().take());
        // A module still running gets canceled, and dropping the sender
        // lets a parked receive (including the FINALIZING wait) observe
        // the close instead of blocking the join below.
        if self.get_status() != ModuleStatus::Exited {
            let _ = self.cancel();
        }
        drop(self.tx.lock().unwrap().take());

        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let name = self.name.clone();
            if tokio::task::spawn_blocking(move || thread.join())
                .await
                .map(|r| r.is_err())
                .unwrap_or(true)
            {
                warn!("module {name}: thread join failed");
            }
            // Releases broker-held references on this module's service
            // names; without this, disconnects triggered while another
            // module is destroyed can still resolve to this record.
            self.advance_status(ModuleStatus::Exited);
        }

        // Send disconnect notifications for services this module used.
        let tracker = self.disconnect.lock().unwrap().take();
        if let Some(tracker) = tracker {
            tracker.destroy();
        }

        self.inbox.close();
        self.rmmod.lock().unwrap().clear();
        *self.insmod.lock().unwrap() = None;
        self.subs.clear();
        *self.poller_cb.lock().unwrap() = None;
        *self.status_cb.lock().unwrap() = None;
        *self.dso.lock().unwrap() = None;
    }

    /// Push one frame toward the module, rewriting so the module sees
    /// ROUTER-style framing. Muted modules accept only the status-report
    /// response.
    pub async fn sendmsg(&self, msg: &Message) -> Result<(), ModuleError> {
        if self.muted.load(Ordering::Acquire)
            && (msg.msg_type != MessageType::Response || msg.topic != MODULE_STATUS_TOPIC)
        {
            return Err(ModuleError::NotSupported(format!(
                "module {} is muted",
                self.name
            )));
        }
        let out = match msg.msg_type {
            MessageType::Request => {
                // Simulate DEALER socket: address the reply path upstream.
                let mut cpy = msg.clone();
                cpy.route.push(self.parent_uuid.clone());
                cpy
            }
            MessageType::Response => {
                // Simulate ROUTER socket: consume the delivery hop.
                let mut cpy = msg.clone();
                cpy.route.delete_last()?;
                cpy
            }
            _ => msg.clone(),
        };
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(out).await.map_err(|_| ModuleError::Disconnected),
            None => Err(ModuleError::Disconnected),
        }
    }

    /// Pull one frame from the module, rewriting and validating
    /// credentials. Returns [`ModuleError::NotReady`] when nothing is
    /// queued and [`ModuleError::Disconnected`] once the module closed its
    /// end and the queue is drained.
    pub fn recvmsg(&self) -> Result<Message, ModuleError> {
        let mut msg = self.inbox.try_pop()?;
        match msg.msg_type {
            MessageType::Response => {
                msg.route.delete_last()?;
            }
            MessageType::Request | MessageType::Event => {
                msg.route.push(self.uuid_str.clone());
            }
            _ => {}
        }
        // This end of the channel is authenticated as the instance owner;
        // an owner module may assert other users' credentials (required
        // for connector-style modules).
        assert!(self.cred.rolemask.contains(RoleMask::OWNER));
        if msg.cred.userid == Credentials::UNKNOWN_USERID {
            msg.cred.userid = self.cred.userid;
        }
        if msg.cred.rolemask.is_empty() {
            msg.cred.rolemask = self.cred.rolemask;
        }
        Ok(msg)
    }

    /// Deliver an event iff one of the module's subscriptions is a prefix
    /// of its topic.
    pub async fn event_cast(&self, msg: &Message) -> Result<(), ModuleError> {
        if self.subs.matches(&msg.topic) {
            self.sendmsg(msg).await?;
        }
        Ok(())
    }

    /// Add a topic-prefix subscription. Duplicates are allowed.
    pub fn subscribe(&self, topic: &str) -> Result<(), ModuleError> {
        if topic.is_empty() {
            return Err(ModuleError::Invalid("empty subscription topic".to_string()));
        }
        self.subs.subscribe(topic);
        Ok(())
    }

    /// Remove the first matching subscription; a non-present topic is a
    /// no-op.
    pub fn unsubscribe(&self, topic: &str) {
        self.subs.unsubscribe(topic);
    }

    /// Record the `(sender, matchtag)` of `msg` so a synthetic disconnect
    /// can be emitted when this record is destroyed.
    pub fn disconnect_arm(
        &self,
        msg: &Message,
        cb: DisconnectCallback,
    ) -> Result<(), ModuleError> {
        let mut guard = self.disconnect.lock().unwrap();
        guard
            .get_or_insert_with(|| DisconnectTracker::new(cb))
            .arm(msg)
    }

    /// Park a pending remove-module request. FIFO.
    pub fn push_rmmod(&self, msg: Message) {
        self.rmmod.lock().unwrap().push_back(msg);
    }

    pub fn pop_rmmod(&self) -> Option<Message> {
        self.rmmod.lock().unwrap().pop_front()
    }

    /// Park the pending install-module request. There can be only one; a
    /// new push replaces any prior request.
    pub fn push_insmod(&self, msg: Message) {
        let prior = self.insmod.lock().unwrap().replace(msg);
        if prior.is_some() {
            debug!("module {}: replaced pending insmod request", self.name);
        }
    }

    pub fn pop_insmod(&self) -> Option<Message> {
        self.insmod.lock().unwrap().take()
    }

    /// Stop delivering anything but the status-report response.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_poller_cb(&self, cb: PollerCallback) {
        *self.poller_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_status_cb(&self, cb: StatusCallback) {
        *self.status_cb.lock().unwrap() = Some(cb);
    }

    /// Transition the lifecycle state and invoke the status callback.
    ///
    /// # Panics
    /// Transitioning to INIT or out of EXITED is illegal.
    pub fn set_status(&self, new_status: ModuleStatus) {
        let prev = {
            let mut status = self.status.lock().unwrap();
            assert!(
                new_status != ModuleStatus::Init,
                "illegal state transition to init"
            );
            assert!(
                *status != ModuleStatus::Exited,
                "illegal state transition out of exited"
            );
            let prev = *status;
            *status = new_status;
            prev
        };
        let cb = self.status_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(prev, new_status);
        }
    }

    /// Like [`Module::set_status`], but drops transitions that would not
    /// move the lifecycle forward instead of panicking. Used where broker
    /// paths can race (late status reports, destroy-forces-EXITED).
    pub fn advance_status(&self, new_status: ModuleStatus) -> bool {
        let prev = {
            let mut status = self.status.lock().unwrap();
            if new_status.as_code() <= status.as_code() {
                return false;
            }
            let prev = *status;
            *status = new_status;
            prev
        };
        let cb = self.status_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(prev, new_status);
        }
        true
    }

    pub fn get_status(&self) -> ModuleStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_errnum(&self, errnum: i32) {
        self.errnum.store(errnum, Ordering::Release);
    }

    pub fn get_errnum(&self) -> i32 {
        self.errnum.load(Ordering::Acquire)
    }

    /// Instant of the most recent message received from the module.
    pub fn get_last_seen(&self) -> Option<Instant> {
        *self.last_seen.lock().unwrap()
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn get_uuid(&self) -> &str {
        &self.uuid_str
    }

    pub fn get_rank(&self) -> u32 {
        self.rank
    }

    /// Channel credentials (instance owner).
    pub fn get_cred(&self) -> Credentials {
        self.cred
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("uuid", &self.uuid_str)
            .field("status", &self.get_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::channel::ModuleEnd;
    use crate::module::protocol::RouteStack;

    fn test_module() -> (Arc<Module>, ModuleEnd) {
        let m = Module::create_native(
            "parent-uuid",
            "testmod",
            0,
            Arc::new(AttrTable::new()),
            Arc::new(BrokerConfig::default()),
            Vec::new(),
            Box::new(|_, _| Ok(())),
        )
        .unwrap();
        // Detach the module end so the test can play the module side
        // without spawning a thread.
        let ctx = m.thread_ctx.lock().unwrap().take().unwrap();
        (m, ctx.end)
    }

    #[tokio::test]
    async fn test_send_request_pushes_parent_uuid() {
        let (m, mut end) = test_module();
        let msg = Message::request("kvs.get").with_matchtag(1);
        m.sendmsg(&msg).await.unwrap();
        let got = end.rx.try_recv().unwrap();
        assert_eq!(got.route.last(), Some("parent-uuid"));
        assert_eq!(got.route.len(), 1);
        assert_eq!(got.topic, "kvs.get");
        // The original is untouched: send rewrites a copy.
        assert!(msg.route.is_empty());
    }

    #[tokio::test]
    async fn test_send_response_pops_last_hop() {
        let (m, mut end) = test_module();
        let mut msg = Message::request("a.b").with_matchtag(2);
        msg.route.push("client");
        msg.route.push(m.get_uuid().to_string());
        let mut resp = Message::response_to(&msg);
        let pre_len = resp.route.len();
        m.sendmsg(&resp).await.unwrap();
        let got = end.rx.try_recv().unwrap();
        assert_eq!(got.route.len(), pre_len - 1);
        assert_eq!(got.route.last(), Some("client"));
        // Response with an empty route stack cannot be delivered.
        resp.route = RouteStack::new();
        assert!(matches!(
            m.sendmsg(&resp).await,
            Err(ModuleError::Routing(_))
        ));
    }

    #[tokio::test]
    async fn test_send_event_passes_through() {
        let (m, mut end) = test_module();
        let msg = Message::event("job.state");
        m.sendmsg(&msg).await.unwrap();
        let got = end.rx.try_recv().unwrap();
        assert!(got.route.is_empty());
    }

    #[tokio::test]
    async fn test_recv_request_pushes_module_uuid() {
        let (m, end) = test_module();
        end.outbox
            .push(Message::request("service.add").with_matchtag(3))
            .unwrap();
        let got = m.recvmsg().unwrap();
        assert_eq!(got.route.last(), Some(m.get_uuid()));
    }

    #[tokio::test]
    async fn test_recv_response_pops_last_hop() {
        let (m, end) = test_module();
        let mut resp = Message::request("x.y");
        resp.msg_type = MessageType::Response;
        resp.route.push("client");
        resp.route.push("parent-uuid");
        end.outbox.push(resp).unwrap();
        let got = m.recvmsg().unwrap();
        assert_eq!(got.route.last(), Some("client"));
        assert_eq!(got.route.len(), 1);
    }

    #[tokio::test]
    async fn test_recv_control_passes_through() {
        let (m, end) = test_module();
        let mut msg = Message::control("ping");
        msg.route.push("x");
        end.outbox.push(msg).unwrap();
        let got = m.recvmsg().unwrap();
        assert_eq!(got.route.len(), 1);
        assert_eq!(got.route.last(), Some("x"));
    }

    #[tokio::test]
    async fn test_recv_normalizes_unknown_credentials() {
        let (m, end) = test_module();
        end.outbox.push(Message::request("a.b")).unwrap();
        let got = m.recvmsg().unwrap();
        assert_eq!(got.cred.userid, m.get_cred().userid);
        assert!(got.cred.rolemask.contains(RoleMask::OWNER));
    }

    #[tokio::test]
    async fn test_recv_preserves_asserted_credentials() {
        let (m, end) = test_module();
        // An owner module may assert another user's credentials.
        let cred = Credentials {
            userid: 4242,
            rolemask: RoleMask::USER,
        };
        end.outbox
            .push(Message::request("a.b").with_cred(cred))
            .unwrap();
        let got = m.recvmsg().unwrap();
        assert_eq!(got.cred.userid, 4242);
        assert_eq!(got.cred.rolemask, RoleMask::USER);
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let (m, mut end) = test_module();
        let req = Message::request("echo.run").with_matchtag(9);
        m.sendmsg(&req).await.unwrap();

        // Module side: receive, respond.
        let seen = end.rx.try_recv().unwrap();
        assert_eq!(seen.route.last(), Some("parent-uuid"));
        assert_eq!(seen.topic, "echo.run");
        end.outbox.push(Message::response_to(&seen)).unwrap();

        // Broker side: the delivery hop is consumed on receive.
        let resp = m.recvmsg().unwrap();
        assert_eq!(resp.matchtag, 9);
        assert!(resp.route.is_empty());
    }

    #[tokio::test]
    async fn test_module_request_carries_module_identity() {
        let (m, end) = test_module();
        end.outbox
            .push(Message::request("broker.insmod").with_matchtag(1))
            .unwrap();
        let got = m.recvmsg().unwrap();
        assert_eq!(got.route.last(), Some(m.get_uuid()));
        // Responding consumes that hop again on the way back.
        let resp = Message::response_to(&got);
        m.sendmsg(&resp).await.unwrap();
    }

    #[tokio::test]
    async fn test_muted_module_rejects_all_but_status_response() {
        let (m, _end) = test_module();
        m.mute();
        let err = m
            .sendmsg(&Message::request("x.y").with_matchtag(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::NotSupported(_)));
        assert!(matches!(
            m.sendmsg(&Message::event("x.y")).await,
            Err(ModuleError::NotSupported(_))
        ));

        let mut status_req = Message::request(MODULE_STATUS_TOPIC).with_matchtag(2);
        status_req.route.push(m.get_uuid().to_string());
        let resp = Message::response_to(&status_req);
        m.sendmsg(&resp).await.unwrap();
    }

    #[tokio::test]
    async fn test_event_cast_prefix_matching() {
        let (m, mut end) = test_module();
        m.subscribe("job.").unwrap();
        m.subscribe("log.").unwrap();

        m.event_cast(&Message::event("job.state.RUN")).await.unwrap();
        assert_eq!(end.rx.try_recv().unwrap().topic, "job.state.RUN");

        m.event_cast(&Message::event("kvs.commit")).await.unwrap();
        assert!(end.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_first_match_only() {
        let (m, mut end) = test_module();
        m.subscribe("job.").unwrap();
        m.subscribe("job.").unwrap();
        m.unsubscribe("job.");
        m.event_cast(&Message::event("job.x")).await.unwrap();
        assert!(end.rx.try_recv().is_ok());
        m.unsubscribe("job.");
        m.unsubscribe("job."); // not present: no-op
        m.event_cast(&Message::event("job.x")).await.unwrap();
        assert!(end.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_transitions_and_callback() {
        let (m, _end) = test_module();
        assert_eq!(m.get_status(), ModuleStatus::Init);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        m.set_status_cb(Arc::new(move |prev, cur| {
            seen2.lock().unwrap().push((prev, cur));
        }));
        m.set_status(ModuleStatus::Running);
        m.set_status(ModuleStatus::Finalizing);
        m.set_status(ModuleStatus::Exited);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ModuleStatus::Init, ModuleStatus::Running),
                (ModuleStatus::Running, ModuleStatus::Finalizing),
                (ModuleStatus::Finalizing, ModuleStatus::Exited),
            ]
        );
    }

    #[tokio::test]
    #[should_panic(expected = "illegal state transition")]
    async fn test_exited_is_terminal() {
        let (m, _end) = test_module();
        m.set_status(ModuleStatus::Exited);
        m.set_status(ModuleStatus::Running);
    }

    #[tokio::test]
    async fn test_insmod_slot_replaces_prior() {
        let (m, _end) = test_module();
        m.push_insmod(Message::request("broker.insmod").with_matchtag(1));
        m.push_insmod(Message::request("broker.insmod").with_matchtag(2));
        assert_eq!(m.pop_insmod().unwrap().matchtag, 2);
        assert!(m.pop_insmod().is_none());
    }

    #[tokio::test]
    async fn test_rmmod_queue_is_fifo() {
        let (m, _end) = test_module();
        m.push_rmmod(Message::request("broker.rmmod").with_matchtag(1));
        m.push_rmmod(Message::request("broker.rmmod").with_matchtag(2));
        assert_eq!(m.pop_rmmod().unwrap().matchtag, 1);
        assert_eq!(m.pop_rmmod().unwrap().matchtag, 2);
        assert!(m.pop_rmmod().is_none());
    }

    #[tokio::test]
    async fn test_status_codes_are_fixed() {
        assert_eq!(ModuleStatus::Init.as_code(), 0);
        assert_eq!(ModuleStatus::Running.as_code(), 1);
        assert_eq!(ModuleStatus::Finalizing.as_code(), 2);
        assert_eq!(ModuleStatus::Exited.as_code(), 3);
        assert_eq!(ModuleStatus::from_code(2), Some(ModuleStatus::Finalizing));
        assert_eq!(ModuleStatus::from_code(7), None);
    }

    #[tokio::test]
    async fn test_cancel_without_thread_succeeds() {
        let (m, _end) = test_module();
        m.cancel().unwrap();
        m.cancel().unwrap();
    }

    #[tokio::test]
    async fn test_create_native_validates_arguments() {
        let attrs = Arc::new(AttrTable::new());
        let conf = Arc::new(BrokerConfig::default());
        assert!(matches!(
            Module::create_native("", "m", 0, attrs.clone(), conf.clone(), vec![], Box::new(|_, _| Ok(()))),
            Err(ModuleError::Invalid(_))
        ));
        assert!(matches!(
            Module::create_native("p", "", 0, attrs, conf, vec![], Box::new(|_, _| Ok(()))),
            Err(ModuleError::Invalid(_))
        ));
    }
}
