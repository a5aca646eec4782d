//! Module manager
//!
//! Broker-side collection of all loaded modules. Owns the records, wires
//! each record's reactor watcher into a dispatcher task, and handles the
//! broker services every module relies on:
//!
//! - `broker.module-status` lifecycle reports (the FINALIZING report is
//!   acknowledged after muting, which pauses dispatch to that module);
//! - `event.subscribe` / `event.unsubscribe`;
//! - event fan-out to subscribed modules;
//! - routing of responses and service-registered requests between modules.
//!
//! Anything else is passed to a pluggable request handler, defaulting to
//! an ENOSYS response.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{AttrTable, BrokerConfig};
use crate::module::error::ModuleError;
use crate::module::loader::NativeMainFn;
use crate::module::protocol::{
    Message, MessageType, StatusReport, SubscribeRequest, EVENT_SUBSCRIBE_TOPIC,
    EVENT_UNSUBSCRIBE_TOPIC, MODULE_STATUS_TOPIC,
};
use crate::module::record::{Module, ModuleStatus};
use crate::module::service::ServiceRegistry;

/// Fallback handler for requests the manager does not recognize. Returns
/// the response to deliver, if any.
pub type RequestHandler = Arc<dyn Fn(&Arc<Module>, &Message) -> Option<Message> + Send + Sync>;

/// One lifecycle transition, observable via
/// [`ModuleManager::subscribe_status`].
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub uuid: String,
    pub name: String,
    pub prev: ModuleStatus,
    pub status: ModuleStatus,
}

enum Notice {
    /// A module's channel became readable (or closed).
    Poll(String),
    Status(StatusEvent),
}

struct ManagerInner {
    parent_uuid: String,
    rank: u32,
    attrs: Arc<AttrTable>,
    conf: Arc<BrokerConfig>,
    modules: tokio::sync::Mutex<HashMap<String, Arc<Module>>>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    status_tx: broadcast::Sender<StatusEvent>,
    services: Mutex<Option<Arc<ServiceRegistry>>>,
    request_handler: Mutex<Option<RequestHandler>>,
}

/// Module manager: one per broker.
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ModuleManager {
    /// Create a manager and start its dispatcher task.
    pub fn new(
        parent_uuid: &str,
        rank: u32,
        attrs: Arc<AttrTable>,
        conf: Arc<BrokerConfig>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(64);
        let inner = Arc::new(ManagerInner {
            parent_uuid: parent_uuid.to_string(),
            rank,
            attrs,
            conf,
            modules: tokio::sync::Mutex::new(HashMap::new()),
            notice_tx,
            status_tx,
            services: Mutex::new(None),
            request_handler: Mutex::new(None),
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&inner), notice_rx));
        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Attach the proxy service registration table. Registered services
    /// route requests to their owner module, and a module's services are
    /// released when it exits.
    pub fn set_service_registry(&self, registry: Arc<ServiceRegistry>) {
        *self.inner.services.lock().unwrap() = Some(registry);
    }

    pub fn set_request_handler(&self, handler: RequestHandler) {
        *self.inner.request_handler.lock().unwrap() = Some(handler);
    }

    /// Observe lifecycle transitions of all managed modules.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Load a module artifact and start it.
    pub async fn load(
        &self,
        name: Option<&str>,
        path: &Path,
        args: Vec<String>,
    ) -> Result<Arc<Module>, ModuleError> {
        let path = self.resolve_path(path);
        let module = Module::create(
            &self.inner.parent_uuid,
            name,
            &path,
            self.inner.rank,
            Arc::clone(&self.inner.attrs),
            Arc::clone(&self.inner.conf),
            args,
        )?;
        self.install(module).await
    }

    /// Host a built-in module around a native entry point.
    pub async fn load_native(
        &self,
        name: &str,
        args: Vec<String>,
        main: NativeMainFn,
    ) -> Result<Arc<Module>, ModuleError> {
        let module = Module::create_native(
            &self.inner.parent_uuid,
            name,
            self.inner.rank,
            Arc::clone(&self.inner.attrs),
            Arc::clone(&self.inner.conf),
            args,
            main,
        )?;
        self.install(module).await
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            self.inner.conf.modules_dir.join(path)
        }
    }

    async fn install(&self, module: Arc<Module>) -> Result<Arc<Module>, ModuleError> {
        let mut modules = self.inner.modules.lock().await;
        if modules
            .values()
            .any(|m| m.get_name() == module.get_name())
        {
            return Err(ModuleError::AlreadyExists(module.get_name().to_string()));
        }

        let uuid = module.get_uuid().to_string();
        let name = module.get_name().to_string();

        let tx = self.inner.notice_tx.clone();
        let poll_uuid = uuid.clone();
        module.set_poller_cb(Arc::new(move || {
            let _ = tx.send(Notice::Poll(poll_uuid.clone()));
        }));

        let tx = self.inner.notice_tx.clone();
        let status_uuid = uuid.clone();
        let status_name = name.clone();
        module.set_status_cb(Arc::new(move |prev, status| {
            let _ = tx.send(Notice::Status(StatusEvent {
                uuid: status_uuid.clone(),
                name: status_name.clone(),
                prev,
                status,
            }));
        }));

        module.start()?;
        modules.insert(uuid, Arc::clone(&module));
        info!("module {name} loaded");
        Ok(module)
    }

    pub async fn lookup_by_uuid(&self, uuid: &str) -> Option<Arc<Module>> {
        self.inner.modules.lock().await.get(uuid).cloned()
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.inner
            .modules
            .lock()
            .await
            .values()
            .find(|m| m.get_name() == name)
            .cloned()
    }

    pub async fn lookup_by_path(&self, path: &Path) -> Option<Arc<Module>> {
        self.inner
            .modules
            .lock()
            .await
            .values()
            .find(|m| m.get_path() == path)
            .cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        self.inner
            .modules
            .lock()
            .await
            .values()
            .map(|m| m.get_name().to_string())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.modules.lock().await.len()
    }

    /// Publish a broker-originated event to every subscribed module.
    pub async fn event_publish(&self, msg: &Message) {
        self.inner.fan_out(msg).await;
    }

    /// Gracefully remove one module: polite shutdown request, wait for
    /// EXITED, then destroy the record. Cancels the thread if the module
    /// does not exit within the configured timeout.
    pub async fn remove(&self, name: &str) -> Result<(), ModuleError> {
        let module = self
            .lookup_by_name(name)
            .await
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;
        let mut status_rx = self.subscribe_status();
        if module.get_status() != ModuleStatus::Exited {
            if let Err(e) = module.stop().await {
                debug!("module {name}: shutdown request failed: {e}");
            }
            let timeout = Duration::from_secs(self.inner.conf.shutdown_timeout_secs);
            let uuid = module.get_uuid().to_string();
            let waited = tokio::time::timeout(timeout, async {
                while module.get_status() != ModuleStatus::Exited {
                    match status_rx.recv().await {
                        Ok(event) if event.uuid == uuid && event.status == ModuleStatus::Exited => {
                            break
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
            .await;
            if waited.is_err() {
                warn!("module {name}: shutdown timed out, canceling");
                let _ = module.cancel();
            }
        }
        module.destroy().await;
        self.inner
            .modules
            .lock()
            .await
            .remove(module.get_uuid());
        info!("module {name} unloaded");
        Ok(())
    }

    /// Stop all modules and end the dispatcher.
    pub async fn shutdown(&self) {
        let names = self.list_names().await;
        for name in names {
            if let Err(e) = self.remove(&name).await {
                warn!("error unloading module {name}: {e}");
            }
        }
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.abort();
        }
    }
}

async fn dispatch_loop(inner: Arc<ManagerInner>, mut rx: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Poll(uuid) => {
                let module = inner.modules.lock().await.get(&uuid).cloned();
                let Some(module) = module else { continue };
                inner.drain_module(&module).await;
            }
            Notice::Status(event) => {
                if event.status == ModuleStatus::Exited {
                    let registry = inner.services.lock().unwrap().clone();
                    if let Some(registry) = registry {
                        registry.disconnect(&event.uuid).await;
                    }
                }
                let _ = inner.status_tx.send(event);
            }
        }
    }
}

impl ManagerInner {
    async fn drain_module(&self, module: &Arc<Module>) {
        loop {
            match module.recvmsg() {
                Ok(msg) => self.handle_module_msg(module, msg).await,
                Err(ModuleError::NotReady) => break,
                Err(ModuleError::Disconnected) => {
                    // Channel closed without a terminal status report
                    // (early failure path): mark the module exited.
                    module.advance_status(ModuleStatus::Exited);
                    break;
                }
                Err(e) => {
                    // Malformed frame; drop it, the record stays viable.
                    warn!("module {}: receive error: {e}", module.get_name());
                }
            }
        }
    }

    async fn handle_module_msg(&self, module: &Arc<Module>, msg: Message) {
        match msg.msg_type {
            MessageType::Request => self.handle_request(module, msg).await,
            MessageType::Event => self.fan_out(&msg).await,
            MessageType::Response => self.route_response(msg).await,
            MessageType::Control => {}
        }
    }

    async fn handle_request(&self, module: &Arc<Module>, msg: Message) {
        match msg.topic.as_str() {
            MODULE_STATUS_TOPIC => self.handle_status_report(module, msg).await,
            EVENT_SUBSCRIBE_TOPIC => {
                let errnum = match msg.json_payload::<SubscribeRequest>() {
                    Ok(body) => match module.subscribe(&body.topic) {
                        Ok(()) => 0,
                        Err(e) => e.as_errno(),
                    },
                    Err(e) => e.as_errno(),
                };
                self.respond(module, &msg, errnum).await;
            }
            EVENT_UNSUBSCRIBE_TOPIC => {
                let errnum = match msg.json_payload::<SubscribeRequest>() {
                    Ok(body) => {
                        module.unsubscribe(&body.topic);
                        0
                    }
                    Err(e) => e.as_errno(),
                };
                self.respond(module, &msg, errnum).await;
            }
            _ => {
                // Requests to a registered service route to its owner.
                let registry = self.services.lock().unwrap().clone();
                if let Some(registry) = registry {
                    if let Some(owner) = registry.match_request(&msg).await {
                        if let Some(target) = self.modules.lock().await.get(&owner).cloned() {
                            if let Err(e) = target.sendmsg(&msg).await {
                                debug!(
                                    "forwarding {} to {}: {e}",
                                    msg.topic,
                                    target.get_name()
                                );
                                self.respond(module, &msg, e.as_errno()).await;
                            }
                            return;
                        }
                    }
                }
                let handler = self.request_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    if let Some(resp) = handler(module, &msg) {
                        if let Err(e) = module.sendmsg(&resp).await {
                            debug!("responding to {}: {e}", msg.topic);
                        }
                    }
                    return;
                }
                self.respond(module, &msg, libc::ENOSYS).await;
            }
        }
    }

    async fn handle_status_report(&self, module: &Arc<Module>, msg: Message) {
        let report: StatusReport = match msg.json_payload() {
            Ok(report) => report,
            Err(e) => {
                warn!("module {}: bad status report: {e}", module.get_name());
                self.respond(module, &msg, libc::EPROTO).await;
                return;
            }
        };
        match ModuleStatus::from_code(report.status) {
            Some(ModuleStatus::Running) => {
                module.advance_status(ModuleStatus::Running);
                self.respond(module, &msg, 0).await;
            }
            Some(ModuleStatus::Finalizing) => {
                module.advance_status(ModuleStatus::Finalizing);
                // Stop feeding this module before acknowledging; only the
                // status-report response may pass from here on.
                module.mute();
                self.respond(module, &msg, 0).await;
            }
            Some(ModuleStatus::Exited) => {
                if let Some(errnum) = report.errnum {
                    module.set_errnum(errnum);
                }
                module.advance_status(ModuleStatus::Exited);
                self.respond(module, &msg, 0).await;
            }
            Some(ModuleStatus::Init) | None => {
                self.respond(module, &msg, libc::EPROTO).await;
            }
        }
    }

    /// Answer `msg` if it wants a response.
    async fn respond(&self, module: &Arc<Module>, msg: &Message, errnum: i32) {
        if !msg.wants_response() {
            return;
        }
        let resp = if errnum == 0 {
            Message::response_to(msg)
        } else {
            Message::error_response_to(msg, errnum)
        };
        if let Err(e) = module.sendmsg(&resp).await {
            debug!("module {}: respond {}: {e}", module.get_name(), msg.topic);
        }
    }

    /// Deliver an event to every module with a matching subscription.
    async fn fan_out(&self, msg: &Message) {
        let modules: Vec<Arc<Module>> =
            self.modules.lock().await.values().cloned().collect();
        for module in modules {
            if let Err(e) = module.event_cast(msg).await {
                debug!(
                    "event {} not delivered to {}: {e}",
                    msg.topic,
                    module.get_name()
                );
            }
        }
    }

    /// Deliver a response to the module addressed by its top route hop.
    async fn route_response(&self, msg: Message) {
        let Some(dest) = msg.route.last().map(str::to_string) else {
            debug!("response {} has no route, dropping", msg.topic);
            return;
        };
        let target = self.modules.lock().await.get(&dest).cloned();
        match target {
            Some(target) => {
                if let Err(e) = target.sendmsg(&msg).await {
                    debug!("routing response {} to {dest}: {e}", msg.topic);
                }
            }
            None => debug!("response {} for unknown peer {dest}, dropping", msg.topic),
        }
    }
}

impl Drop for ModuleManager {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.abort();
        }
    }
}
