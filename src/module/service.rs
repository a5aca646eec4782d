//! Proxy service registration
//!
//! The broker offers dynamic service registration to its direct peers. The
//! host maintains its own table of service registrations, manages upstream
//! registration on behalf of modules, and matches request messages to the
//! owning module. Registrations are unique by name; removal is only valid
//! for the registering owner.
//!
//! Teardown guarantee: when the registry is destroyed (or a module
//! disconnects) while a service add or remove is still pending upstream,
//! an open-loop unregister is sent so no stale state is leaked upstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::module::error::ModuleError;
use crate::module::protocol::{Message, MessageType};

/// Upstream registrar the registry acts against.
#[async_trait]
pub trait ServiceUpstream: Send + Sync {
    async fn register(&self, name: &str) -> Result<(), ModuleError>;
    async fn unregister(&self, name: &str) -> Result<(), ModuleError>;
}

/// Invoked when a pending add/remove completes: `(request, owner uuid,
/// errnum)` with errnum 0 on success.
pub type RespondCallback = Arc<dyn Fn(&Message, &str, i32) + Send + Sync>;

struct ServiceEntry {
    uuid: String,
    /// Topic prefix owned by this service (`<name>.`).
    glob: String,
    add_request: Option<Message>,
    remove_request: Option<Message>,
    live: bool,
    add_pending: bool,
    remove_pending: bool,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ServiceEntry {
    /// True when upstream state may exist that nobody will clean up. A
    /// pending remove already carries its own unregister, so it must not
    /// trigger a second one.
    fn needs_unregister(&self) -> bool {
        (!self.live && self.add_pending) || (self.live && !self.remove_pending)
    }
}

struct RegistryInner {
    upstream: Arc<dyn ServiceUpstream>,
    services: tokio::sync::Mutex<HashMap<String, ServiceEntry>>,
    respond_cb: Mutex<Option<RespondCallback>>,
}

impl RegistryInner {
    fn respond(&self, request: Option<&Message>, uuid: &str, errnum: i32) {
        let cb = self.respond_cb.lock().unwrap().clone();
        if let (Some(cb), Some(request)) = (cb, request) {
            cb(request, uuid, errnum);
        }
    }
}

/// Service registration table for one broker.
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new(upstream: Arc<dyn ServiceUpstream>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                upstream,
                services: tokio::sync::Mutex::new(HashMap::new()),
                respond_cb: Mutex::new(None),
            }),
        }
    }

    pub fn set_respond(&self, cb: RespondCallback) {
        *self.inner.respond_cb.lock().unwrap() = Some(cb);
    }

    /// Register `name` on behalf of the module identified by `uuid`.
    /// `msg` is the originating request; the respond callback fires with
    /// it once the upstream registration settles.
    pub async fn add(&self, name: &str, uuid: &str, msg: Message) -> Result<(), ModuleError> {
        if name.is_empty() || uuid.is_empty() {
            return Err(ModuleError::Invalid("empty service name or uuid".to_string()));
        }
        let mut services = self.inner.services.lock().await;
        if services.contains_key(name) {
            return Err(ModuleError::AlreadyExists(name.to_string()));
        }

        let inner = Arc::clone(&self.inner);
        let task_name = name.to_string();
        let task_uuid = uuid.to_string();
        let task = tokio::spawn(async move {
            let errnum = match inner.upstream.register(&task_name).await {
                Ok(()) => 0,
                Err(e) => e.as_errno(),
            };
            let request = {
                let mut services = inner.services.lock().await;
                let mut request = None;
                let mut drop_entry = false;
                // Gate on the owner uuid: a disconnect sweep may have
                // replaced this entry with a new owner's registration.
                if let Some(entry) = services.get_mut(&task_name) {
                    if entry.uuid == task_uuid {
                        entry.add_pending = false;
                        request = entry.add_request.take();
                        if errnum == 0 {
                            entry.live = true;
                        } else {
                            drop_entry = true;
                        }
                    }
                }
                if drop_entry {
                    services.remove(&task_name);
                }
                request
            };
            inner.respond(request.as_ref(), &task_uuid, errnum);
        });

        services.insert(
            name.to_string(),
            ServiceEntry {
                uuid: uuid.to_string(),
                glob: format!("{name}."),
                add_request: Some(msg),
                remove_request: None,
                live: false,
                add_pending: true,
                remove_pending: false,
                task: Some(task),
            },
        );
        Ok(())
    }

    /// Unregister `name`. Fails with not-found when the service does not
    /// exist, is owned by a different uuid, or already has a remove
    /// pending.
    pub async fn remove(&self, name: &str, uuid: &str, msg: Message) -> Result<(), ModuleError> {
        let mut services = self.inner.services.lock().await;
        match services.get_mut(name) {
            Some(entry) if entry.uuid == uuid && !entry.remove_pending => {
                entry.remove_pending = true;
                entry.remove_request = Some(msg);
            }
            _ => return Err(ModuleError::NotFound(name.to_string())),
        }

        let inner = Arc::clone(&self.inner);
        let task_name = name.to_string();
        let task_uuid = uuid.to_string();
        let task = tokio::spawn(async move {
            let errnum = match inner.upstream.unregister(&task_name).await {
                Ok(()) => 0,
                Err(e) => e.as_errno(),
            };
            let request = {
                let mut services = inner.services.lock().await;
                let mut request = None;
                let mut drop_entry = false;
                // Gate on the owner uuid: a disconnect sweep may have
                // reaped this entry and a new owner may hold the name now;
                // that entry must be left alone.
                if let Some(entry) = services.get_mut(&task_name) {
                    if entry.uuid == task_uuid {
                        request = entry.remove_request.take();
                        drop_entry = true;
                    }
                }
                if drop_entry {
                    services.remove(&task_name);
                }
                request
            };
            inner.respond(request.as_ref(), &task_uuid, errnum);
        });
        if let Some(entry) = services.get_mut(name) {
            entry.task = Some(task);
        }
        Ok(())
    }

    /// Match a request message to the owning module's uuid.
    pub async fn match_request(&self, msg: &Message) -> Option<String> {
        if msg.msg_type != MessageType::Request {
            return None;
        }
        let services = self.inner.services.lock().await;
        services
            .values()
            .find(|entry| msg.topic.starts_with(&entry.glob))
            .map(|entry| entry.uuid.clone())
    }

    /// Drop every registration owned by `uuid`, unregistering upstream
    /// where needed.
    pub async fn disconnect(&self, uuid: &str) {
        let mut services = self.inner.services.lock().await;
        let names: Vec<String> = services
            .iter()
            .filter(|(_, entry)| entry.uuid == uuid)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Some(entry) = services.remove(&name) {
                debug!("dropping service {name} on disconnect of {uuid}");
                self.reap_entry(name, entry);
            }
        }
    }

    /// Tear the whole table down, unregistering upstream where needed.
    pub async fn destroy(&self) {
        let mut services = self.inner.services.lock().await;
        for (name, entry) in services.drain() {
            self.reap_entry(name, entry);
        }
    }

    fn reap_entry(&self, name: String, mut entry: ServiceEntry) {
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        if entry.needs_unregister() {
            // Open loop: nobody is waiting on this, but the upstream
            // registration must not leak.
            let upstream = Arc::clone(&self.inner.upstream);
            tokio::spawn(async move {
                if let Err(e) = upstream.unregister(&name).await {
                    warn!("open-loop unregister of {name} failed: {e}");
                }
            });
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.services.lock().await.len()
    }

    pub async fn lookup_owner(&self, name: &str) -> Option<String> {
        self.inner
            .services
            .lock()
            .await
            .get(name)
            .map(|entry| entry.uuid.clone())
    }
}
