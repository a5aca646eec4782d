//! Tests for proxy service registration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mbroker::module::service::{ServiceRegistry, ServiceUpstream};
use mbroker::module::{Message, ModuleError};
use tokio::time::timeout;

/// Upstream double that records calls and can be made to fail or stall.
struct MockUpstream {
    calls: Mutex<Vec<String>>,
    fail_register: AtomicBool,
    stall_register: AtomicBool,
    stall_unregister: AtomicBool,
}

impl MockUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_register: AtomicBool::new(false),
            stall_register: AtomicBool::new(false),
            stall_unregister: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count_call(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }
}

#[async_trait]
impl ServiceUpstream for MockUpstream {
    async fn register(&self, name: &str) -> Result<(), ModuleError> {
        self.calls.lock().unwrap().push(format!("register {name}"));
        if self.stall_register.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(ModuleError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn unregister(&self, name: &str) -> Result<(), ModuleError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("unregister {name}"));
        if self.stall_unregister.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Collects respond callback invocations as (topic, uuid, errnum).
fn respond_recorder(
    registry: &ServiceRegistry,
) -> Arc<Mutex<Vec<(String, String, i32)>>> {
    let responses = Arc::new(Mutex::new(Vec::new()));
    let responses2 = responses.clone();
    registry.set_respond(Arc::new(move |msg, uuid, errnum| {
        responses2
            .lock()
            .unwrap()
            .push((msg.topic.clone(), uuid.to_string(), errnum));
    }));
    responses
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Poll until the registry does (or does not) know `name`.
async fn wait_for_owner(registry: &ServiceRegistry, name: &str, present: bool) {
    timeout(Duration::from_secs(5), async {
        while registry.lookup_owner(name).await.is_some() != present {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("service {name} never reached present={present}"))
}

#[tokio::test]
async fn test_add_registers_upstream_and_responds() {
    let upstream = MockUpstream::new();
    let registry = ServiceRegistry::new(upstream.clone());
    let responses = respond_recorder(&registry);

    registry
        .add("kvs", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    wait_for_owner(&registry, "kvs", true).await;

    assert_eq!(upstream.calls(), vec!["register kvs"]);
    wait_until(|| !responses.lock().unwrap().is_empty()).await;
    let responses = responses.lock().unwrap();
    assert_eq!(responses[0], ("service.add".to_string(), "uuid-1".to_string(), 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_registration_rejected() {
    let upstream = MockUpstream::new();
    let registry = ServiceRegistry::new(upstream);

    registry
        .add("kvs", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    let err = registry
        .add("kvs", "uuid-2", Message::request("service.add"))
        .await
        .unwrap_err();
    assert!(matches!(err, ModuleError::AlreadyExists(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_registration_removes_entry() {
    let upstream = MockUpstream::new();
    upstream.fail_register.store(true, Ordering::SeqCst);
    let registry = ServiceRegistry::new(upstream.clone());
    let responses = respond_recorder(&registry);

    registry
        .add("kvs", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();

    wait_until(|| !responses.lock().unwrap().is_empty()).await;
    let got = responses.lock().unwrap()[0].clone();
    assert_eq!(got.1, "uuid-1");
    assert_eq!(got.2, libc::ENOENT);
    wait_for_owner(&registry, "kvs", false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_requires_matching_owner() {
    let upstream = MockUpstream::new();
    let registry = ServiceRegistry::new(upstream);

    registry
        .add("kvs", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    wait_for_owner(&registry, "kvs", true).await;

    let err = registry
        .remove("kvs", "uuid-2", Message::request("service.remove"))
        .await
        .unwrap_err();
    assert!(matches!(err, ModuleError::NotFound(_)));

    let err = registry
        .remove("nope", "uuid-1", Message::request("service.remove"))
        .await
        .unwrap_err();
    assert!(matches!(err, ModuleError::NotFound(_)));

    registry
        .remove("kvs", "uuid-1", Message::request("service.remove"))
        .await
        .unwrap();
    wait_for_owner(&registry, "kvs", false).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_responds_with_result() {
    let upstream = MockUpstream::new();
    let registry = ServiceRegistry::new(upstream.clone());
    let responses = respond_recorder(&registry);

    registry
        .add("job", "uuid-9", Message::request("service.add"))
        .await
        .unwrap();
    wait_for_owner(&registry, "job", true).await;
    registry
        .remove("job", "uuid-9", Message::request("service.remove"))
        .await
        .unwrap();

    wait_until(|| responses.lock().unwrap().len() == 2).await;
    let responses = responses.lock().unwrap();
    assert_eq!(responses[1].0, "service.remove");
    assert_eq!(responses[1].2, 0);
    assert_eq!(
        upstream.calls(),
        vec!["register job", "unregister job"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_match_request_by_topic_prefix() {
    let upstream = MockUpstream::new();
    let registry = ServiceRegistry::new(upstream);

    registry
        .add("kvs", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    registry
        .add("job", "uuid-2", Message::request("service.add"))
        .await
        .unwrap();

    let msg = Message::request("kvs.get").with_matchtag(1);
    assert_eq!(registry.match_request(&msg).await.as_deref(), Some("uuid-1"));
    let msg = Message::request("job.submit").with_matchtag(2);
    assert_eq!(registry.match_request(&msg).await.as_deref(), Some("uuid-2"));
    let msg = Message::request("mon.poll").with_matchtag(3);
    assert!(registry.match_request(&msg).await.is_none());
    // Events never match services.
    let msg = Message::event("kvs.get");
    assert!(registry.match_request(&msg).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_sweeps_owner_services() {
    let upstream = MockUpstream::new();
    let registry = ServiceRegistry::new(upstream.clone());

    registry
        .add("kvs", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    registry
        .add("job", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    registry
        .add("mon", "uuid-2", Message::request("service.add"))
        .await
        .unwrap();
    wait_for_owner(&registry, "mon", true).await;

    registry.disconnect("uuid-1").await;
    assert!(registry.lookup_owner("kvs").await.is_none());
    assert!(registry.lookup_owner("job").await.is_none());
    assert!(registry.lookup_owner("mon").await.is_some());

    // Live registrations were unregistered upstream on the sweep.
    wait_until(|| {
        let calls = upstream.calls();
        calls.contains(&"unregister kvs".to_string())
            && calls.contains(&"unregister job".to_string())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_racing_inflight_remove() {
    let upstream = MockUpstream::new();
    upstream.stall_unregister.store(true, Ordering::SeqCst);
    let registry = ServiceRegistry::new(upstream.clone());
    let responses = respond_recorder(&registry);

    registry
        .add("kvs", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    // The registration is live once its add request was answered.
    wait_until(|| !responses.lock().unwrap().is_empty()).await;
    registry
        .remove("kvs", "uuid-1", Message::request("service.remove"))
        .await
        .unwrap();
    // The removal's unregister is now stuck upstream.
    wait_until(|| upstream.count_call("unregister kvs") == 1).await;

    // The owner disconnects while its remove is still in flight, and a
    // different module claims the name.
    registry.disconnect("uuid-1").await;
    assert!(registry.lookup_owner("kvs").await.is_none());
    registry
        .add("kvs", "uuid-2", Message::request("service.add"))
        .await
        .unwrap();
    wait_until(|| upstream.count_call("register kvs") == 2).await;

    // Give any stale removal completion a chance to run; the new owner's
    // registration must survive it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.lookup_owner("kvs").await.as_deref(), Some("uuid-2"));

    // The sweep must not have stacked a second unregister on top of the
    // one the pending remove already sent.
    assert_eq!(upstream.count_call("unregister kvs"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pending_add_gets_open_loop_unregister() {
    let upstream = MockUpstream::new();
    upstream.stall_register.store(true, Ordering::SeqCst);
    let registry = ServiceRegistry::new(upstream.clone());

    registry
        .add("slow", "uuid-1", Message::request("service.add"))
        .await
        .unwrap();
    // Registration is stuck upstream; tearing down must still clean up.
    registry.destroy().await;

    wait_until(|| upstream.calls().contains(&"unregister slow".to_string())).await;
    assert_eq!(registry.count().await, 0);
}
