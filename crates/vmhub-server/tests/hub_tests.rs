//! Hub core tests — registry semantics, pipeline ordering and
//! short-circuiting, dispatch failure classification, and the response
//! gateway's liveness touch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use vmhub_protocol::{HubContext, HubError, Operations, Principal, VmArg};
use vmhub_server::{
    AnonymousPrincipal, Controller, ControllerRegistry, Middleware, MiddlewarePipeline, VmHub,
};
use vmhub_transport::{ResponseSender, VmHandler};

// ─────────────────────────────────────────────────────────────────────────
// Test doubles
// ─────────────────────────────────────────────────────────────────────────

/// Records every outbound push instead of sending it anywhere.
#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingSender {
    fn pushes(&self) -> Vec<(String, String, String)> {
        self.sent.lock().clone()
    }
}

impl ResponseSender for RecordingSender {
    fn send(&self, connection_id: &str, vm_id: &str, vm_data: String) {
        self.sent
            .lock()
            .push((connection_id.to_string(), vm_id.to_string(), vm_data));
    }
}

/// Shared log observed by every controller instance a factory creates.
#[derive(Default)]
struct ControllerLog {
    created: AtomicUsize,
    requests: Mutex<Vec<(String, String, Option<Value>, Option<Value>)>>,
    updates: Mutex<Vec<(String, String, HashMap<String, Value>)>>,
    disposals: Mutex<Vec<(String, String)>>,
    principals: Mutex<Vec<Principal>>,
}

impl ControllerLog {
    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

struct RecordingController {
    log: Arc<ControllerLog>,
    /// Error every request/update/dispose operation returns, if set.
    fail_with: Option<HubError>,
    /// Permits acquired (and forgotten) before a request completes; used
    /// to hold one connection's dispatch open while another proceeds.
    gate: Option<Arc<Semaphore>>,
}

impl Controller for RecordingController {
    async fn on_request_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        arg: VmArg,
    ) -> Result<(), HubError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let (value, headers) = arg.into_parts();
        self.log.requests.lock().push((
            connection_id.to_string(),
            vm_id.to_string(),
            value,
            headers,
        ));
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn on_update_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        data: HashMap<String, Value>,
    ) -> Result<(), HubError> {
        self.log
            .updates
            .lock()
            .push((connection_id.to_string(), vm_id.to_string(), data));
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn on_dispose_vm(&self, connection_id: &str, vm_id: &str) -> Result<(), HubError> {
        self.log
            .disposals
            .lock()
            .push((connection_id.to_string(), vm_id.to_string()));
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn set_principal(&self, principal: Principal) {
        self.log.principals.lock().push(principal);
    }
}

struct HubFixture {
    hub: Arc<VmHub>,
    log: Arc<ControllerLog>,
    sender: Arc<RecordingSender>,
}

fn build_hub(pipeline: MiddlewarePipeline, fail_with: Option<HubError>) -> HubFixture {
    build_hub_gated(pipeline, fail_with, None)
}

fn build_hub_gated(
    pipeline: MiddlewarePipeline,
    fail_with: Option<HubError>,
    gate: Option<Arc<Semaphore>>,
) -> HubFixture {
    let log = Arc::new(ControllerLog::default());
    let sender = Arc::new(RecordingSender::default());

    let registry = {
        let log = log.clone();
        Arc::new(ControllerRegistry::new(move |connection_id, _responder| {
            log.created.fetch_add(1, Ordering::SeqCst);
            RecordingController {
                log: log.clone(),
                fail_with: fail_with.clone(),
                // Only the stalled connection's controller waits on the gate.
                gate: if connection_id == "conn-stalled" {
                    gate.clone()
                } else {
                    None
                },
            }
        }))
    };

    let hub = VmHub::new(
        registry,
        pipeline,
        Arc::new(AnonymousPrincipal),
        sender.clone(),
    );

    HubFixture { hub, log, sender }
}

fn exception_fields(vm_data: &str) -> (String, String) {
    let parsed: Value = serde_json::from_str(vm_data).expect("exception payload is JSON");
    (
        parsed["ExceptionType"].as_str().unwrap_or_default().to_string(),
        parsed["Message"].as_str().unwrap_or_default().to_string(),
    )
}

// ─────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_get_instance_creates_exactly_one_controller() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);
    let registry = fixture.hub.registry().clone();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.get_instance("conn-1");
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn remove_returns_true_exactly_once() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);
    let registry = fixture.hub.registry();

    registry.get_instance("conn-1");
    assert!(registry.remove("conn-1"));
    assert!(!registry.remove("conn-1"));
}

#[tokio::test]
async fn get_instance_returns_the_same_controller_on_repeat_access() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);
    let registry = fixture.hub.registry();

    let first = registry.get_instance("conn-1");
    let second = registry.get_instance("conn-1");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn distinct_connections_get_distinct_controllers() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);
    let registry = fixture.hub.registry();

    let a = registry.get_instance("conn-a");
    let b = registry.get_instance("conn-b");
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 2);
}

// ─────────────────────────────────────────────────────────────────────────
// Envelope dispatch
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn envelope_argument_unwraps_into_argument_and_headers() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);

    let arg = json!({
        "$vmArg": {"Name": "World"},
        "$headers": {"Authorization": "Bearer sesame"},
    });
    fixture.hub.request_vm("conn-1", "HelloVM", Some(arg)).await;

    let requests = fixture.log.requests.lock();
    let (conn, vm, value, headers) = requests[0].clone();
    assert_eq!(conn, "conn-1");
    assert_eq!(vm, "HelloVM");
    assert_eq!(value, Some(json!({"Name": "World"})));
    assert_eq!(headers, Some(json!({"Authorization": "Bearer sesame"})));
}

#[tokio::test]
async fn plain_argument_passes_through_whole_with_no_headers() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);

    let arg = json!({"Name": "World", "Count": 3});
    fixture.hub.request_vm("conn-1", "HelloVM", Some(arg.clone())).await;

    let requests = fixture.log.requests.lock();
    let (_, _, value, headers) = requests[0].clone();
    assert_eq!(value, Some(arg));
    assert_eq!(headers, None);
}

// ─────────────────────────────────────────────────────────────────────────
// Middleware pipeline
// ─────────────────────────────────────────────────────────────────────────

struct TrackingMiddleware {
    name: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
    fail_with: Option<HubError>,
}

impl Middleware for TrackingMiddleware {
    async fn invoke(&self, _context: &HubContext) -> Result<(), HubError> {
        self.order.lock().push(self.name);
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[tokio::test]
async fn middlewares_run_in_registration_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = MiddlewarePipeline::new();
    for name in ["first", "second", "third"] {
        let order = order.clone();
        pipeline.add(move || TrackingMiddleware {
            name,
            order: order.clone(),
            fail_with: None,
        });
    }

    let fixture = build_hub(pipeline, None);
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;

    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    assert_eq!(fixture.log.request_count(), 1);
}

#[tokio::test]
async fn first_failure_stops_the_chain() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = MiddlewarePipeline::new();
    {
        let order = order.clone();
        pipeline.add(move || TrackingMiddleware {
            name: "rejecting",
            order: order.clone(),
            fail_with: Some(HubError::unauthorized("no")),
        });
    }
    {
        let order = order.clone();
        pipeline.add(move || TrackingMiddleware {
            name: "unreached",
            order: order.clone(),
            fail_with: None,
        });
    }

    let fixture = build_hub(pipeline, None);
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;

    assert_eq!(*order.lock(), vec!["rejecting"]);
}

#[tokio::test]
async fn each_dispatch_constructs_fresh_interceptors() {
    let instantiations = Arc::new(AtomicUsize::new(0));

    struct CountingMiddleware;
    impl Middleware for CountingMiddleware {
        async fn invoke(&self, _context: &HubContext) -> Result<(), HubError> {
            Ok(())
        }
    }

    let mut pipeline = MiddlewarePipeline::new();
    {
        let instantiations = instantiations.clone();
        pipeline.add(move || {
            instantiations.fetch_add(1, Ordering::SeqCst);
            CountingMiddleware
        });
    }

    let fixture = build_hub(pipeline, None);
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;
    fixture
        .hub
        .update_vm("conn-1", "HelloVM", HashMap::new())
        .await;

    assert_eq!(instantiations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unauthorized_middleware_pushes_one_exception_and_skips_controller() {
    let mut pipeline = MiddlewarePipeline::new();
    pipeline.add(|| TrackingMiddleware {
        name: "deny",
        order: Arc::new(Mutex::new(Vec::new())),
        fail_with: Some(HubError::unauthorized("access denied")),
    });

    let fixture = build_hub(pipeline, None);
    fixture.hub.request_vm("conn-1", "SecretVM", None).await;

    let pushes = fixture.sender.pushes();
    assert_eq!(pushes.len(), 1);
    let (conn, vm, vm_data) = &pushes[0];
    assert_eq!(conn, "conn-1");
    assert_eq!(vm, "SecretVM");
    let (exception_type, message) = exception_fields(vm_data);
    assert_eq!(exception_type, "UnauthorizedAccessException");
    assert_eq!(message, "access denied");
    assert_eq!(fixture.log.request_count(), 0);
}

#[tokio::test]
async fn middleware_fault_pushes_its_category_and_does_not_crash() {
    let mut pipeline = MiddlewarePipeline::new();
    pipeline.add(|| TrackingMiddleware {
        name: "broken",
        order: Arc::new(Mutex::new(Vec::new())),
        fail_with: Some(HubError::fault_with_kind("RateLimitExceeded", "slow down")),
    });

    let fixture = build_hub(pipeline, None);
    // Entry points absorb the failure; reaching the next line is the no-crash assertion.
    fixture.hub.update_vm("conn-1", "BusyVM", HashMap::new()).await;

    let pushes = fixture.sender.pushes();
    assert_eq!(pushes.len(), 1);
    let (exception_type, message) = exception_fields(&pushes[0].2);
    assert_eq!(exception_type, "RateLimitExceeded");
    assert_eq!(message, "slow down");
    assert!(fixture.log.updates.lock().is_empty());
}

#[tokio::test]
async fn pipeline_rejection_leaves_the_registry_entry_alone() {
    struct DenyUpdates;
    impl Middleware for DenyUpdates {
        async fn invoke(&self, context: &HubContext) -> Result<(), HubError> {
            if context.operation == Operations::UPDATE_VM {
                return Err(HubError::unauthorized("updates are read-only here"));
            }
            Ok(())
        }
    }

    let mut pipeline = MiddlewarePipeline::new();
    pipeline.add(|| DenyUpdates);

    let fixture = build_hub(pipeline, None);
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 1);

    fixture
        .hub
        .update_vm("conn-1", "HelloVM", HashMap::from([("A".into(), json!(1))]))
        .await;

    // The rejection cancelled the update only — the controller survives.
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.hub.registry().len(), 1);
    assert!(fixture.log.updates.lock().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────
// Dispatch failure classification
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn controller_unauthorized_pushes_serialized_exception() {
    let fixture = build_hub(
        MiddlewarePipeline::new(),
        Some(HubError::unauthorized("not yours")),
    );
    fixture.hub.request_vm("conn-1", "OwnedVM", None).await;

    // The controller ran, then its rejection was pushed.
    assert_eq!(fixture.log.request_count(), 1);
    let pushes = fixture.sender.pushes();
    assert_eq!(pushes.len(), 1);
    let (exception_type, message) = exception_fields(&pushes[0].2);
    assert_eq!(exception_type, "UnauthorizedAccessException");
    assert_eq!(message, "not yours");
}

#[tokio::test]
async fn controller_fault_is_logged_not_pushed() {
    let fixture = build_hub(MiddlewarePipeline::new(), Some(HubError::fault("boom")));
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;

    assert_eq!(fixture.log.request_count(), 1);
    assert!(fixture.sender.pushes().is_empty());
}

#[tokio::test]
async fn connection_stays_usable_after_a_fault() {
    let fixture = build_hub(MiddlewarePipeline::new(), Some(HubError::fault("boom")));
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;

    assert_eq!(fixture.log.request_count(), 2);
    // Same controller served both dispatches.
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn principal_is_refreshed_on_every_dispatch() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;
    fixture
        .hub
        .update_vm("conn-1", "HelloVM", HashMap::new())
        .await;
    fixture.hub.dispose_vm("conn-1", "HelloVM").await;

    assert_eq!(fixture.log.principals.lock().len(), 3);
}

// ─────────────────────────────────────────────────────────────────────────
// Disposal
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn dispose_reaches_the_controller_and_bypasses_middleware() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = MiddlewarePipeline::new();
    {
        let order = order.clone();
        pipeline.add(move || TrackingMiddleware {
            name: "observer",
            order: order.clone(),
            fail_with: None,
        });
    }

    let fixture = build_hub(pipeline, None);
    fixture.hub.dispose_vm("conn-1", "HelloVM").await;

    assert_eq!(
        *fixture.log.disposals.lock(),
        vec![("conn-1".to_string(), "HelloVM".to_string())]
    );
    assert!(order.lock().is_empty());
}

#[tokio::test]
async fn dispose_failure_is_swallowed() {
    let fixture = build_hub(MiddlewarePipeline::new(), Some(HubError::fault("boom")));
    fixture.hub.dispose_vm("conn-1", "HelloVM").await;

    assert_eq!(fixture.log.disposals.lock().len(), 1);
    assert!(fixture.sender.pushes().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn requests_on_different_connections_do_not_block_each_other() {
    let gate = Arc::new(Semaphore::new(0));
    let fixture = build_hub_gated(MiddlewarePipeline::new(), None, Some(gate.clone()));

    // Hold one connection's dispatch open inside its controller.
    let hub = fixture.hub.clone();
    let stalled = tokio::spawn(async move {
        hub.request_vm("conn-stalled", "SlowVM", None).await;
    });

    // A different connection must still complete promptly.
    timeout(
        Duration::from_secs(1),
        fixture.hub.request_vm("conn-free", "FastVM", None),
    )
    .await
    .expect("dispatch on an unrelated connection stalled");

    gate.add_permits(1);
    stalled.await.unwrap();
    assert_eq!(fixture.log.request_count(), 2);
}

// ─────────────────────────────────────────────────────────────────────────
// Response gateway
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn response_vm_touches_registry_and_sends() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);
    fixture
        .hub
        .response_vm("conn-1", "HelloVM", r#"{"Greeting":"hi"}"#.to_string());

    // The touch lazily created the entry, and the payload went out as-is.
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 1);
    let pushes = fixture.sender.pushes();
    assert_eq!(
        pushes,
        vec![(
            "conn-1".to_string(),
            "HelloVM".to_string(),
            r#"{"Greeting":"hi"}"#.to_string()
        )]
    );
}

#[tokio::test]
async fn response_vm_after_disconnect_recreates_an_orphan_without_controller_logic() {
    let fixture = build_hub(MiddlewarePipeline::new(), None);
    fixture.hub.request_vm("conn-1", "HelloVM", None).await;
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 1);

    fixture.hub.connection_closed("conn-1", true);
    assert!(fixture.hub.registry().is_empty());

    fixture
        .hub
        .response_vm("conn-1", "HelloVM", "{}".to_string());

    // A fresh orphaned entry exists, but no request/update/dispose ran.
    assert_eq!(fixture.log.created.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.log.request_count(), 1);
    assert!(fixture.log.updates.lock().is_empty());
    assert!(fixture.log.disposals.lock().is_empty());
    assert_eq!(fixture.sender.pushes().len(), 1);
}

#[tokio::test]
async fn controllers_push_through_the_registry_responder() {
    let sender = Arc::new(RecordingSender::default());

    struct PushingController {
        responder: vmhub_server::VmResponder,
    }

    impl Controller for PushingController {
        async fn on_request_vm(
            &self,
            connection_id: &str,
            vm_id: &str,
            _arg: VmArg,
        ) -> Result<(), HubError> {
            self.responder
                .respond(connection_id, vm_id, r#"{"Ready":true}"#.to_string());
            Ok(())
        }

        async fn on_update_vm(
            &self,
            _connection_id: &str,
            _vm_id: &str,
            _data: HashMap<String, Value>,
        ) -> Result<(), HubError> {
            Ok(())
        }

        async fn on_dispose_vm(&self, _connection_id: &str, _vm_id: &str) -> Result<(), HubError> {
            Ok(())
        }

        fn set_principal(&self, _principal: Principal) {}
    }

    let registry = Arc::new(ControllerRegistry::new(move |_id, responder| {
        PushingController { responder }
    }));
    let hub = VmHub::new(
        registry,
        MiddlewarePipeline::new(),
        Arc::new(AnonymousPrincipal),
        sender.clone(),
    );

    hub.request_vm("conn-1", "HelloVM", None).await;

    let pushes = sender.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].1, "HelloVM");
    assert_eq!(pushes[0].2, r#"{"Ready":true}"#);
}
