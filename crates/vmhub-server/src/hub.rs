//! The dispatch hub — per-message entry points, middleware execution,
//! failure classification, and the response gateway.
//!
//! Entry points are the last line of defense: they classify every failure
//! kind and return `()`, so nothing propagates out to terminate the
//! connection or the dispatch runtime.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};
use vmhub_protocol::{HubContext, HubError, Operations, Principal, SerializedException, VmArg};
use vmhub_transport::{ResponseSender, VmHandler};

use crate::middleware::MiddlewarePipeline;
use crate::principal::PrincipalAccessor;
use crate::registry::{ControllerDyn, ControllerRegistry};

/// The hub: receives client operations from the transport, resolves the
/// per-connection controller, runs the middleware pipeline, and pushes
/// responses back through the transport.
pub struct VmHub {
    registry: Arc<ControllerRegistry>,
    pipeline: MiddlewarePipeline,
    principal_accessor: Arc<dyn PrincipalAccessor>,
    sender: Arc<dyn ResponseSender>,
}

impl VmHub {
    /// Build the hub and install the response gateway as the registry's
    /// delegate, wiring controllers' own asynchronous push path.
    pub fn new(
        registry: Arc<ControllerRegistry>,
        pipeline: MiddlewarePipeline,
        principal_accessor: Arc<dyn PrincipalAccessor>,
        sender: Arc<dyn ResponseSender>,
    ) -> Arc<Self> {
        let hub = Arc::new(Self {
            registry,
            pipeline,
            principal_accessor,
            sender,
        });

        // The registry holds the delegate for the hub's lifetime; a weak
        // back-reference keeps the two from owning each other.
        let weak = Arc::downgrade(&hub);
        hub.registry
            .set_response_delegate(Arc::new(move |connection_id, vm_id, vm_data| {
                if let Some(hub) = weak.upgrade() {
                    hub.response_vm(connection_id, vm_id, vm_data);
                }
            }));

        hub
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    // ── Response gateway ────────────────────────────────────────────────

    /// Deliver serialized view-model data to exactly one client,
    /// fire-and-forget. Resolving the registry entry first doubles as a
    /// liveness touch: it extends the connection's idle window even when no
    /// controller work is needed, and harmlessly creates an orphaned entry
    /// when the connection is already gone. The send is attempted
    /// regardless.
    pub fn response_vm(&self, connection_id: &str, vm_id: &str, vm_data: String) {
        debug!("Response_VM: {vm_id} {connection_id} {vm_data}");
        let _ = self.registry.get_instance(connection_id);
        self.sender.send(connection_id, vm_id, vm_data);
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Resolve the connection's controller and overwrite its principal with
    /// the identity resolved for this dispatch.
    fn resolve_controller(
        &self,
        connection_id: &str,
        principal: Principal,
    ) -> Arc<dyn ControllerDyn> {
        let controller = self.registry.get_instance(connection_id);
        controller.set_principal_dyn(principal);
        controller
    }

    /// Run the interceptor chain. On rejection or fault, push the failing
    /// kind's category and message to the originating client first, then
    /// convert to `Cancelled` so the entry point logs it and goes no
    /// further.
    async fn run_middlewares(&self, context: &HubContext) -> Result<(), HubError> {
        if let Err(err) = self.pipeline.run(context).await {
            self.response_vm(
                &context.connection_id,
                &context.vm_id,
                SerializedException::from(&err).to_json(),
            );
            return Err(HubError::cancelled(format!(
                "interceptor rejected {} for {}: {err}",
                context.operation, context.vm_id
            )));
        }
        Ok(())
    }

    /// Failure switch shared by the request and update entry points.
    fn settle(&self, connection_id: &str, vm_id: &str, result: Result<(), HubError>) {
        match result {
            Ok(()) => {}
            // Cooperative cancellation — the client already received its
            // error push from the pipeline.
            Err(HubError::Cancelled(message)) => debug!("{message}"),
            Err(err @ HubError::Unauthorized(_)) => {
                self.response_vm(connection_id, vm_id, SerializedException::from(&err).to_json());
            }
            Err(err) => {
                error!("Unexpected failure dispatching {vm_id} on {connection_id}: {err}");
            }
        }
    }

    async fn dispatch_request(&self, context: &HubContext, arg: VmArg) -> Result<(), HubError> {
        self.run_middlewares(context).await?;

        debug!("Request_VM: {} {}", context.vm_id, context.connection_id);
        let controller = self.resolve_controller(&context.connection_id, context.principal.clone());
        controller
            .on_request_vm_dyn(&context.connection_id, &context.vm_id, arg)
            .await
    }

    async fn dispatch_update(
        &self,
        context: &HubContext,
        data: HashMap<String, Value>,
    ) -> Result<(), HubError> {
        self.run_middlewares(context).await?;

        debug!(
            "Update_VM: {} {} {}",
            context.vm_id,
            context.connection_id,
            serde_json::to_string(&data).unwrap_or_default()
        );
        let controller = self.resolve_controller(&context.connection_id, context.principal.clone());
        controller
            .on_update_vm_dyn(&context.connection_id, &context.vm_id, data)
            .await
    }
}

impl VmHandler for VmHub {
    /// Client requests view model data. The argument envelope is decoded
    /// once here; everything downstream sees the tagged form.
    async fn request_vm(&self, connection_id: &str, vm_id: &str, vm_arg: Option<Value>) {
        let arg = VmArg::decode(vm_arg);
        let context = HubContext {
            connection_id: connection_id.to_string(),
            operation: Operations::REQUEST_VM,
            vm_id: vm_id.to_string(),
            payload: arg.value().cloned(),
            headers: arg.headers().cloned(),
            principal: self.principal_accessor.principal(connection_id),
        };

        let result = self.dispatch_request(&context, arg).await;
        self.settle(connection_id, vm_id, result);
    }

    /// Client updates view model properties, keyed by dotted path.
    async fn update_vm(&self, connection_id: &str, vm_id: &str, vm_data: HashMap<String, Value>) {
        let context = HubContext {
            connection_id: connection_id.to_string(),
            operation: Operations::UPDATE_VM,
            vm_id: vm_id.to_string(),
            payload: serde_json::to_value(&vm_data).ok(),
            headers: None,
            principal: self.principal_accessor.principal(connection_id),
        };

        let result = self.dispatch_update(&context, vm_data).await;
        self.settle(connection_id, vm_id, result);
    }

    /// Client discards a view model. Disposal is not interceptable; any
    /// failure is a programming error, logged and never surfaced.
    async fn dispose_vm(&self, connection_id: &str, vm_id: &str) {
        let principal = self.principal_accessor.principal(connection_id);
        let controller = self.resolve_controller(connection_id, principal);
        if let Err(err) = controller.on_dispose_vm_dyn(connection_id, vm_id).await {
            error!("Unexpected failure disposing {vm_id} on {connection_id}: {err}");
        }
    }

    /// The transport reports the connection ended. The controller is
    /// removed; the graceful flag is informational only.
    fn connection_closed(&self, connection_id: &str, graceful: bool) {
        let existed = self.registry.remove(connection_id);
        debug!("Connection closed: {connection_id} (graceful: {graceful}, controller: {existed})");
    }
}
