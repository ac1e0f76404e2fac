//! Connection registry — per-connection controller instances.
//!
//! Maps a connection id to a lazily-created controller scoped 1:1 to that
//! connection. At most one controller exists per live connection id; the
//! entry API creates under the shard lock, so concurrent first accesses for
//! the same unseen key still construct exactly one instance. Sharding keeps
//! unrelated connections from serializing on a global lock.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use vmhub_protocol::{HubError, Principal, VmArg};

/// Outbound delegate installed by the hub; controllers push serialized
/// view-model data through it at arbitrary times.
pub type ResponseDelegate = Arc<dyn Fn(&str, &str, String) + Send + Sync>;

/// A stateful per-connection view-model controller.
///
/// Created on first registry access for a connection id and dropped when
/// the connection ends. Operations receive the originating connection id
/// even though the instance is connection-scoped, so multicast-capable
/// implementations can address other connections through their responder.
pub trait Controller: Send + Sync {
    /// Handle a view-model request. `arg` is the decoded initialization
    /// argument, carrying out-of-band headers when the client sent the
    /// envelope form.
    fn on_request_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        arg: VmArg,
    ) -> impl std::future::Future<Output = Result<(), HubError>> + Send;

    /// Apply property updates, keyed by dotted property path.
    fn on_update_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        data: HashMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<(), HubError>> + Send;

    /// Discard a view model the client no longer uses.
    fn on_dispose_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
    ) -> impl std::future::Future<Output = Result<(), HubError>> + Send;

    /// Overwrite the caller identity. Invoked at every dispatch with the
    /// freshly-resolved principal.
    fn set_principal(&self, principal: Principal);
}

/// Object-safe wrapper for the Controller trait.
pub trait ControllerDyn: Send + Sync {
    fn on_request_vm_dyn<'a>(
        &'a self,
        connection_id: &'a str,
        vm_id: &'a str,
        arg: VmArg,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>;

    fn on_update_vm_dyn<'a>(
        &'a self,
        connection_id: &'a str,
        vm_id: &'a str,
        data: HashMap<String, Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>;

    fn on_dispose_vm_dyn<'a>(
        &'a self,
        connection_id: &'a str,
        vm_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>;

    fn set_principal_dyn(&self, principal: Principal);
}

impl<T: Controller> ControllerDyn for T {
    fn on_request_vm_dyn<'a>(
        &'a self,
        connection_id: &'a str,
        vm_id: &'a str,
        arg: VmArg,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>
    {
        Box::pin(self.on_request_vm(connection_id, vm_id, arg))
    }

    fn on_update_vm_dyn<'a>(
        &'a self,
        connection_id: &'a str,
        vm_id: &'a str,
        data: HashMap<String, Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>
    {
        Box::pin(self.on_update_vm(connection_id, vm_id, data))
    }

    fn on_dispose_vm_dyn<'a>(
        &'a self,
        connection_id: &'a str,
        vm_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>
    {
        Box::pin(self.on_dispose_vm(connection_id, vm_id))
    }

    fn set_principal_dyn(&self, principal: Principal) {
        self.set_principal(principal);
    }
}

/// Push handle given to controllers at creation. Forwards through the
/// registry's currently-set response delegate; a no-op until the hub
/// installs one.
#[derive(Clone)]
pub struct VmResponder {
    delegate: Arc<RwLock<Option<ResponseDelegate>>>,
}

impl VmResponder {
    /// Deliver serialized view-model data to a connection, fire-and-forget.
    pub fn respond(&self, connection_id: &str, vm_id: &str, vm_data: String) {
        if let Some(delegate) = self.delegate.read().as_ref() {
            delegate(connection_id, vm_id, vm_data);
        }
    }
}

/// Provides controller instances keyed by connection id.
pub struct ControllerRegistry {
    controllers: DashMap<String, Arc<dyn ControllerDyn>>,
    factory: Box<dyn Fn(&str, VmResponder) -> Arc<dyn ControllerDyn> + Send + Sync>,
    delegate: Arc<RwLock<Option<ResponseDelegate>>>,
}

impl ControllerRegistry {
    /// Create a registry over a controller factory. The factory receives
    /// the connection id and a [`VmResponder`] wired to the registry's
    /// response delegate.
    pub fn new<C, F>(factory: F) -> Self
    where
        C: Controller + 'static,
        F: Fn(&str, VmResponder) -> C + Send + Sync + 'static,
    {
        let factory: Box<dyn Fn(&str, VmResponder) -> Arc<dyn ControllerDyn> + Send + Sync> =
            Box::new(move |id, responder| Arc::new(factory(id, responder)));

        Self {
            controllers: DashMap::new(),
            factory,
            delegate: Arc::new(RwLock::new(None)),
        }
    }

    /// Return the controller for `key`, creating and storing one if the key
    /// is unseen. Also called from the outbound push path purely to extend
    /// a connection's liveness window — creation is cheap and harmless even
    /// when the underlying connection is already gone.
    pub fn get_instance(&self, key: &str) -> Arc<dyn ControllerDyn> {
        self.controllers
            .entry(key.to_string())
            .or_insert_with(|| (self.factory)(key, self.responder()))
            .value()
            .clone()
    }

    /// Delete the entry for `key`, returning whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.controllers.remove(key).is_some()
    }

    /// Install the outbound delegate controllers push through. Overwrites
    /// any previous delegate; existing responders observe the new one.
    pub fn set_response_delegate(&self, delegate: ResponseDelegate) {
        *self.delegate.write() = Some(delegate);
    }

    /// A push handle bound to this registry's delegate slot.
    pub fn responder(&self) -> VmResponder {
        VmResponder {
            delegate: self.delegate.clone(),
        }
    }

    /// Number of live controller entries.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}
