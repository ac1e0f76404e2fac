//! Request context — the immutable value threaded through the middleware
//! pipeline.
//!
//! Built once per inbound `Request_VM`/`Update_VM` message, after the
//! argument envelope has been decoded and the principal resolved, then
//! discarded when the dispatch completes. Disposal is not interceptable and
//! never builds a context.

use serde_json::Value;

use crate::principal::Principal;

/// Context for a single intercepted request.
#[derive(Debug, Clone)]
pub struct HubContext {
    /// Opaque connection identifier assigned by the transport.
    pub connection_id: String,
    /// Wire operation name, one of [`crate::Operations::REQUEST_VM`] or
    /// [`crate::Operations::UPDATE_VM`].
    pub operation: &'static str,
    /// The view model the request addresses.
    pub vm_id: String,
    /// Request payload: the decoded initialization argument for requests,
    /// the property-path update map for updates.
    pub payload: Option<Value>,
    /// Out-of-band headers extracted from the argument envelope, if any.
    pub headers: Option<Value>,
    /// Caller identity, resolved at dispatch entry.
    pub principal: Principal,
}
