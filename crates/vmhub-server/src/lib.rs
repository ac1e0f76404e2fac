//! vmhub Server — the connection/request dispatch hub.
//!
//! Receives client operations from the transport, resolves them to stateful
//! per-connection controller instances through the registry, gates request
//! and update operations behind the middleware pipeline, and routes
//! asynchronous pushes back to the originating connection through the
//! response gateway.

pub mod hub;
pub mod middleware;
pub mod principal;
pub mod registry;

pub use hub::VmHub;
pub use middleware::{Middleware, MiddlewarePipeline};
pub use principal::{AnonymousPrincipal, PrincipalAccessor};
pub use registry::{Controller, ControllerRegistry, ResponseDelegate, VmResponder};
