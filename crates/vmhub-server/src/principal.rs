//! Caller identity resolution.

use vmhub_protocol::Principal;

/// Resolves the identity bound to a connection.
///
/// The hub calls this at the start of every dispatch and never caches the
/// result — the transport may rebind identity between calls (token
/// refresh), and a cached principal would go stale.
pub trait PrincipalAccessor: Send + Sync {
    fn principal(&self, connection_id: &str) -> Principal;
}

/// Accessor for deployments without an authentication layer.
#[derive(Debug, Default)]
pub struct AnonymousPrincipal;

impl PrincipalAccessor for AnonymousPrincipal {
    fn principal(&self, _connection_id: &str) -> Principal {
        Principal::anonymous()
    }
}
