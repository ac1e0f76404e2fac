//! Wire operation name constants.
//!
//! Each constant is the exact string sent over the wire as the `type` field
//! of a message, and the operation name middleware observes in a
//! [`crate::HubContext`].

/// All wire operation names.
pub struct Operations;

impl Operations {
    // ── Client → server ─────────────────────────────────────────────────
    pub const REQUEST_VM: &str = "Request_VM";
    pub const UPDATE_VM: &str = "Update_VM";
    pub const DISPOSE_VM: &str = "Dispose_VM";

    // ── Server → client ─────────────────────────────────────────────────
    pub const RESPONSE_VM: &str = "Response_VM";
}
