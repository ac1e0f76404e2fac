//! vmhub — Protocol Types
//!
//! Wire-level types for the view-model synchronization protocol.
//! This crate is the single source of truth for all operation names,
//! reserved envelope keys, message shapes, and error kinds.

pub mod context;
pub mod envelope;
pub mod error;
pub mod message;
pub mod operations;
pub mod principal;

pub use context::HubContext;
pub use envelope::{VmArg, HEADERS_KEY, VM_ARG_KEY};
pub use error::{HubError, SerializedException};
pub use message::{ClientMessage, ServerMessage};
pub use operations::Operations;
pub use principal::Principal;
