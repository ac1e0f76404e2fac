//! Dispatch error kinds and the serialized-exception wire payload.
//!
//! Failures in the dispatch path fall into a closed set of kinds, switched
//! on explicitly at the hub boundary: `Cancelled` is cooperative (pipeline
//! rejection, logged only), `Unauthorized` is pushed to the client as a
//! serialized exception, and everything else is a `Fault` — a programming
//! error logged with full detail and never surfaced to the client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category name the `Unauthorized` kind serializes under. Kept verbatim
/// for wire compatibility with clients that switch on `ExceptionType`.
pub const UNAUTHORIZED_EXCEPTION: &str = "UnauthorizedAccessException";

/// Category name for the `Cancelled` kind. Never pushed to clients; appears
/// only in logs.
pub const CANCELLED_EXCEPTION: &str = "OperationCancelled";

/// Default category for faults raised without an explicit kind.
pub const SERVER_EXCEPTION: &str = "ServerException";

/// Closed set of dispatch failure kinds.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HubError {
    /// Cooperative cancellation of the current request, raised when the
    /// middleware pipeline rejects it. The client already received an error
    /// push by the time this propagates.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// The caller is not allowed to perform the operation. Always results
    /// in exactly one serialized-exception push to the client.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any other failure. Treated as an assertion-level programming error:
    /// logged in full, never pushed, and the connection stays usable.
    #[error("{kind}: {message}")]
    Fault { kind: String, message: String },
}

impl HubError {
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault {
            kind: SERVER_EXCEPTION.into(),
            message: message.into(),
        }
    }

    /// A fault carrying a caller-chosen category name, e.g. a middleware
    /// rejecting with `RateLimitExceeded`.
    pub fn fault_with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The category name this kind serializes under.
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Cancelled(_) => CANCELLED_EXCEPTION,
            Self::Unauthorized(_) => UNAUTHORIZED_EXCEPTION,
            Self::Fault { kind, .. } => kind,
        }
    }

    /// The human-readable message carried by this kind.
    pub fn message(&self) -> &str {
        match self {
            Self::Cancelled(message) | Self::Unauthorized(message) => message,
            Self::Fault { message, .. } => message,
        }
    }
}

/// The error payload pushed to clients on the regular `Response_VM` channel.
/// There is no distinct error wire message type — clients only ever see
/// normal data or this shape. Field casing is part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedException {
    #[serde(rename = "ExceptionType")]
    pub exception_type: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl SerializedException {
    pub fn to_json(&self) -> String {
        // Serialization of two string fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&HubError> for SerializedException {
    fn from(err: &HubError) -> Self {
        Self {
            exception_type: err.kind_name().to_string(),
            message: err.message().to_string(),
        }
    }
}
