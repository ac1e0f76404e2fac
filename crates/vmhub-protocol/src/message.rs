//! Typed wire messages exchanged with browser clients.
//!
//! Messages are JSON objects tagged by a `type` field carrying one of the
//! [`crate::Operations`] names. `vmData` on the outbound side is
//! pre-serialized JSON text — the hub never re-encodes controller output.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-initiated message, one variant per wire operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Request a view model's serialized state.
    #[serde(rename = "Request_VM")]
    RequestVm {
        #[serde(rename = "vmId")]
        vm_id: String,
        /// Optional initialization argument, possibly wrapping an envelope
        /// (see [`crate::envelope::VmArg`]).
        #[serde(rename = "vmArg", default, skip_serializing_if = "Option::is_none")]
        vm_arg: Option<Value>,
    },

    /// Push property updates into a view model. Keys are dotted property
    /// paths; insertion order is not significant.
    #[serde(rename = "Update_VM")]
    UpdateVm {
        #[serde(rename = "vmId")]
        vm_id: String,
        #[serde(rename = "vmData")]
        vm_data: HashMap<String, Value>,
    },

    /// Discard a view model the client no longer renders.
    #[serde(rename = "Dispose_VM")]
    DisposeVm {
        #[serde(rename = "vmId")]
        vm_id: String,
    },
}

impl ClientMessage {
    /// The view model this message addresses.
    pub fn vm_id(&self) -> &str {
        match self {
            Self::RequestVm { vm_id, .. }
            | Self::UpdateVm { vm_id, .. }
            | Self::DisposeVm { vm_id } => vm_id,
        }
    }
}

/// Server-initiated push to a single client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// View model data addressed to a client. `vm_data` is serialized JSON
    /// text produced upstream.
    #[serde(rename = "Response_VM")]
    ResponseVm {
        #[serde(rename = "vmId")]
        vm_id: String,
        #[serde(rename = "vmData")]
        vm_data: String,
    },
}

impl ServerMessage {
    pub fn response(vm_id: impl Into<String>, vm_data: impl Into<String>) -> Self {
        Self::ResponseVm {
            vm_id: vm_id.into(),
            vm_data: vm_data.into(),
        }
    }
}
