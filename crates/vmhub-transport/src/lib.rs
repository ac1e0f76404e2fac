//! vmhub Transport Layer
//!
//! WebSocket transport for the view-model synchronization server.
//! The transport layer handles:
//! - Connection lifecycle (open, message, close)
//! - Per-connection identifiers and outbound delivery queues
//! - Parsing inbound frames into typed wire messages
//!
//! The transport is decoupled from the hub logic via the `VmHandler` trait
//! on the inbound side and the `ResponseSender` trait on the outbound side.

pub mod connection;
pub mod server;

pub use connection::{ConnectionMap, ResponseSender};
pub use server::{TransportConfig, TransportServer, VmHandler};
