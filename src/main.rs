//! vmhub — real-time view-model synchronization server.
//!
//! A single-process server that pushes named view-model state to browser
//! clients over WebSocket and accepts property updates back. Clients speak
//! the `Request_VM` / `Update_VM` / `Dispose_VM` wire operations; the
//! server answers on the `Response_VM` channel.
//!
//! Usage:
//!   vmhub                                  # Default port 5100
//!   vmhub --port 8080                      # Custom port
//!   vmhub --auth-token mysecret            # Require a bearer token in $headers
//!   vmhub --verbose                        # Debug-level logging

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vmhub_protocol::{HubContext, HubError, Principal, VmArg};
use vmhub_server::{
    AnonymousPrincipal, Controller, ControllerRegistry, Middleware, MiddlewarePipeline, VmHub,
    VmResponder,
};
use vmhub_transport::{ConnectionMap, TransportConfig, TransportServer};

#[derive(Parser, Debug)]
#[command(name = "vmhub", about = "vmhub — real-time view-model synchronization server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "5100")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "64")]
    max_connections: usize,

    /// Require this bearer token in the request-argument headers
    #[arg(long)]
    auth_token: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Demo controller
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory view-model controller: one JSON state object per view-model
/// id. Answers a request with the full serialized state, applies
/// dotted-path updates and pushes the changed properties back, and drops
/// state on disposal.
struct DemoController {
    responder: VmResponder,
    vms: DashMap<String, Map<String, Value>>,
    principal: RwLock<Principal>,
}

impl DemoController {
    fn new(_connection_id: &str, responder: VmResponder) -> Self {
        Self {
            responder,
            vms: DashMap::new(),
            principal: RwLock::new(Principal::anonymous()),
        }
    }
}

impl Controller for DemoController {
    async fn on_request_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        arg: VmArg,
    ) -> Result<(), HubError> {
        let initial = match arg.value() {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        let mut state = self.vms.entry(vm_id.to_string()).or_insert(initial).clone();
        if let Some(subject) = self.principal.read().subject.clone() {
            state.insert("ConnectedUser".into(), Value::String(subject));
        }

        let serialized = serde_json::to_string(&Value::Object(state))
            .map_err(|e| HubError::fault(format!("failed to serialize {vm_id}: {e}")))?;
        self.responder.respond(connection_id, vm_id, serialized);
        Ok(())
    }

    async fn on_update_vm(
        &self,
        connection_id: &str,
        vm_id: &str,
        data: HashMap<String, Value>,
    ) -> Result<(), HubError> {
        let mut entry = self
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| HubError::fault(format!("view model {vm_id} is not active")))?;

        // Push only the properties this update touched.
        let mut delta = Map::new();
        for (path, value) in data {
            set_path(&mut entry, &path, value.clone());
            set_path(&mut delta, &path, value);
        }
        drop(entry);

        let serialized = serde_json::to_string(&Value::Object(delta))
            .map_err(|e| HubError::fault(format!("failed to serialize {vm_id}: {e}")))?;
        self.responder.respond(connection_id, vm_id, serialized);
        Ok(())
    }

    async fn on_dispose_vm(&self, _connection_id: &str, vm_id: &str) -> Result<(), HubError> {
        self.vms.remove(vm_id);
        Ok(())
    }

    fn set_principal(&self, principal: Principal) {
        *self.principal.write() = principal;
    }
}

/// Write `value` at a dotted property path, creating intermediate objects
/// as needed. A path segment that lands on a non-object overwrites it.
fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }

        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("slot was just made an object");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Demo middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Rejects any intercepted operation whose request headers do not carry the
/// expected bearer token under `Authorization`.
struct BearerAuthMiddleware {
    token: String,
}

impl Middleware for BearerAuthMiddleware {
    async fn invoke(&self, context: &HubContext) -> Result<(), HubError> {
        let authorization = context
            .headers
            .as_ref()
            .and_then(|h| h.get("Authorization"))
            .and_then(|v| v.as_str());

        match authorization.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) if token == self.token => Ok(()),
            _ => Err(HubError::unauthorized("invalid or missing access token")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         vmhub Server                         ║");
    println!("║               real-time view-model synchronization           ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Binding:    {} (localhost only)", cli.hostname);
    match &cli.auth_token {
        Some(_) => println!("  Auth:       bearer token required in $headers"),
        None => println!("  Auth:       disabled"),
    }
    println!();

    let connections = Arc::new(ConnectionMap::new());
    let registry = Arc::new(ControllerRegistry::new(DemoController::new));

    let mut pipeline = MiddlewarePipeline::new();
    if let Some(token) = cli.auth_token.clone() {
        pipeline.add(move || BearerAuthMiddleware {
            token: token.clone(),
        });
    }

    let hub = VmHub::new(
        registry,
        pipeline,
        Arc::new(AnonymousPrincipal),
        connections.clone(),
    );

    let config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        max_connections: Some(cli.max_connections),
    };

    let mut transport = TransportServer::start(config, hub, connections)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start transport: {e}"))?;

    println!("  Listening:  ws://{}:{}/ws", cli.hostname, transport.port());
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    transport.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_path_writes_top_level_property() {
        let mut map = Map::new();
        set_path(&mut map, "Greeting", json!("hello"));
        assert_eq!(map["Greeting"], json!("hello"));
    }

    #[test]
    fn set_path_creates_nested_objects() {
        let mut map = Map::new();
        set_path(&mut map, "User.Address.City", json!("Oslo"));
        assert_eq!(map["User"]["Address"]["City"], json!("Oslo"));
    }

    #[test]
    fn set_path_overwrites_scalar_with_object() {
        let mut map = Map::new();
        set_path(&mut map, "User", json!(42));
        set_path(&mut map, "User.Name", json!("ada"));
        assert_eq!(map["User"]["Name"], json!("ada"));
    }
}
