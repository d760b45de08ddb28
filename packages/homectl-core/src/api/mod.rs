//! HTTP/WebSocket API layer.
//!
//! This module contains thin handlers that delegate to the registry and the
//! discovery orchestrator. It provides the router construction and server
//! startup functionality.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::discovery::DiscoveryOrchestrator;
use crate::events::EventBus;
use crate::hub::DeviceHub;
use crate::protocol_constants::{HTTP_PORT_RANGE_END, HTTP_PORT_RANGE_START};
use crate::registry::Registry;

pub mod http;
pub mod response;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// This is a thin wrapper that holds handles to services.
/// All business logic lives in the services themselves.
#[derive(Clone)]
pub struct AppState {
    /// Owner of every known device.
    pub registry: Registry,
    /// Discovery orchestrator, for rescans.
    pub discovery: DiscoveryOrchestrator,
    /// Event bus streamed to WebSocket clients.
    pub event_bus: Arc<EventBus>,
    /// Manages WebSocket connections.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Origin prefixes allowed by CORS.
    pub trusted_origins: Arc<Vec<String>>,
    /// Keeps the hub, and with it the I/O runtime, alive while serving.
    #[allow(dead_code)]
    hub: Option<Arc<DeviceHub>>,
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    registry: Option<Registry>,
    discovery: Option<DiscoveryOrchestrator>,
    event_bus: Option<Arc<EventBus>>,
    ws_manager: Option<Arc<WsConnectionManager>>,
    trusted_origins: Option<Vec<String>>,
    hub: Option<Arc<DeviceHub>>,
}

impl AppStateBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes every service from a running hub and keeps the hub alive.
    pub fn hub(mut self, hub: Arc<DeviceHub>) -> Self {
        self.registry = Some(hub.registry().clone());
        self.discovery = Some(hub.discovery().clone());
        self.event_bus = Some(hub.event_bus().clone());
        self.hub = Some(hub);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn discovery(mut self, discovery: DiscoveryOrchestrator) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Sets the WebSocket connection manager.
    pub fn ws_manager(mut self, manager: Arc<WsConnectionManager>) -> Self {
        self.ws_manager = Some(manager);
        self
    }

    /// Sets the origin prefixes allowed by CORS. Defaults to localhost.
    pub fn trusted_origins(mut self, origins: Vec<String>) -> Self {
        self.trusted_origins = Some(origins);
        self
    }

    /// Builds the `AppState`, panicking if required fields are missing.
    pub fn build(self) -> AppState {
        AppState {
            registry: self.registry.expect("registry is required"),
            discovery: self.discovery.expect("discovery is required"),
            event_bus: self.event_bus.expect("event_bus is required"),
            ws_manager: self.ws_manager.unwrap_or_default(),
            trusted_origins: Arc::new(self.trusted_origins.unwrap_or_else(default_origins)),
            hub: self.hub,
        }
    }
}

fn default_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "http://127.0.0.1".to_string(),
    ]
}

impl AppState {
    /// Creates a new builder for constructing an `AppState`.
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    /// State for a running hub with default settings.
    pub fn for_hub(hub: Arc<DeviceHub>) -> Self {
        Self::builder().hub(hub).build()
    }
}

async fn find_available_port(start: u16, end: u16) -> Result<(u16, TcpListener), ServerError> {
    for port in start..=end {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((port, listener)),
            Err(_) => continue,
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Binds `port`, or the first free port in the default range when `port`
/// is zero.
pub async fn bind(port: u16) -> Result<(u16, TcpListener), ServerError> {
    if port > 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        Ok((port, TcpListener::bind(&addr).await?))
    } else {
        find_available_port(HTTP_PORT_RANGE_START, HTTP_PORT_RANGE_END).await
    }
}

/// Serves the API on `listener` until `shutdown` resolves.
///
/// Open WebSocket connections are closed when shutdown begins.
pub async fn start_server<F>(
    state: AppState,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("[API] Listening on http://{}", addr);
    }

    let ws_manager = Arc::clone(&state.ws_manager);
    let app = http::create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        ws_manager.close_all();
    })
    .await?;
    Ok(())
}
