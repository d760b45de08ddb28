//! Application bootstrap and dependency wiring.
//!
//! This module is the composition root: the one place where the event bus,
//! adapters, worker pool, registry and discovery orchestrator are created and
//! wired together.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;

use crate::adapters::{AdapterSet, TapoAdapter};
use crate::bridge::CommandBridge;
use crate::config::{Config, CredentialStore};
use crate::discovery::{default_probes, DiscoveryOrchestrator, DiscoverySettings};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventEmitter};
use crate::registry::{Registry, RegistrySettings};
use crate::runtime::TokioSpawner;

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Event bus every service publishes to.
    pub event_bus: Arc<EventBus>,
    /// Owner of every known device.
    pub registry: Registry,
    /// Drives the per-protocol probes.
    pub discovery: DiscoveryOrchestrator,
    /// Worker pool shared by commands, polls and probes.
    pub bridge: CommandBridge,
    /// Credentials shared with adapters and probes; replaced on reload.
    pub credentials: CredentialStore,
    /// Shared HTTP client for connection pooling.
    http_client: Client,
    /// Task spawner for background operations.
    pub spawner: TokioSpawner,
}

impl BootstrappedServices {
    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    /// Stops discovery, cancels every lane and pending loss.
    ///
    /// Queued commands resolve as cancelled. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.registry.is_shut_down() {
            return;
        }
        log::info!("[Bootstrap] Beginning shutdown...");
        self.discovery.stop();
        self.registry.shutdown();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Creates the shared HTTP client for Tapo communication.
///
/// Using a shared client enables connection pooling. Cookies are managed per
/// session by the adapter, not by the client.
fn create_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .expect("Failed to create HTTP client")
}

/// Bootstraps all core services with their dependencies.
///
/// Services are created in dependency order:
///
/// 1. Event bus and credential store
/// 2. Adapters (the Tapo adapter is shared with its probe for session reuse)
/// 3. Worker pool
/// 4. Registry (depends on adapters, worker pool, event bus)
/// 5. Discovery orchestrator (depends on registry, probes)
///
/// Every background task is spawned through `spawner`, so the caller decides
/// which runtime owns device I/O. Discovery is created but not started.
///
/// # Errors
///
/// Returns [`CoreError::Configuration`] if `config` fails validation.
pub fn bootstrap_services(
    config: &Config,
    spawner: TokioSpawner,
) -> CoreResult<BootstrappedServices> {
    config.validate().map_err(CoreError::Configuration)?;

    let event_bus = Arc::new(EventBus::new(config.event_channel_capacity));
    let emitter: Arc<dyn EventEmitter> = event_bus.clone();
    let credentials: CredentialStore = Arc::new(RwLock::new(config.credentials.clone()));

    let http_client = create_http_client(config.operation_timeout());
    let tapo = Arc::new(TapoAdapter::new(credentials.clone(), http_client.clone()));
    let adapters = AdapterSet::with_defaults(
        credentials.clone(),
        tapo.clone(),
        config.operation_timeout(),
    );

    let bridge = CommandBridge::new(config.worker_pool_size, config.operation_timeout());

    let registry = Registry::new(
        adapters,
        bridge.clone(),
        emitter.clone(),
        RegistrySettings::from_config(config),
        spawner.clone(),
    );

    let discovery = DiscoveryOrchestrator::new(
        default_probes(config, credentials.clone(), tapo, bridge.clone()),
        registry.clone(),
        emitter,
        DiscoverySettings::from_config(config),
    );

    log::info!(
        "[Bootstrap] Services ready (pool={}, timeout={}ms, polling={})",
        config.worker_pool_size,
        config.operation_timeout_ms,
        config.polling_enabled
    );

    Ok(BootstrappedServices {
        event_bus,
        registry,
        discovery,
        bridge,
        credentials,
        http_client,
        spawner,
    })
}
