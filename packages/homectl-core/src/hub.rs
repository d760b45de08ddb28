//! The presentation-layer facade.
//!
//! A [`DeviceHub`] owns a dedicated I/O runtime and every core service. Its
//! methods never block on device I/O: reads are clones of registry state,
//! commands return a [`CommandTicket`] immediately and events are drained
//! from an [`EventSubscription`] at the caller's own pace. This is what lets a
//! synchronous GUI loop drive the hub without an async runtime of its own.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::bootstrap::{bootstrap_services, BootstrappedServices};
use crate::bridge::CommandTicket;
use crate::config::Config;
use crate::discovery::DiscoveryOrchestrator;
use crate::error::{CoreError, CoreResult, DeviceResult};
use crate::events::{EventBus, EventEmitter, EventSubscription};
use crate::model::{Command, DeviceId};
use crate::registry::{DeviceSnapshot, Registry};
use crate::runtime::IoRuntime;

pub struct DeviceHub {
    services: BootstrappedServices,
    // Declared last so services are shut down before the runtime goes away.
    runtime: IoRuntime,
}

impl DeviceHub {
    /// Starts the I/O runtime, wires the services and starts discovery.
    ///
    /// May be called from synchronous code or from inside another runtime.
    pub fn start(config: &Config) -> CoreResult<Self> {
        config.validate().map_err(CoreError::Configuration)?;

        let runtime = IoRuntime::start(config.worker_pool_size)?;
        let services = bootstrap_services(config, runtime.spawner())?;

        // Probe tasks go through the registry's spawner, i.e. onto the I/O runtime.
        services.discovery.start();

        log::info!("[Hub] Started");
        Ok(Self { services, runtime })
    }

    /// Registers a subscriber. Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> EventSubscription {
        self.services.event_bus.subscribe()
    }

    /// Attaches an emitter that receives every event as it is published.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        self.services.event_bus.set_external_emitter(emitter);
    }

    /// Copies of every known device.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.services.registry.snapshot()
    }

    pub fn device(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.services.registry.get(id)
    }

    /// Validates and queues a command; see [`Registry::invoke`].
    pub fn invoke(&self, id: &DeviceId, command: Command) -> DeviceResult<CommandTicket> {
        self.services.registry.invoke(id, command)
    }

    /// Requests one full pass of every probe.
    pub fn rescan(&self) -> CoreResult<()> {
        Ok(self.services.discovery.rescan()?)
    }

    /// Applies new credentials and static host lists.
    ///
    /// Devices blocked by a configuration error are unblocked and a rescan
    /// is requested so that new hosts show up. Other tunables keep the
    /// values the hub was started with. Returns how many devices were
    /// unblocked.
    pub fn reload_config(&self, config: &Config) -> CoreResult<usize> {
        config.validate().map_err(CoreError::Configuration)?;

        *self.services.credentials.write() = config.credentials.clone();
        let unblocked = self.services.registry.unblock_all();
        log::info!(
            "[Hub] Configuration reloaded ({} device(s) unblocked)",
            unblocked
        );

        if self.services.discovery.is_running() {
            self.services.discovery.rescan()?;
        }
        Ok(unblocked)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.services.event_bus
    }

    pub fn registry(&self) -> &Registry {
        &self.services.registry
    }

    pub fn discovery(&self) -> &DiscoveryOrchestrator {
        &self.services.discovery
    }

    /// Handle to the I/O runtime, for callers that want to await tickets on it.
    pub fn handle(&self) -> Handle {
        self.runtime.handle()
    }

    /// Stops discovery and every device lane. Idempotent.
    pub fn shutdown(&self) {
        self.services.shutdown();
    }
}

impl Drop for DeviceHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TuyaDeviceConfig;
    use crate::error::DeviceError;
    use crate::model::Protocol;

    fn quiet_config() -> Config {
        Config {
            auto_discovery: false,
            polling_enabled: false,
            worker_pool_size: 2,
            ..Config::default()
        }
    }

    #[test]
    fn start_from_sync_code_and_shut_down() {
        let hub = DeviceHub::start(&quiet_config()).unwrap();
        assert!(hub.snapshot().is_empty());
        assert!(hub.discovery().is_running());

        hub.shutdown();
        assert!(hub.registry().is_shut_down());
        assert!(!hub.discovery().is_running());
        assert!(matches!(hub.rescan(), Err(CoreError::Discovery(_))));
    }

    #[tokio::test]
    async fn start_and_drop_inside_async_context() {
        let hub = DeviceHub::start(&quiet_config()).unwrap();
        let mut events = hub.subscribe();
        // The discovery Started event was published before subscribing.
        assert!(events.try_next().is_none());
        drop(hub);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config {
            event_channel_capacity: 0,
            ..quiet_config()
        };
        assert!(matches!(
            DeviceHub::start(&config),
            Err(CoreError::Configuration(_))
        ));
    }

    #[test]
    fn invoke_on_unknown_device_fails_without_queueing() {
        let hub = DeviceHub::start(&quiet_config()).unwrap();
        let id = DeviceId::new(Protocol::Wiz, "a8bb5006c3f1");
        let err = hub
            .invoke(&id, Command::SetPower { on: true })
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::UnknownDevice(_)));
        assert!(hub.device(&id).is_none());
    }

    #[test]
    fn reload_replaces_credentials() {
        let hub = DeviceHub::start(&quiet_config()).unwrap();
        // Stop discovery so the reload does not trigger a real network pass.
        hub.discovery().stop();

        let mut config = quiet_config();
        config.credentials.tuya_devices.push(TuyaDeviceConfig {
            id: "bf01".into(),
            name: "Desk".into(),
            ip: "192.168.1.50".into(),
            local_key: "0123456789abcdef".into(),
            version: "3.3".into(),
        });
        assert_eq!(hub.reload_config(&config).unwrap(), 0);
        assert!(hub.services.credentials.read().tuya_device("bf01").is_some());

        let bad = Config {
            worker_pool_size: 0,
            ..quiet_config()
        };
        assert!(hub.reload_config(&bad).is_err());
        assert!(hub.services.credentials.read().tuya_device("bf01").is_some());
    }
}
