//! Probes for devices that cannot be found by broadcast.
//!
//! Tapo bulbs and Tuya devices are listed in the credentials. A pass checks
//! each configured host with a TCP connect and reports the ones that answer;
//! Tapo bulbs are additionally identified over KLAP when an account is set.
//! Both probes read the shared credential store on every pass, so a config
//! reload shows up on the next pass.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::TcpStream;

use super::probe::DiscoveryProbe;
use super::types::{DiscoveryResult, Sighting};
use crate::adapters::TapoAdapter;
use crate::bridge::CommandBridge;
use crate::config::CredentialStore;
use crate::error::{DeviceError, DeviceResult};
use crate::model::{Capability, Endpoint, Protocol};
use crate::protocol_constants::{TAPO_HTTP_PORT, TUYA_PORT};

/// Checks that something accepts TCP connections at `endpoint`.
async fn reachable(bridge: &CommandBridge, endpoint: &Endpoint) -> DeviceResult<()> {
    let label = format!("reach {endpoint}");
    bridge
        .run(&label, async {
            TcpStream::connect((endpoint.host.as_str(), endpoint.port))
                .await
                .map(drop)
                .map_err(|e| DeviceError::ConnectionError(format!("{endpoint}: {e}")))
        })
        .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Tapo
// ─────────────────────────────────────────────────────────────────────────────

pub struct TapoProbe {
    credentials: CredentialStore,
    adapter: Arc<TapoAdapter>,
    bridge: CommandBridge,
    port: u16,
}

impl TapoProbe {
    pub fn new(
        credentials: CredentialStore,
        adapter: Arc<TapoAdapter>,
        bridge: CommandBridge,
    ) -> Self {
        Self {
            credentials,
            adapter,
            bridge,
            port: TAPO_HTTP_PORT,
        }
    }

    #[cfg(test)]
    fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn probe_host(&self, host: String, identify: bool) -> Option<Sighting> {
        let endpoint = Endpoint::new(host.clone(), self.port);
        if let Err(e) = reachable(&self.bridge, &endpoint).await {
            log::debug!("[Tapo] {} not reachable: {}", host, e);
            return None;
        }

        let sighting = Sighting::new(
            Protocol::Tapo,
            &host,
            format!("Tapo {host}"),
            endpoint.clone(),
        );
        if !identify {
            return Some(sighting);
        }

        let label = format!("tapo:{host} identify");
        match self.bridge.run(&label, self.adapter.identify(&endpoint)).await {
            Ok(identity) => {
                let capabilities = if identity.has_color {
                    Protocol::Tapo.default_capabilities()
                } else {
                    Protocol::Tapo.default_capabilities().without(Capability::Color)
                };
                let mut sighting = sighting
                    .with_model(identity.model)
                    .with_capabilities(capabilities);
                if let Some(nickname) = identity.nickname.filter(|n| !n.trim().is_empty()) {
                    sighting.display_name = nickname;
                }
                Some(sighting)
            }
            Err(e) => {
                // Reachable but unidentified; commands will surface the error.
                log::warn!("[Tapo] Could not identify {}: {}", host, e);
                Some(sighting)
            }
        }
    }
}

#[async_trait]
impl DiscoveryProbe for TapoProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Tapo
    }

    async fn scan(&self) -> DiscoveryResult<Vec<Sighting>> {
        let (hosts, identify) = {
            let credentials = self.credentials.read();
            let mut hosts: Vec<String> = credentials
                .tapo_hosts
                .iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
            hosts.sort();
            hosts.dedup();
            (hosts, credentials.tapo_account.is_some())
        };

        let found = join_all(hosts.into_iter().map(|host| self.probe_host(host, identify))).await;
        Ok(found.into_iter().flatten().collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tuya
// ─────────────────────────────────────────────────────────────────────────────

pub struct TuyaProbe {
    credentials: CredentialStore,
    bridge: CommandBridge,
    port: u16,
}

impl TuyaProbe {
    pub fn new(credentials: CredentialStore, bridge: CommandBridge) -> Self {
        Self {
            credentials,
            bridge,
            port: TUYA_PORT,
        }
    }

    #[cfg(test)]
    fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait]
impl DiscoveryProbe for TuyaProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Tuya
    }

    async fn scan(&self) -> DiscoveryResult<Vec<Sighting>> {
        let candidates: Vec<Sighting> = self
            .credentials
            .read()
            .tuya_devices
            .iter()
            .filter(|device| !device.id.trim().is_empty() && !device.ip.trim().is_empty())
            .map(|device| {
                let name = if device.name.trim().is_empty() {
                    format!("Tuya {}", device.id)
                } else {
                    device.name.clone()
                };
                Sighting::new(
                    Protocol::Tuya,
                    &device.id,
                    name,
                    Endpoint::new(device.ip.trim(), self.port),
                )
            })
            .collect();

        let checks = join_all(candidates.into_iter().map(|sighting| async move {
            match reachable(&self.bridge, &sighting.address).await {
                Ok(()) => Some(sighting),
                Err(e) => {
                    log::debug!("[Tuya] {} not reachable: {}", sighting.id, e);
                    None
                }
            }
        }))
        .await;
        Ok(checks.into_iter().flatten().collect())
    }
}
