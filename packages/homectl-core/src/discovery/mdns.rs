//! Chromecast discovery over mDNS.
//!
//! Browses `_googlecast._tcp.local.` for the configured window each pass and
//! reads identity from the TXT records: `id` (device uuid), `fn` (friendly
//! name) and `md` (model). The daemon is created on first use and reused; a
//! daemon that fails to start fails that pass only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use parking_lot::Mutex;
use tokio::time::{timeout, Instant};

use super::probe::DiscoveryProbe;
use super::types::{DiscoveryError, DiscoveryResult, Sighting};
use crate::model::{Endpoint, Protocol};
use crate::protocol_constants::{CAST_PORT, CAST_SERVICE_TYPE};

pub struct CastProbe {
    browse_timeout: Duration,
    daemon: Mutex<Option<Arc<ServiceDaemon>>>,
}

impl CastProbe {
    pub fn new(browse_timeout: Duration) -> Self {
        Self {
            browse_timeout,
            daemon: Mutex::new(None),
        }
    }

    fn daemon(&self) -> DiscoveryResult<Arc<ServiceDaemon>> {
        let mut slot = self.daemon.lock();
        if let Some(daemon) = slot.as_ref() {
            return Ok(daemon.clone());
        }
        let daemon = Arc::new(
            ServiceDaemon::new().map_err(|e| DiscoveryError::MdnsDaemon(e.to_string()))?,
        );
        *slot = Some(daemon.clone());
        Ok(daemon)
    }
}

impl Drop for CastProbe {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.get_mut().take() {
            if let Err(e) = daemon.shutdown() {
                log::debug!("[Cast] mDNS daemon shutdown failed: {:?}", e);
            }
        }
    }
}

#[async_trait]
impl DiscoveryProbe for CastProbe {
    fn protocol(&self) -> Protocol {
        Protocol::Chromecast
    }

    async fn scan(&self) -> DiscoveryResult<Vec<Sighting>> {
        let daemon = self.daemon()?;
        let receiver = daemon
            .browse(CAST_SERVICE_TYPE)
            .map_err(|e| DiscoveryError::MdnsDaemon(e.to_string()))?;

        let mut discovered: HashMap<String, Sighting> = HashMap::new();
        let deadline = Instant::now() + self.browse_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    log::trace!("[Cast] Service resolved: {}", info.fullname);
                    if let Some(sighting) = parse_cast_service(&info) {
                        log::debug!(
                            "[Cast] Found {} \"{}\" at {}",
                            sighting.id,
                            sighting.display_name,
                            sighting.address
                        );
                        discovered.insert(sighting.id.as_str().to_string(), sighting);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    log::debug!("[Cast] mDNS receiver closed: {:?}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = daemon.stop_browse(CAST_SERVICE_TYPE) {
            log::warn!("[Cast] Failed to stop browse: {:?}", e);
        }

        Ok(discovered.into_values().collect())
    }
}

fn parse_cast_service(info: &ResolvedService) -> Option<Sighting> {
    let ip = info.addresses.iter().find_map(|addr| match addr {
        ScopedIp::V4(v4) => Some(v4.addr().to_string()),
        _ => None,
    })?;
    let port = if info.port > 0 { info.port } else { CAST_PORT };

    let txt = |key: &str| {
        info.txt_properties
            .get_property_val_str(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let instance = instance_name(&info.fullname);
    let identity = txt("id").or_else(|| instance.clone())?;
    let name = txt("fn").or(instance).unwrap_or_else(|| identity.clone());

    Some(
        Sighting::new(Protocol::Chromecast, &identity, name, Endpoint::new(ip, port))
            .with_model(txt("md")),
    )
}

/// Instance label of a full service name
/// (`Living-Room-1a2b._googlecast._tcp.local.` gives `Living-Room-1a2b`).
fn instance_name(fullname: &str) -> Option<String> {
    let instance = fullname.strip_suffix(CAST_SERVICE_TYPE)?.trim_end_matches('.');
    (!instance.is_empty()).then(|| instance.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_strips_service_type() {
        assert_eq!(
            instance_name("Living-Room-1a2b._googlecast._tcp.local."),
            Some("Living-Room-1a2b".into())
        );
        assert_eq!(instance_name("._googlecast._tcp.local."), None);
        assert_eq!(instance_name("printer._ipp._tcp.local."), None);
    }

    #[test]
    fn probe_reports_chromecast_protocol() {
        let probe = CastProbe::new(Duration::from_millis(10));
        assert_eq!(probe.protocol(), Protocol::Chromecast);
        assert!(probe.daemon.lock().is_none());
    }
}
