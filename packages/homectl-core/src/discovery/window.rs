//! Sighting deduplication.
//!
//! Probes report every device they see on every pass. The window keeps the
//! registry from being handed the same unchanged sighting over and over: a
//! sighting is forwarded when it is new, when something about it changed, when
//! the registry is about to drop the device, or when the last forwarded copy
//! is older than the window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::types::Sighting;
use crate::model::{CapabilitySet, DeviceId, Endpoint};

#[derive(Debug, Clone, PartialEq)]
struct Fingerprint {
    address: Endpoint,
    display_name: String,
    model: Option<String>,
    capabilities: CapabilitySet,
}

impl From<&Sighting> for Fingerprint {
    fn from(sighting: &Sighting) -> Self {
        Self {
            address: sighting.address.clone(),
            display_name: sighting.display_name.clone(),
            model: sighting.model.clone(),
            capabilities: sighting.effective_capabilities(),
        }
    }
}

/// What the registry currently knows about a sighted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Known {
    Absent,
    Present,
    PendingLoss,
}

#[derive(Debug)]
pub(crate) struct SightingWindow {
    window: Duration,
    seen: HashMap<DeviceId, (Fingerprint, Instant)>,
}

impl SightingWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Decides whether a sighting goes on to the registry, and records it if so.
    pub(crate) fn admit(&mut self, sighting: &Sighting, known: Known, now: Instant) -> bool {
        let fingerprint = Fingerprint::from(sighting);
        let forward = match (known, self.seen.get(&sighting.id)) {
            (Known::Absent | Known::PendingLoss, _) | (_, None) => true,
            (Known::Present, Some((previous, at))) => {
                *previous != fingerprint || now.duration_since(*at) >= self.window
            }
        };
        if forward {
            self.seen.insert(sighting.id.clone(), (fingerprint, now));
        }
        forward
    }

    /// Drops entries whose window has long passed.
    pub(crate) fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, (_, at)| now.duration_since(*at) < window.saturating_mul(2));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}
