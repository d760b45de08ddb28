//! Device discovery.
//!
//! One probe per protocol family finds devices on the LAN (or checks the
//! configured ones). The [`DiscoveryOrchestrator`] runs every probe as its
//! own task, filters repeated sightings through a sighting window, feeds
//! the rest into the [`Registry`], and reports devices missing from a
//! successful pass via [`Registry::mark_lost`].
//!
//! # Probes
//!
//! - [`CastProbe`]: mDNS browse of `_googlecast._tcp.local.`
//! - [`WizProbe`]: UDP `registration` broadcast on port 38899
//! - [`TapoProbe`] / [`TuyaProbe`]: configured hosts, checked over TCP
//!
//! A failing probe only fails its own pass: the error is logged and emitted
//! as `discovery.probeFailed`, nothing is marked lost, and the other probes
//! carry on.

mod configured;
mod mdns;
mod net;
mod probe;
mod types;
mod wiz;
mod window;

pub use configured::{TapoProbe, TuyaProbe};
pub use mdns::CastProbe;
pub use probe::{probe_passes, DiscoveryProbe, PassSchedule};
pub use types::{DiscoveryError, DiscoveryResult, Sighting};
pub use wiz::WizProbe;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::window::{Known, SightingWindow};
use crate::adapters::TapoAdapter;
use crate::bridge::CommandBridge;
use crate::config::{Config, CredentialStore};
use crate::events::{DiscoveryEvent, EventEmitter};
use crate::model::Protocol;
use crate::registry::Registry;
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;

/// Discovery tunables.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Period of continuous discovery; `None` when only rescans trigger passes.
    pub every: Option<Duration>,
    pub sighting_window: Duration,
}

impl DiscoverySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            every: config
                .auto_discovery
                .then(|| config.discovery_interval()),
            sighting_window: config.sighting_window(),
        }
    }
}

/// The standard probe set, one per protocol.
pub fn default_probes(
    config: &Config,
    credentials: CredentialStore,
    tapo: Arc<TapoAdapter>,
    bridge: CommandBridge,
) -> Vec<Arc<dyn DiscoveryProbe>> {
    vec![
        Arc::new(CastProbe::new(Duration::from_millis(
            config.mdns_browse_timeout_ms,
        ))),
        Arc::new(WizProbe::new(
            Duration::from_millis(config.wiz_discovery_timeout_ms),
            config.operation_timeout(),
            bridge.clone(),
        )),
        Arc::new(TapoProbe::new(credentials.clone(), tapo, bridge.clone())),
        Arc::new(TuyaProbe::new(credentials, bridge)),
    ]
}

/// Drives the probes and reconciles their passes with the registry.
#[derive(Clone)]
pub struct DiscoveryOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    probes: Vec<Arc<dyn DiscoveryProbe>>,
    registry: Registry,
    emitter: Arc<dyn EventEmitter>,
    settings: DiscoverySettings,
    window: Mutex<SightingWindow>,
    rescan: watch::Sender<u64>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl DiscoveryOrchestrator {
    /// Creates an orchestrator. Only the first probe for each protocol is
    /// kept, since departures are judged per protocol.
    pub fn new(
        probes: Vec<Arc<dyn DiscoveryProbe>>,
        registry: Registry,
        emitter: Arc<dyn EventEmitter>,
        settings: DiscoverySettings,
    ) -> Self {
        let mut protocols = HashSet::new();
        let probes = probes
            .into_iter()
            .filter(|probe| {
                let fresh = protocols.insert(probe.protocol());
                if !fresh {
                    log::warn!(
                        "[Discovery] Ignoring second probe for {}",
                        probe.protocol()
                    );
                }
                fresh
            })
            .collect();

        let (rescan, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                probes,
                registry,
                emitter,
                window: Mutex::new(SightingWindow::new(settings.sighting_window)),
                settings,
                rescan,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        self.inner.probes.iter().map(|p| p.protocol()).collect()
    }

    /// Spawns one task per probe. Returns false if already started or stopped.
    pub fn start(&self) -> bool {
        if self.inner.cancel.is_cancelled() || self.inner.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let protocols = self.protocols();
        log::info!(
            "[Discovery] Starting probes for {:?} ({})",
            protocols,
            match self.inner.settings.every {
                Some(every) => format!("every {}s", every.as_secs()),
                None => "on demand".to_string(),
            }
        );
        self.inner.emitter.emit_discovery(DiscoveryEvent::Started {
            protocols,
            timestamp: now_millis(),
        });

        for probe in &self.inner.probes {
            let this = self.clone();
            let probe = probe.clone();
            self.inner
                .registry
                .spawner()
                .spawn(async move { this.run_probe(probe).await });
        }
        true
    }

    /// Requests one extra full pass of every probe.
    pub fn rescan(&self) -> DiscoveryResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(DiscoveryError::Unavailable("discovery is stopped".into()));
        }
        log::info!("[Discovery] Rescan requested");
        self.inner.rescan.send_modify(|requests| *requests += 1);
        Ok(())
    }

    /// Stops every probe task. Passes in progress are abandoned.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        let was_running = self.inner.started.load(Ordering::SeqCst)
            && !self.inner.stopped.swap(true, Ordering::SeqCst);
        if was_running {
            log::info!("[Discovery] Stopped");
            self.inner.emitter.emit_discovery(DiscoveryEvent::Stopped {
                timestamp: now_millis(),
            });
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }

    async fn run_probe(self, probe: Arc<dyn DiscoveryProbe>) {
        let protocol = probe.protocol();
        let passes = probe_passes(
            probe,
            PassSchedule {
                every: self.inner.settings.every,
                rescan: self.inner.rescan.subscribe(),
            },
        );
        futures::pin_mut!(passes);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                pass = passes.next() => match pass {
                    Some(result) => self.complete_pass(protocol, result),
                    None => break,
                },
            }
        }
        log::debug!("[Discovery] {} probe stopped", protocol);
    }

    fn complete_pass(&self, protocol: Protocol, result: DiscoveryResult<Vec<Sighting>>) {
        let sightings = match result {
            Ok(sightings) => sightings,
            Err(e) => {
                log::warn!("[Discovery] {} pass failed: {}", protocol, e);
                self.inner.emitter.emit_discovery(DiscoveryEvent::ProbeFailed {
                    protocol,
                    message: e.to_string(),
                    timestamp: now_millis(),
                });
                return;
            }
        };

        let registry = &self.inner.registry;
        let now = Instant::now();
        let mut seen = HashSet::new();
        let forwarded: Vec<Sighting> = {
            let mut window = self.inner.window.lock();
            window.prune(now);
            sightings
                .into_iter()
                .filter(|sighting| {
                    if sighting.protocol() != protocol {
                        log::warn!(
                            "[Discovery] {} probe reported foreign device {}",
                            protocol,
                            sighting.id
                        );
                        return false;
                    }
                    seen.insert(sighting.id.clone())
                })
                .filter(|sighting| {
                    let known = if !registry.contains(&sighting.id) {
                        Known::Absent
                    } else if registry.is_pending_loss(&sighting.id) {
                        Known::PendingLoss
                    } else {
                        Known::Present
                    };
                    window.admit(sighting, known, now)
                })
                .collect()
        };

        for sighting in forwarded {
            if let Err(e) = registry.register(sighting.to_descriptor(now_millis())) {
                log::warn!("[Discovery] Could not register {}: {}", sighting.id, e);
            }
        }

        let mut departed = 0;
        for id in registry.ids_for_protocol(protocol) {
            if !seen.contains(&id) && registry.mark_lost(&id) {
                departed += 1;
            }
        }

        log::debug!(
            "[Discovery] {} pass: {} seen, {} newly missing",
            protocol,
            seen.len(),
            departed
        );
        self.inner.emitter.emit_discovery(DiscoveryEvent::PassCompleted {
            protocol,
            sightings: seen.len(),
            timestamp: now_millis(),
        });
    }
}
