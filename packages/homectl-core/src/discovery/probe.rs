//! The probe abstraction and its pass stream.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

use super::types::{DiscoveryResult, Sighting};
use crate::model::Protocol;

/// One protocol family's way of finding devices.
///
/// `scan` performs one full pass and returns every device seen in it. A pass
/// that fails returns an error instead of a partial list, so a broken probe
/// never makes known devices look absent.
#[async_trait]
pub trait DiscoveryProbe: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn scan(&self) -> DiscoveryResult<Vec<Sighting>>;
}

/// When a probe runs.
#[derive(Debug, Clone)]
pub struct PassSchedule {
    /// Continuous discovery period; `None` runs passes only on rescan.
    pub every: Option<Duration>,
    /// Bumped once per requested rescan.
    pub rescan: watch::Receiver<u64>,
}

/// Lazily runs `probe` pass after pass, as scheduled.
///
/// With a period the first pass runs immediately. A rescan requested while a
/// pass is running yields exactly one more pass afterwards. The stream ends
/// when the rescan sender is dropped; calling this again restarts it.
pub fn probe_passes(
    probe: Arc<dyn DiscoveryProbe>,
    schedule: PassSchedule,
) -> impl Stream<Item = DiscoveryResult<Vec<Sighting>>> + Send {
    let PassSchedule { every, mut rescan } = schedule;
    stream! {
        let mut periodic = every.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        rescan.borrow_and_update();

        loop {
            tokio::select! {
                _ = tick(&mut periodic), if periodic.is_some() => {}
                changed = rescan.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    log::debug!("[Discovery] Rescan requested for {}", probe.protocol());
                }
            }
            yield probe.scan().await;
        }
    }
}

async fn tick(periodic: &mut Option<Interval>) {
    match periodic {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::discovery::types::DiscoveryError;

    /// Probe that replays scripted passes, repeating the last one.
    pub struct MockProbe {
        protocol: Protocol,
        passes: Mutex<VecDeque<DiscoveryResult<Vec<Sighting>>>>,
        last: Mutex<Vec<Sighting>>,
        scans: AtomicUsize,
    }

    impl MockProbe {
        pub fn new(protocol: Protocol) -> Self {
            Self {
                protocol,
                passes: Mutex::new(VecDeque::new()),
                last: Mutex::new(Vec::new()),
                scans: AtomicUsize::new(0),
            }
        }

        pub fn then(&self, sightings: Vec<Sighting>) -> &Self {
            self.passes.lock().push_back(Ok(sightings));
            self
        }

        pub fn then_fail(&self, message: &str) -> &Self {
            self.passes
                .lock()
                .push_back(Err(DiscoveryError::Unavailable(message.to_string())));
            self
        }

        pub fn scans(&self) -> usize {
            self.scans.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DiscoveryProbe for MockProbe {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        async fn scan(&self) -> DiscoveryResult<Vec<Sighting>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            match self.passes.lock().pop_front() {
                Some(Ok(sightings)) => {
                    *self.last.lock() = sightings.clone();
                    Ok(sightings)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().clone()),
            }
        }
    }
}
