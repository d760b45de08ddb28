//! Device registry: the single owner of every descriptor and state.
//!
//! All reads hand out clones. All writes go through the methods below, which
//! update the entry under a short lock and publish events after the lock is
//! released. Device I/O never happens here; it runs on the per-device lanes
//! (see [`lane`]).

mod lane;
mod retry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use self::lane::{Lane, LaneHandle};
use crate::adapters::AdapterSet;
use crate::bridge::{CommandBridge, CommandTicket};
use crate::config::Config;
use crate::error::{DeviceError, DeviceResult};
use crate::events::{DeviceEvent, EventEmitter};
use crate::model::{
    Command, DeviceCommand, DeviceDescriptor, DeviceId, DeviceKind, DeviceState, Protocol,
    StatePatch,
};
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::utils::now_millis;

/// Registry tunables.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// `None` disables polling.
    pub poll_interval: Option<Duration>,
    pub grace_period: Duration,
    pub retry_delays: Vec<Duration>,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            grace_period: config.grace_period(),
            retry_delays: config.retry_delays(),
        }
    }
}

/// Point-in-time copy of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub descriptor: DeviceDescriptor,
    pub state: DeviceState,
}

/// What [`Registry::register`] did with a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First sighting; the device was added and announced.
    Inserted,
    /// Known device whose descriptor changed or whose loss was pending.
    Updated,
    /// Known device, nothing new.
    Unchanged,
}

/// Where a failure came from; decides whether it is announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOrigin {
    Command,
    Poll,
    Push,
}

struct LostMark {
    generation: u64,
    cancel: CancellationToken,
}

struct Entry {
    descriptor: DeviceDescriptor,
    state: DeviceState,
    lane: LaneHandle,
    lost: Option<LostMark>,
    /// Set by a `ConfigurationError`; cleared by [`Registry::unblock_all`].
    blocked: Option<String>,
}

impl Entry {
    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            descriptor: self.descriptor.clone(),
            state: self.state.clone(),
        }
    }
}

/// What a lane needs to run one operation.
pub(crate) struct LaneContext {
    pub descriptor: DeviceDescriptor,
    pub blocked: Option<String>,
}

struct Inner {
    entries: RwLock<BTreeMap<DeviceId, Entry>>,
    adapters: AdapterSet,
    bridge: CommandBridge,
    emitter: Arc<dyn EventEmitter>,
    settings: RegistrySettings,
    spawner: TokioSpawner,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

/// The authoritative set of known devices.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new(
        adapters: AdapterSet,
        bridge: CommandBridge,
        emitter: Arc<dyn EventEmitter>,
        settings: RegistrySettings,
        spawner: TokioSpawner,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(BTreeMap::new()),
                adapters,
                bridge,
                emitter,
                settings,
                spawner,
                shutdown: CancellationToken::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Discovery entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Inserts a new device or refreshes a known one.
    ///
    /// Only the first insert emits `discovered` and starts the device's lane.
    /// Any pending loss is cancelled.
    pub fn register(&self, descriptor: DeviceDescriptor) -> DeviceResult<Registration> {
        let id = descriptor.id.clone();
        let mut entries = self.inner.entries.write();

        if let Some(entry) = entries.get_mut(&id) {
            let recovered = match entry.lost.take() {
                Some(mark) => {
                    mark.cancel.cancel();
                    true
                }
                None => false,
            };
            let current = &entry.descriptor;
            let changed = current.address != descriptor.address
                || current.display_name != descriptor.display_name
                || current.model != descriptor.model
                || current.capabilities != descriptor.capabilities;

            entry.descriptor = DeviceDescriptor {
                id: current.id.clone(),
                kind: current.kind,
                protocol: current.protocol,
                ..descriptor
            };
            drop(entries);

            if recovered {
                log::info!("[Registry] {} seen again, loss cancelled", id);
            }
            return Ok(if changed || recovered {
                Registration::Updated
            } else {
                Registration::Unchanged
            });
        }

        if self.inner.shutdown.is_cancelled() {
            return Err(DeviceError::ConfigurationError("registry is shut down".into()));
        }
        let adapter = self.inner.adapters.get(descriptor.protocol)?;
        let (handle, lane) = Lane::new(
            self,
            id.clone(),
            adapter,
            self.inner.shutdown.child_token(),
        );
        entries.insert(
            id.clone(),
            Entry {
                descriptor: descriptor.clone(),
                state: DeviceState::discovered(now_millis()),
                lane: handle,
                lost: None,
                blocked: None,
            },
        );
        drop(entries);

        self.inner.spawner.spawn(lane.run());
        log::info!(
            "[Registry] Registered {} \"{}\" at {}",
            id,
            descriptor.display_name,
            descriptor.address
        );
        self.emit(DeviceEvent::Discovered {
            descriptor,
            timestamp: now_millis(),
        });
        Ok(Registration::Inserted)
    }

    /// Starts the grace period for a device discovery no longer sees.
    ///
    /// Returns false if the device is unknown or already pending loss; a
    /// pending grace period is never restarted.
    pub fn mark_lost(&self, id: &DeviceId) -> bool {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        {
            let mut entries = self.inner.entries.write();
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };
            if entry.lost.is_some() {
                return false;
            }
            entry.lost = Some(LostMark {
                generation,
                cancel: cancel.clone(),
            });
        }

        let grace = self.inner.settings.grace_period;
        log::info!(
            "[Registry] {} missing, removing in {}s unless seen again",
            id,
            grace.as_secs()
        );
        let registry = self.clone();
        let id = id.clone();
        self.inner.spawner.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => registry.expire(&id, generation),
            }
        });
        true
    }

    fn expire(&self, id: &DeviceId, generation: u64) {
        let removed = {
            let mut entries = self.inner.entries.write();
            let current = entries
                .get(id)
                .and_then(|entry| entry.lost.as_ref())
                .map(|mark| mark.generation);
            if current == Some(generation) {
                entries.remove(id)
            } else {
                None
            }
        };

        if let Some(entry) = removed {
            entry.lane.stop();
            log::info!("[Registry] {} lost", id);
            self.emit(DeviceEvent::Lost {
                device_id: id.clone(),
                timestamp: now_millis(),
            });
        }
    }

    pub fn is_pending_loss(&self, id: &DeviceId) -> bool {
        self.inner
            .entries
            .read()
            .get(id)
            .is_some_and(|entry| entry.lost.is_some())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Validates a command and queues it on the device's lane.
    ///
    /// Never waits on I/O. Rejections are returned and also published as a
    /// device `error` event; they leave state untouched.
    pub fn invoke(&self, id: &DeviceId, command: Command) -> DeviceResult<CommandTicket> {
        let checked = {
            let entries = self.inner.entries.read();
            let entry = entries
                .get(id)
                .ok_or_else(|| DeviceError::UnknownDevice(id.to_string()))?;
            let checked = match &entry.blocked {
                Some(reason) => Err(DeviceError::ConfigurationError(reason.clone())),
                None => command.normalize(&entry.descriptor.capabilities),
            };
            checked.map(|normalized| (normalized, entry.lane.clone()))
        };

        let (normalized, lane) = match checked {
            Ok(checked) => checked,
            Err(error) => {
                log::debug!("[Registry] Rejected {:?} for {}: {}", command, id, error);
                self.emit_error(id, &error);
                return Err(error);
            }
        };

        let (sender, ticket) = CommandTicket::pair(id.clone(), normalized);
        lane.enqueue(id, normalized, sender);
        Ok(ticket)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.inner
            .entries
            .read()
            .values()
            .map(Entry::snapshot)
            .collect()
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.inner.entries.read().get(id).map(Entry::snapshot)
    }

    pub fn devices_by_protocol(&self, protocol: Protocol) -> Vec<DeviceSnapshot> {
        self.filtered(|entry| entry.descriptor.protocol == protocol)
    }

    pub fn devices_by_kind(&self, kind: DeviceKind) -> Vec<DeviceSnapshot> {
        self.filtered(|entry| entry.descriptor.kind == kind)
    }

    /// Devices whose last operation succeeded.
    pub fn online_devices(&self) -> Vec<DeviceSnapshot> {
        self.filtered(|entry| entry.state.reachable)
    }

    fn filtered(&self, keep: impl Fn(&Entry) -> bool) -> Vec<DeviceSnapshot> {
        self.inner
            .entries
            .read()
            .values()
            .filter(|entry| keep(entry))
            .map(Entry::snapshot)
            .collect()
    }

    /// Ids of the known devices of one protocol.
    pub fn ids_for_protocol(&self, protocol: Protocol) -> Vec<DeviceId> {
        self.inner
            .entries
            .read()
            .keys()
            .filter(|id| id.protocol() == protocol)
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.inner.entries.read().contains_key(id)
    }

    pub fn is_blocked(&self, id: &DeviceId) -> bool {
        self.inner
            .entries
            .read()
            .get(id)
            .is_some_and(|entry| entry.blocked.is_some())
    }

    /// True while the device has a command queued or in flight.
    pub fn is_busy(&self, id: &DeviceId) -> bool {
        self.inner
            .entries
            .read()
            .get(id)
            .is_some_and(|entry| entry.lane.is_busy())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Lifts every configuration block. Returns how many devices were blocked.
    pub fn unblock_all(&self) -> usize {
        let mut entries = self.inner.entries.write();
        let mut count = 0;
        for entry in entries.values_mut() {
            if entry.blocked.take().is_some() {
                count += 1;
            }
        }
        if count > 0 {
            log::info!("[Registry] Unblocked {} device(s)", count);
        }
        count
    }

    /// Stops every lane and pending grace timer. Queued commands resolve as
    /// cancelled; commands already in flight run to completion.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lane callbacks
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub(crate) fn bridge(&self) -> &CommandBridge {
        &self.inner.bridge
    }

    pub(crate) fn spawner(&self) -> &TokioSpawner {
        &self.inner.spawner
    }

    pub(crate) fn lane_context(&self, id: &DeviceId) -> Option<LaneContext> {
        self.inner.entries.read().get(id).map(|entry| LaneContext {
            descriptor: entry.descriptor.clone(),
            blocked: entry.blocked.clone(),
        })
    }

    /// Records an acknowledged command. Always announces the new state.
    ///
    /// Every successful exchange with the device also refreshes `last_seen`.
    pub(crate) fn record_applied(&self, id: &DeviceId, command: &DeviceCommand) -> Option<DeviceState> {
        let state = {
            let mut entries = self.inner.entries.write();
            let entry = entries.get_mut(id)?;
            let now = now_millis();
            entry.state.apply_command(command);
            entry.state.reachable = true;
            entry.state.last_updated = now;
            entry.descriptor.last_seen = now;
            entry.state.clone()
        };
        self.emit_state(id, state.clone());
        Some(state)
    }

    /// Records a full state read. Announces it only if something changed.
    pub(crate) fn record_observation(&self, id: &DeviceId, mut observed: DeviceState) {
        observed.reachable = true;
        observed.last_updated = now_millis();
        let changed = {
            let mut entries = self.inner.entries.write();
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            entry.descriptor.last_seen = observed.last_updated;
            if entry.state.same_observation(&observed) {
                entry.state.last_updated = observed.last_updated;
                false
            } else {
                entry.state = observed.clone();
                true
            }
        };
        if changed {
            self.emit_state(id, observed);
        }
    }

    /// Merges a push report. Announces it only if something changed.
    pub(crate) fn record_patch(&self, id: &DeviceId, patch: &StatePatch) {
        let changed = {
            let mut entries = self.inner.entries.write();
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            let mut next = entry.state.clone();
            next.apply_patch(patch);
            next.reachable = true;
            next.last_updated = now_millis();
            entry.descriptor.last_seen = next.last_updated;
            if entry.state.same_observation(&next) {
                entry.state.last_updated = next.last_updated;
                None
            } else {
                entry.state = next.clone();
                Some(next)
            }
        };
        if let Some(state) = changed {
            self.emit_state(id, state);
        }
    }

    /// Records a failed operation.
    ///
    /// Device failures mark the entry unreachable and keep every other field.
    /// Command failures are always announced; poll and push failures only on
    /// the reachable to unreachable transition.
    pub(crate) fn record_failure(&self, id: &DeviceId, error: &DeviceError, origin: FailureOrigin) {
        let announce = {
            let mut entries = self.inner.entries.write();
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            let was_reachable = entry.state.reachable;
            if error.is_device_failure() {
                entry.state.reachable = false;
            }
            if error.is_terminal() && entry.blocked.is_none() {
                log::warn!("[Registry] {} blocked until reconfigured: {}", id, error);
                entry.blocked = Some(error.to_string());
            }
            match origin {
                FailureOrigin::Command => true,
                FailureOrigin::Poll | FailureOrigin::Push => {
                    was_reachable && error.is_device_failure()
                }
            }
        };
        if announce {
            self.emit_error(id, error);
        }
    }

    fn emit(&self, event: DeviceEvent) {
        self.inner.emitter.emit_device(event);
    }

    fn emit_state(&self, id: &DeviceId, state: DeviceState) {
        self.emit(DeviceEvent::StateChanged {
            device_id: id.clone(),
            state,
            timestamp: now_millis(),
        });
    }

    fn emit_error(&self, id: &DeviceId, error: &DeviceError) {
        self.emit(DeviceEvent::Error {
            device_id: id.clone(),
            kind: error.kind(),
            message: error.to_string(),
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{MockAdapter, Step};
    use crate::bridge::CommandOutcome;
    use crate::error::ErrorKind;
    use crate::events::{BroadcastEvent, EventBus, EventSubscription};
    use crate::model::{Endpoint, MediaPatch, Rgb};
    use std::sync::atomic::Ordering;

    fn settings(poll_interval: Option<Duration>) -> RegistrySettings {
        RegistrySettings {
            poll_interval,
            grace_period: Duration::from_secs(120),
            retry_delays: [200, 500, 1000].map(Duration::from_millis).to_vec(),
        }
    }

    fn setup_with(
        mock: MockAdapter,
        poll_interval: Option<Duration>,
    ) -> (Registry, Arc<MockAdapter>, EventSubscription) {
        let bus = EventBus::new(256);
        let subscription = bus.subscribe();
        let mock = Arc::new(mock);
        let mut adapters = AdapterSet::new();
        adapters.insert(mock.clone());
        let registry = Registry::new(
            adapters,
            CommandBridge::new(4, Duration::from_secs(5)),
            Arc::new(bus),
            settings(poll_interval),
            TokioSpawner::current(),
        );
        (registry, mock, subscription)
    }

    fn setup() -> (Registry, Arc<MockAdapter>, EventSubscription) {
        setup_with(MockAdapter::new(Protocol::Wiz), None)
    }

    fn bulb(identity: &str, host: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(Protocol::Wiz, identity),
            display_name: format!("Bulb {identity}"),
            kind: DeviceKind::Light,
            protocol: Protocol::Wiz,
            capabilities: Protocol::Wiz.default_capabilities(),
            address: Endpoint::new(host, 38899),
            model: None,
            last_seen: 0,
        }
    }

    fn device_events(subscription: &mut EventSubscription) -> Vec<DeviceEvent> {
        subscription
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                BroadcastEvent::Device(event) => Some(event),
                BroadcastEvent::Discovery(_) => None,
            })
            .collect()
    }

    fn count(events: &[DeviceEvent], pred: impl Fn(&DeviceEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_registration_keeps_one_entry_with_latest_descriptor() {
        let (registry, _, mut events) = setup();
        assert_eq!(
            registry.register(bulb("a1", "10.0.0.5")).unwrap(),
            Registration::Inserted
        );
        assert_eq!(
            registry.register(bulb("a1", "10.0.0.5")).unwrap(),
            Registration::Unchanged
        );
        let mut moved = bulb("a1", "10.0.0.9");
        moved.display_name = "Desk".into();
        assert_eq!(registry.register(moved).unwrap(), Registration::Updated);

        assert_eq!(registry.len(), 1);
        let entry = registry.get(&DeviceId::new(Protocol::Wiz, "a1")).unwrap();
        assert_eq!(entry.descriptor.address.host, "10.0.0.9");
        assert_eq!(entry.descriptor.display_name, "Desk");

        let events = device_events(&mut events);
        assert_eq!(
            count(&events, |e| matches!(e, DeviceEvent::Discovered { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rediscovery_within_grace_period_keeps_the_device() {
        let (registry, _, mut events) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();

        assert!(registry.mark_lost(&id));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            registry.register(bulb("a1", "10.0.0.5")).unwrap(),
            Registration::Updated
        );
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(registry.contains(&id));
        assert!(!registry.is_pending_loss(&id));
        let events = device_events(&mut events);
        assert_eq!(count(&events, |e| matches!(e, DeviceEvent::Lost { .. })), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_removes_the_device_once_without_restarting_the_timer() {
        let (registry, _, mut events) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();

        assert!(registry.mark_lost(&id));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!registry.mark_lost(&id));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(!registry.contains(&id));
        tokio::time::sleep(Duration::from_secs(300)).await;
        let events = device_events(&mut events);
        assert_eq!(count(&events, |e| matches!(e, DeviceEvent::Lost { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_marks_unreachable_without_resetting_state() {
        let (registry, mock, mut events) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        device_events(&mut events);

        let ticket = registry.invoke(&id, Command::set_power(true)).unwrap();
        assert!(matches!(
            ticket.outcome().await,
            CommandOutcome::Applied { state } if state.power
        ));
        let after_power = device_events(&mut events);
        assert_eq!(after_power.len(), 1);
        assert!(matches!(
            &after_power[0],
            DeviceEvent::StateChanged { state, .. } if state.power
        ));

        // The first attempt and all three retries hang past the timeout.
        mock.script(&id, [Step::Hang, Step::Hang, Step::Hang, Step::Hang]);
        let ticket = registry.invoke(&id, Command::set_brightness(50)).unwrap();
        let outcome = ticket.outcome().await;
        assert!(matches!(
            outcome,
            CommandOutcome::Failed {
                error: DeviceError::DeviceUnreachable(_)
            }
        ));

        let after_timeout = device_events(&mut events);
        assert_eq!(after_timeout.len(), 1);
        assert!(matches!(
            &after_timeout[0],
            DeviceEvent::Error {
                kind: ErrorKind::DeviceUnreachable,
                ..
            }
        ));
        let state = registry.get(&id).unwrap().state;
        assert!(!state.reachable);
        assert!(state.power);
        assert_eq!(state.brightness, None);
    }

    #[tokio::test(start_paused = true)]
    async fn arguments_are_clamped_or_rejected_at_the_boundary() {
        let (registry, _, _) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();

        let ticket = registry.invoke(&id, Command::set_brightness(150)).unwrap();
        assert_eq!(ticket.command(), &DeviceCommand::SetBrightness { level: 100 });

        let err = registry.invoke(&id, Command::set_color(300, 0, 0)).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_command_is_rejected_and_reported() {
        let (registry, mock, mut events) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        device_events(&mut events);
        let before = registry.get(&id).unwrap().state;

        let err = registry.invoke(&id, Command::set_volume(30)).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedCapability(_)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(registry.get(&id).unwrap().state, before);
        assert!(mock.applied().is_empty());
        let events = device_events(&mut events);
        assert!(matches!(
            events.as_slice(),
            [DeviceEvent::Error {
                kind: ErrorKind::UnsupportedCapability,
                ..
            }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_is_rejected() {
        let (registry, _, _) = setup();
        let err = registry
            .invoke(&DeviceId::new(Protocol::Wiz, "nope"), Command::set_power(true))
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownDevice(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn devices_do_not_block_each_other() {
        let (registry, mock, _) = setup();
        let slow = DeviceId::new(Protocol::Wiz, "slow");
        let fast = DeviceId::new(Protocol::Wiz, "fast");
        registry.register(bulb("slow", "10.0.0.5")).unwrap();
        registry.register(bulb("fast", "10.0.0.6")).unwrap();
        mock.script(&slow, [Step::Delay(Duration::from_secs(3))]);

        let start = tokio::time::Instant::now();
        let mut slow_ticket = registry.invoke(&slow, Command::set_power(true)).unwrap();
        let fast_ticket = registry.invoke(&fast, Command::set_power(true)).unwrap();

        assert!(matches!(
            fast_ticket.outcome().await,
            CommandOutcome::Applied { .. }
        ));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(slow_ticket.try_outcome(), None);

        assert!(matches!(
            slow_ticket.outcome().await,
            CommandOutcome::Applied { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_to_one_device_apply_in_issue_order() {
        let (registry, mock, _) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        mock.script(&id, [Step::Delay(Duration::from_millis(300))]);

        let tickets = vec![
            registry.invoke(&id, Command::set_power(true)).unwrap(),
            registry.invoke(&id, Command::set_brightness(30)).unwrap(),
            registry.invoke(&id, Command::set_color(0, 0, 255)).unwrap(),
        ];
        for ticket in tickets {
            assert!(matches!(ticket.outcome().await, CommandOutcome::Applied { .. }));
        }

        let applied: Vec<_> = mock.applied().into_iter().map(|(_, c)| c).collect();
        assert_eq!(
            applied,
            vec![
                DeviceCommand::SetPower { on: true },
                DeviceCommand::SetBrightness { level: 30 },
                DeviceCommand::SetColor {
                    color: Rgb::new(0, 0, 255)
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queued_command_is_superseded_by_a_later_one_of_the_same_kind() {
        let (registry, mock, mut events) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        mock.script(&id, [Step::Delay(Duration::from_secs(1))]);

        let power = registry.invoke(&id, Command::set_power(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_busy(&id));
        let first = registry.invoke(&id, Command::set_brightness(10)).unwrap();
        let second = registry.invoke(&id, Command::set_brightness(20)).unwrap();
        device_events(&mut events);

        assert_eq!(first.outcome().await, CommandOutcome::Superseded);
        assert!(matches!(power.outcome().await, CommandOutcome::Applied { .. }));
        assert!(matches!(second.outcome().await, CommandOutcome::Applied { .. }));

        let applied: Vec<_> = mock.applied().into_iter().map(|(_, c)| c).collect();
        assert_eq!(
            applied,
            vec![
                DeviceCommand::SetPower { on: true },
                DeviceCommand::SetBrightness { level: 20 },
            ]
        );
        let events = device_events(&mut events);
        assert_eq!(
            count(&events, |e| matches!(e, DeviceEvent::StateChanged { .. })),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_error_blocks_until_unblocked() {
        let (registry, mock, _) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        mock.script(
            &id,
            [Step::Fail(DeviceError::ConfigurationError("bad key".into()))],
        );

        let ticket = registry.invoke(&id, Command::set_power(true)).unwrap();
        assert!(matches!(
            ticket.outcome().await,
            CommandOutcome::Failed {
                error: DeviceError::ConfigurationError(_)
            }
        ));
        assert!(mock.state.lock().script[&id].is_empty());
        assert!(registry.is_blocked(&id));

        let err = registry.invoke(&id, Command::set_power(true)).unwrap_err();
        assert!(matches!(err, DeviceError::ConfigurationError(_)));

        assert_eq!(registry.unblock_all(), 1);
        let ticket = registry.invoke(&id, Command::set_power(true)).unwrap();
        assert!(matches!(ticket.outcome().await, CommandOutcome::Applied { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reports_changes_and_announces_failure_once() {
        let (registry, mock, mut events) =
            setup_with(MockAdapter::new(Protocol::Wiz), Some(Duration::from_secs(5)));
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        mock.set_device_state(
            &id,
            DeviceState {
                power: true,
                brightness: Some(80),
                ..DeviceState::default()
            },
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let events_so_far = device_events(&mut events);
        assert_eq!(
            count(&events_so_far, |e| matches!(e, DeviceEvent::StateChanged { .. })),
            1
        );
        assert_eq!(registry.get(&id).unwrap().state.brightness, Some(80));

        mock.fail_fetch(&id, Some(DeviceError::DeviceUnreachable("no reply".into())));
        tokio::time::sleep(Duration::from_secs(30)).await;
        let events_so_far = device_events(&mut events);
        assert_eq!(
            count(&events_so_far, |e| matches!(e, DeviceEvent::Error { .. })),
            1
        );
        let state = registry.get(&id).unwrap().state;
        assert!(!state.reachable);
        assert_eq!(state.brightness, Some(80));

        mock.fail_fetch(&id, None);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(registry.get(&id).unwrap().state.reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_polls_and_commands_refresh_last_seen() {
        let (registry, mock, _) =
            setup_with(MockAdapter::new(Protocol::Wiz), Some(Duration::from_secs(5)));
        let id = DeviceId::new(Protocol::Wiz, "a1");
        let mut descriptor = bulb("a1", "10.0.0.5");
        descriptor.last_seen = 1000;
        registry.register(descriptor).unwrap();

        // Unchanged state still counts as a sighting.
        tokio::time::sleep(Duration::from_secs(36)).await;
        let polled = registry.get(&id).unwrap();
        assert!(polled.state.reachable);
        assert!(polled.descriptor.last_seen > 1000);
        assert_eq!(polled.descriptor.last_seen, polled.state.last_updated);

        mock.fail_fetch(&id, Some(DeviceError::DeviceUnreachable("no reply".into())));
        let mut stale = polled.descriptor.clone();
        stale.last_seen = 1000;
        registry.register(stale).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        let failed = registry.get(&id).unwrap();
        assert!(!failed.state.reachable);
        assert_eq!(failed.descriptor.last_seen, 1000);

        let ticket = registry.invoke(&id, Command::set_power(true)).unwrap();
        assert!(matches!(ticket.outcome().await, CommandOutcome::Applied { .. }));
        assert!(registry.get(&id).unwrap().descriptor.last_seen > 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_are_skipped_while_a_command_is_in_flight() {
        let (registry, mock, _) =
            setup_with(MockAdapter::new(Protocol::Wiz), Some(Duration::from_secs(1)));
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        mock.script(&id, [Step::Delay(Duration::from_secs(4))]);
        let ticket = registry.invoke(&id, Command::set_power(true)).unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(mock.fetches.load(Ordering::SeqCst), 0);

        assert!(matches!(ticket.outcome().await, CommandOutcome::Applied { .. }));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(mock.fetches.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_reports_update_state_and_feed_loss_marks_unreachable() {
        let (registry, mock, mut events) = setup_with(MockAdapter::push(Protocol::Wiz), None);
        let id = DeviceId::new(Protocol::Wiz, "a1");
        let feed = mock.feed(&id);
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        device_events(&mut events);

        feed.send(StatePatch {
            volume: Some(40),
            media: MediaPatch::Keep,
            ..StatePatch::default()
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.get(&id).unwrap().state.volume, Some(40));

        drop(feed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!registry.get(&id).unwrap().state.reachable);

        let events = device_events(&mut events);
        assert_eq!(
            count(&events, |e| matches!(e, DeviceEvent::StateChanged { .. })),
            1
        );
        assert_eq!(count(&events, |e| matches!(e, DeviceEvent::Error { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_queued_commands() {
        let (registry, mock, _) = setup();
        let id = DeviceId::new(Protocol::Wiz, "a1");
        registry.register(bulb("a1", "10.0.0.5")).unwrap();
        mock.script(&id, [Step::Delay(Duration::from_secs(2))]);

        let running = registry.invoke(&id, Command::set_power(true)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = registry.invoke(&id, Command::set_brightness(40)).unwrap();
        registry.shutdown();

        assert!(matches!(running.outcome().await, CommandOutcome::Applied { .. }));
        assert_eq!(queued.outcome().await, CommandOutcome::Cancelled);
        assert!(registry
            .register(bulb("b2", "10.0.0.7"))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_ordered_and_filterable() {
        let (registry, _, _) = setup();
        registry.register(bulb("c3", "10.0.0.3")).unwrap();
        registry.register(bulb("a1", "10.0.0.1")).unwrap();
        registry.register(bulb("b2", "10.0.0.2")).unwrap();

        let ids: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|entry| entry.descriptor.id.to_string())
            .collect();
        assert_eq!(ids, ["wiz:a1", "wiz:b2", "wiz:c3"]);
        assert_eq!(registry.devices_by_kind(DeviceKind::Light).len(), 3);
        assert!(registry.devices_by_protocol(Protocol::Tapo).is_empty());
        assert_eq!(registry.online_devices().len(), 3);
        assert_eq!(registry.ids_for_protocol(Protocol::Wiz).len(), 3);
    }
}
