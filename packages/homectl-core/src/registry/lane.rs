//! Per-device lanes.
//!
//! Each registered device gets one lane task. The lane owns the device's
//! command queue and is the only place that talks to its adapter, so
//! commands, polls and push reports for one device never overlap while
//! different devices proceed independently.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::retry::with_retry;
use super::{FailureOrigin, Registry};
use crate::adapters::{apply_once, fetch_once, DeviceAdapter};
use crate::bridge::{CommandOutcome, TicketSender};
use crate::error::DeviceError;
use crate::model::{DeviceCommand, DeviceId, StatePatch, Transport};
use crate::protocol_constants::{
    PUSH_CHANNEL_CAPACITY, PUSH_RECONNECT_BASE_MS, PUSH_RECONNECT_MAX_SECS,
};
use crate::runtime::TaskSpawner;

struct Queued {
    command: DeviceCommand,
    ticket: TicketSender,
}

#[derive(Default)]
struct LaneQueue {
    pending: VecDeque<Queued>,
    in_flight: bool,
}

impl LaneQueue {
    fn is_busy(&self) -> bool {
        self.in_flight || !self.pending.is_empty()
    }
}

#[derive(Default)]
struct LaneShared {
    queue: Mutex<LaneQueue>,
    wake: Notify,
}

/// The registry's handle on a lane.
#[derive(Clone)]
pub(super) struct LaneHandle {
    shared: Arc<LaneShared>,
    cancel: CancellationToken,
}

impl LaneHandle {
    /// Queues a command behind whatever the lane is doing.
    ///
    /// A queued, not yet started command of the same kind is dropped and its
    /// ticket resolves as superseded.
    pub(super) fn enqueue(&self, id: &DeviceId, command: DeviceCommand, ticket: TicketSender) {
        let superseded = {
            let mut queue = self.shared.queue.lock();
            let replaced = queue
                .pending
                .iter()
                .position(|queued| queued.command.kind() == command.kind())
                .and_then(|index| queue.pending.remove(index));
            queue.pending.push_back(Queued { command, ticket });
            replaced
        };

        if let Some(old) = superseded {
            log::debug!("[Registry] {} {:?} superseded", id, old.command);
            old.ticket.resolve(CommandOutcome::Superseded);
        }
        self.shared.wake.notify_one();
    }

    pub(super) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(super) fn is_busy(&self) -> bool {
        self.shared.queue.lock().is_busy()
    }
}

/// The lane task itself.
pub(super) struct Lane {
    registry: Registry,
    id: DeviceId,
    adapter: Arc<dyn DeviceAdapter>,
    shared: Arc<LaneShared>,
    cancel: CancellationToken,
}

impl Lane {
    pub(super) fn new(
        registry: &Registry,
        id: DeviceId,
        adapter: Arc<dyn DeviceAdapter>,
        cancel: CancellationToken,
    ) -> (LaneHandle, Self) {
        let shared = Arc::new(LaneShared::default());
        let handle = LaneHandle {
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let lane = Self {
            registry: registry.clone(),
            id,
            adapter,
            shared,
            cancel,
        };
        (handle, lane)
    }

    pub(super) async fn run(self) {
        let transport = self.adapter.transport();
        let mut poll = match (transport, self.registry.settings().poll_interval) {
            (Transport::Poll, Some(period)) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Some(interval)
            }
            _ => None,
        };

        let (patch_tx, mut patch_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let push = transport == Transport::Push;
        if push {
            let watcher = Watcher {
                registry: self.registry.clone(),
                id: self.id.clone(),
                adapter: self.adapter.clone(),
                cancel: self.cancel.clone(),
            };
            self.registry.spawner().spawn(watcher.run(patch_tx));
        } else {
            drop(patch_tx);
        }

        log::debug!("[Registry] Lane for {} started ({:?})", self.id, transport);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.shared.wake.notified() => self.drain_queue().await,
                Some(patch) = patch_rx.recv(), if push => {
                    self.registry.record_patch(&self.id, &patch);
                }
                _ = tick(&mut poll), if poll.is_some() => self.poll_once().await,
            }
        }

        let cancelled: Vec<Queued> = self.shared.queue.lock().pending.drain(..).collect();
        for queued in cancelled {
            queued.ticket.resolve(CommandOutcome::Cancelled);
        }
        log::debug!("[Registry] Lane for {} stopped", self.id);
    }

    /// Runs queued commands one at a time until the queue is empty.
    async fn drain_queue(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let next = {
                let mut queue = self.shared.queue.lock();
                let next = queue.pending.pop_front();
                queue.in_flight = next.is_some();
                next
            };
            let Some(queued) = next else {
                return;
            };

            let outcome = self.execute(queued.command).await;
            self.shared.queue.lock().in_flight = false;
            queued.ticket.resolve(outcome);
        }
    }

    async fn execute(&self, command: DeviceCommand) -> CommandOutcome {
        let Some(context) = self.registry.lane_context(&self.id) else {
            return CommandOutcome::Cancelled;
        };
        if let Some(reason) = context.blocked {
            let error = DeviceError::ConfigurationError(reason);
            self.registry
                .record_failure(&self.id, &error, FailureOrigin::Command);
            return CommandOutcome::Failed { error };
        }

        let label = format!("{} {:?}", self.id, command.kind());
        let label = label.as_str();
        let bridge = self.registry.bridge();
        let adapter = self.adapter.as_ref();
        let descriptor = &context.descriptor;
        let command_ref = &command;
        let delays = &self.registry.settings().retry_delays;

        let result = with_retry(label, delays, move || {
            bridge.run(label, apply_once(adapter, descriptor, command_ref))
        })
        .await;

        match result {
            Ok(()) => match self.registry.record_applied(&self.id, &command) {
                Some(state) => CommandOutcome::Applied { state },
                None => CommandOutcome::Cancelled,
            },
            Err(error) => {
                log::warn!("[Registry] {} failed: {}", label, error);
                self.registry
                    .record_failure(&self.id, &error, FailureOrigin::Command);
                CommandOutcome::Failed { error }
            }
        }
    }

    async fn poll_once(&self) {
        if self.shared.queue.lock().is_busy() {
            return;
        }
        let Some(context) = self.registry.lane_context(&self.id) else {
            return;
        };
        if context.blocked.is_some() {
            return;
        }

        let label = format!("{} poll", self.id);
        let result = self
            .registry
            .bridge()
            .run(&label, fetch_once(self.adapter.as_ref(), &context.descriptor))
            .await;
        match result {
            Ok(state) => self.registry.record_observation(&self.id, state),
            Err(error) => {
                log::debug!("[Registry] {} failed: {}", label, error);
                self.registry
                    .record_failure(&self.id, &error, FailureOrigin::Poll);
            }
        }
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Push subscriptions
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps a push subscription open, reconnecting with backoff.
struct Watcher {
    registry: Registry,
    id: DeviceId,
    adapter: Arc<dyn DeviceAdapter>,
    cancel: CancellationToken,
}

impl Watcher {
    async fn run(self, sink: mpsc::Sender<StatePatch>) {
        let max_delay = Duration::from_secs(PUSH_RECONNECT_MAX_SECS);
        let mut failures = 0u32;

        loop {
            let Some(context) = self.registry.lane_context(&self.id) else {
                return;
            };

            let delay = if context.blocked.is_some() {
                max_delay
            } else {
                let started = Instant::now();
                let result = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    result = self.adapter.watch(&context.descriptor, sink.clone()) => result,
                };
                match result {
                    // The lane went away.
                    Ok(()) => return,
                    Err(error) => {
                        log::debug!("[Registry] Push feed for {} lost: {}", self.id, error);
                        self.registry
                            .record_failure(&self.id, &error, FailureOrigin::Push);
                    }
                }
                if started.elapsed() >= max_delay {
                    failures = 0;
                }
                let delay = reconnect_delay(failures, max_delay);
                failures = failures.saturating_add(1);
                delay
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn reconnect_delay(failures: u32, max: Duration) -> Duration {
    let base = Duration::from_millis(PUSH_RECONNECT_BASE_MS);
    base.saturating_mul(2u32.saturating_pow(failures.min(16))).min(max)
}
