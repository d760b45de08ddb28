//! Command tickets: the caller's handle on a queued command.

use serde::Serialize;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::DeviceError;
use crate::model::{DeviceCommand, DeviceId, DeviceState};

/// Final outcome of a queued command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CommandOutcome {
    /// The device acknowledged the command; carries the resulting state.
    Applied { state: DeviceState },
    /// The command failed after retries.
    Failed {
        #[serde(serialize_with = "serialize_error")]
        error: DeviceError,
    },
    /// A later command of the same kind replaced it before it started.
    Superseded,
    /// The device was removed or the hub shut down before it started.
    Cancelled,
}

fn serialize_error<S: serde::Serializer>(error: &DeviceError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Handle returned by `invoke`.
///
/// Poll it with [`try_outcome`](Self::try_outcome) from a presentation loop or
/// await [`outcome`](Self::outcome) from async code. Dropping the ticket does
/// not cancel the command.
#[derive(Debug)]
pub struct CommandTicket {
    device_id: DeviceId,
    command: DeviceCommand,
    rx: oneshot::Receiver<CommandOutcome>,
    resolved: Option<CommandOutcome>,
}

/// Resolving side of a [`CommandTicket`], held by the device lane.
#[derive(Debug)]
pub(crate) struct TicketSender(oneshot::Sender<CommandOutcome>);

impl TicketSender {
    pub(crate) fn resolve(self, outcome: CommandOutcome) {
        // The caller may have dropped its ticket.
        let _ = self.0.send(outcome);
    }
}

impl CommandTicket {
    pub(crate) fn pair(device_id: DeviceId, command: DeviceCommand) -> (TicketSender, Self) {
        let (tx, rx) = oneshot::channel();
        let ticket = Self {
            device_id,
            command,
            rx,
            resolved: None,
        };
        (TicketSender(tx), ticket)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The normalized command as it was queued.
    pub fn command(&self) -> &DeviceCommand {
        &self.command
    }

    /// Returns the outcome if the command has finished, without waiting.
    pub fn try_outcome(&mut self) -> Option<CommandOutcome> {
        if self.resolved.is_none() {
            self.resolved = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => Some(CommandOutcome::Cancelled),
            };
        }
        self.resolved.clone()
    }

    /// Waits for the outcome.
    pub async fn outcome(self) -> CommandOutcome {
        if let Some(outcome) = self.resolved {
            return outcome;
        }
        self.rx.await.unwrap_or(CommandOutcome::Cancelled)
    }
}
