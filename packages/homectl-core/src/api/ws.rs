//! WebSocket handler for real-time client communication.
//!
//! On connect the client receives an `INITIAL_STATE` snapshot, then every
//! event published on the bus. It may send `INVOKE`, `RESCAN` and
//! `HEARTBEAT` messages; command outcomes arrive later as `COMMAND_RESULT`
//! without holding up the event stream.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::bridge::CommandOutcome;
use crate::model::{Command, DeviceCommand, DeviceId};
use crate::protocol_constants::{WS_HEARTBEAT_CHECK_INTERVAL_SECS, WS_HEARTBEAT_TIMEOUT_SECS};
use crate::registry::DeviceSnapshot;

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Message Types
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming WebSocket message envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum WsIncoming {
    Heartbeat,
    Invoke { payload: InvokeRequest },
    Rescan,
}

/// `{"deviceId": "...", "requestId": "...", "command": "setPower", "on": true}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeRequest {
    device_id: String,
    /// Echoed back on the result so clients can match replies.
    #[serde(default)]
    request_id: Option<String>,
    #[serde(flatten)]
    command: Command,
}

/// Outgoing WebSocket message envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum WsOutgoing {
    InitialState { payload: InitialStatePayload },
    HeartbeatAck,
    CommandQueued { payload: CommandQueuedPayload },
    CommandResult { payload: CommandResultPayload },
    RescanStarted,
    Error { message: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitialStatePayload {
    devices: Vec<DeviceSnapshot>,
    discovery_running: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandQueuedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    device_id: DeviceId,
    command: DeviceCommand,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandResultPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    device_id: DeviceId,
    #[serde(flatten)]
    outcome: CommandOutcome,
}

impl WsOutgoing {
    /// Serializes the message to a WebSocket text message.
    fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self)
            .ok()
            .map(|s| Message::Text(s.into()))
    }

    fn error(message: impl ToString) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }
}

type WsSender = SplitSink<WebSocket, Message>;

/// Sends a message, returning false once the client is gone.
async fn send(sender: &mut WsSender, message: WsOutgoing) -> bool {
    match message.to_message() {
        Some(msg) => sender.send(msg).await.is_ok(),
        None => true,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Message Handlers
// ─────────────────────────────────────────────────────────────────────────────

fn build_initial_state(state: &AppState) -> WsOutgoing {
    WsOutgoing::InitialState {
        payload: InitialStatePayload {
            devices: state.registry.snapshot(),
            discovery_running: state.discovery.is_running(),
        },
    }
}

/// Queues the command and spawns a waiter that reports its outcome on
/// `results`. Returns the immediate reply.
fn handle_invoke(
    state: &AppState,
    request: InvokeRequest,
    results: &mpsc::Sender<WsOutgoing>,
) -> WsOutgoing {
    let id = match DeviceId::parse(&request.device_id) {
        Ok(id) => id,
        Err(e) => return WsOutgoing::error(e),
    };
    let ticket = match state.registry.invoke(&id, request.command) {
        Ok(ticket) => ticket,
        Err(e) => return WsOutgoing::error(e),
    };

    let queued = WsOutgoing::CommandQueued {
        payload: CommandQueuedPayload {
            request_id: request.request_id.clone(),
            device_id: id.clone(),
            command: *ticket.command(),
        },
    };

    let results = results.clone();
    let request_id = request.request_id;
    tokio::spawn(async move {
        let outcome = ticket.outcome().await;
        let _ = results
            .send(WsOutgoing::CommandResult {
                payload: CommandResultPayload {
                    request_id,
                    device_id: id,
                    outcome,
                },
            })
            .await;
    });

    queued
}

fn handle_rescan(state: &AppState) -> WsOutgoing {
    match state.discovery.rescan() {
        Ok(()) => WsOutgoing::RescanStarted,
        Err(e) => WsOutgoing::error(e),
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket connection handler.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the snapshot so nothing falls between the two.
    let mut events = state.event_bus.subscribe();
    let (results_tx, mut results_rx) = mpsc::channel::<WsOutgoing>(32);
    let mut last_activity = Instant::now();

    let conn_guard = state.ws_manager.register();
    let cancel_token = conn_guard.cancel_token().clone();

    if !send(&mut sender, build_initial_state(&state)).await {
        log::warn!("[WS] Failed to send initial state, client disconnected");
        return;
    }

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_secs(WS_HEARTBEAT_CHECK_INTERVAL_SECS));
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[WS] Connection force-closed: ws-{}", conn_guard.id());
                break;
            }
            msg = receiver.next() => {
                last_activity = Instant::now();
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(WsIncoming::Heartbeat) => WsOutgoing::HeartbeatAck,
                        Ok(WsIncoming::Invoke { payload }) => {
                            conn_guard.record_command();
                            handle_invoke(&state, payload, &results_tx)
                        }
                        Ok(WsIncoming::Rescan) => handle_rescan(&state),
                        Err(e) => {
                            log::debug!("[WS] Unparseable message: {}", e);
                            WsOutgoing::error(format!("invalid message: {e}"))
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => continue,
                };
                if !send(&mut sender, reply).await {
                    break;
                }
            }
            Some(result) = results_rx.recv() => {
                if !send(&mut sender, result).await {
                    break;
                }
            }
            Some(event) = events.recv() => {
                if let Ok(json) = serde_json::to_string(&event) {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            _ = heartbeat_interval.tick() => {
                if last_activity.elapsed() > Duration::from_secs(WS_HEARTBEAT_TIMEOUT_SECS) {
                    log::warn!("[WS] Heartbeat timeout: ws-{}", conn_guard.id());
                    break;
                }
            }
        }
    }

    // ConnectionGuard unregisters on drop; pending result waiters finish on
    // their own and find the channel closed.
}
