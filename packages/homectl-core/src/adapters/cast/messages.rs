//! JSON payloads of the Cast namespaces this adapter speaks.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{DeviceError, DeviceResult};
use crate::model::{MediaAction, MediaInfo, PlaybackState};
use crate::protocol_constants::{CAST_BACKDROP_APP_ID, CAST_NS_MEDIA};

// ─────────────────────────────────────────────────────────────────────────────
// Outgoing
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn connect() -> Value {
    json!({ "type": "CONNECT" })
}

pub(crate) fn close() -> Value {
    json!({ "type": "CLOSE" })
}

pub(crate) fn ping() -> Value {
    json!({ "type": "PING" })
}

pub(crate) fn pong() -> Value {
    json!({ "type": "PONG" })
}

pub(crate) fn get_status(request_id: u32) -> Value {
    json!({ "type": "GET_STATUS", "requestId": request_id })
}

pub(crate) fn set_volume_level(request_id: u32, level: u8) -> Value {
    json!({
        "type": "SET_VOLUME",
        "requestId": request_id,
        "volume": { "level": f64::from(level) / 100.0 },
    })
}

pub(crate) fn set_muted(request_id: u32, muted: bool) -> Value {
    json!({
        "type": "SET_VOLUME",
        "requestId": request_id,
        "volume": { "muted": muted },
    })
}

pub(crate) fn stop_app(request_id: u32, session_id: &str) -> Value {
    json!({ "type": "STOP", "requestId": request_id, "sessionId": session_id })
}

pub(crate) fn media_control(request_id: u32, media_session_id: i64, action: MediaAction) -> Value {
    let kind = match action {
        MediaAction::Play => "PLAY",
        MediaAction::Pause => "PAUSE",
        MediaAction::Stop => "STOP",
    };
    json!({ "type": kind, "requestId": request_id, "mediaSessionId": media_session_id })
}

// ─────────────────────────────────────────────────────────────────────────────
// Incoming
// ─────────────────────────────────────────────────────────────────────────────

/// Type and correlation id present on every reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request_id: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReceiverStatus {
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub volume: Volume,
    #[serde(default)]
    pub is_stand_by: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Application {
    pub app_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub transport_id: String,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Namespace {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Volume {
    pub level: Option<f64>,
    pub muted: Option<bool>,
}

impl ReceiverStatus {
    /// The foreground application, unless it is the idle backdrop.
    pub(crate) fn active_app(&self) -> Option<&Application> {
        self.applications
            .iter()
            .find(|app| app.app_id != CAST_BACKDROP_APP_ID)
    }

    /// The running application that accepts media commands.
    pub(crate) fn media_app(&self) -> Option<&Application> {
        self.active_app()
            .filter(|app| app.namespaces.iter().any(|ns| ns.name == CAST_NS_MEDIA))
    }

    pub(crate) fn volume_percent(&self) -> Option<u8> {
        self.volume
            .level
            .map(|level| (level * 100.0).round().clamp(0.0, 100.0) as u8)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaStatus {
    pub media_session_id: i64,
    #[serde(default)]
    pub player_state: String,
    pub current_time: Option<f64>,
    pub media: Option<MediaDescription>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MediaDescription {
    pub duration: Option<f64>,
    pub metadata: Option<MediaMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MediaMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl MediaStatus {
    pub(crate) fn to_info(&self, app: Option<&str>) -> MediaInfo {
        let metadata = self.media.as_ref().and_then(|m| m.metadata.as_ref());
        MediaInfo {
            playback: playback_state(&self.player_state),
            title: metadata.and_then(|m| m.title.clone()),
            artist: metadata.and_then(|m| m.artist.clone()),
            app: app.map(str::to_string),
            duration_secs: self.media.as_ref().and_then(|m| m.duration),
            position_secs: self.current_time,
        }
    }
}

fn playback_state(player_state: &str) -> PlaybackState {
    match player_state {
        "PLAYING" => PlaybackState::Playing,
        "PAUSED" => PlaybackState::Paused,
        "BUFFERING" => PlaybackState::Buffering,
        "IDLE" => PlaybackState::Idle,
        _ => PlaybackState::Unknown,
    }
}

/// A reply routed by its `type` field.
#[derive(Debug)]
pub(crate) enum Incoming {
    Ping,
    Pong,
    Receiver(ReceiverStatus),
    /// First entry of the `status` array; `None` when no media session exists.
    Media(Option<MediaStatus>),
    Close,
    /// Errors such as `INVALID_REQUEST` or `LOAD_FAILED`.
    Failure(String),
    Other(String),
}

pub(crate) fn parse(payload: &Value) -> DeviceResult<(u32, Incoming)> {
    let envelope: Envelope = serde_json::from_value(payload.clone())
        .map_err(|e| DeviceError::ProtocolError(format!("reply without type: {e}")))?;
    let malformed = |e: serde_json::Error| {
        DeviceError::ProtocolError(format!("malformed {}: {e}", envelope.kind))
    };

    let incoming = match envelope.kind.as_str() {
        "PING" => Incoming::Ping,
        "PONG" => Incoming::Pong,
        "CLOSE" => Incoming::Close,
        "RECEIVER_STATUS" => {
            let status = payload.get("status").cloned().unwrap_or(Value::Null);
            Incoming::Receiver(serde_json::from_value(status).map_err(malformed)?)
        }
        "MEDIA_STATUS" => {
            let entries = payload.get("status").cloned().unwrap_or(Value::Array(vec![]));
            let mut entries: Vec<MediaStatus> = serde_json::from_value(entries).map_err(malformed)?;
            Incoming::Media((!entries.is_empty()).then(|| entries.swap_remove(0)))
        }
        "INVALID_REQUEST" | "LOAD_FAILED" | "LAUNCH_ERROR" | "INVALID_PLAYER_STATE" => {
            let reason = payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or(envelope.kind.as_str());
            Incoming::Failure(reason.to_string())
        }
        other => Incoming::Other(other.to_string()),
    };
    Ok((envelope.request_id, incoming))
}
