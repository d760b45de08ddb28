use serde::{Deserialize, Serialize};

use super::color::Rgb;
use super::command::{DeviceCommand, MediaAction};

/// Playback state reported by media devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackState {
    #[default]
    Unknown,
    Idle,
    Playing,
    Paused,
    Buffering,
}

/// What a speaker is currently playing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub playback: PlaybackState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    /// Display name of the running receiver application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_secs: Option<f64>,
}

/// Last-known state of a device.
///
/// On adapter failure only `reachable` changes; every other field keeps its
/// last-known value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub power: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Rgb>,
    /// Color temperature in kelvin when the bulb is in white mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_temp: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
    pub reachable: bool,
    /// Unix timestamp in milliseconds.
    pub last_updated: u64,
}

impl DeviceState {
    /// Initial state for a freshly discovered device.
    pub fn discovered(now: u64) -> Self {
        Self {
            reachable: true,
            last_updated: now,
            ..Self::default()
        }
    }

    /// Applies the effect of a command the device acknowledged.
    pub fn apply_command(&mut self, command: &DeviceCommand) {
        match *command {
            DeviceCommand::SetPower { on } => self.power = on,
            DeviceCommand::SetBrightness { level } => {
                self.brightness = Some(level);
                self.power = level > 0;
            }
            DeviceCommand::SetColor { color } => {
                self.color = Some(color);
                self.color_temp = None;
                self.power = true;
            }
            DeviceCommand::SetVolume { level } => self.volume = Some(level),
            DeviceCommand::SetMuted { muted } => self.muted = Some(muted),
            DeviceCommand::Media { action } => {
                let media = self.media.get_or_insert_with(MediaInfo::default);
                media.playback = match action {
                    MediaAction::Play => PlaybackState::Playing,
                    MediaAction::Pause => PlaybackState::Paused,
                    MediaAction::Stop => PlaybackState::Idle,
                };
            }
        }
    }

    /// Merges a partial push report.
    pub fn apply_patch(&mut self, patch: &StatePatch) {
        if let Some(power) = patch.power {
            self.power = power;
        }
        if let Some(volume) = patch.volume {
            self.volume = Some(volume);
        }
        if let Some(muted) = patch.muted {
            self.muted = Some(muted);
        }
        match &patch.media {
            MediaPatch::Keep => {}
            MediaPatch::Clear => self.media = None,
            MediaPatch::Set(info) => self.media = Some(info.clone()),
        }
    }

    /// Compares the observable fields, ignoring `last_updated`.
    pub fn same_observation(&self, other: &DeviceState) -> bool {
        self.power == other.power
            && self.brightness == other.brightness
            && self.color == other.color
            && self.color_temp == other.color_temp
            && self.volume == other.volume
            && self.muted == other.muted
            && self.media == other.media
            && self.reachable == other.reachable
    }
}

/// Change to the media portion of a push report.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MediaPatch {
    #[default]
    Keep,
    Clear,
    Set(MediaInfo),
}

/// Partial state reported by a push-style adapter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatePatch {
    pub power: Option<bool>,
    pub volume: Option<u8>,
    pub muted: Option<bool>,
    pub media: MediaPatch,
}
