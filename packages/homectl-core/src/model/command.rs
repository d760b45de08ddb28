use serde::{Deserialize, Serialize};

use super::capability::{Capability, CapabilitySet};
use super::color::Rgb;
use crate::error::{DeviceError, DeviceResult};

/// Media transport action for speakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaAction {
    Play,
    Pause,
    Stop,
}

/// Color as received from a caller, before channel validation.
///
/// Components are wider than `u8` so that out-of-range input is detected
/// instead of silently wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorInput {
    pub r: i64,
    pub g: i64,
    pub b: i64,
}

/// A command as issued by a subscriber.
///
/// Commands are validated against the target's capabilities by
/// [`Command::normalize`] before they reach an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    SetPower { on: bool },
    SetBrightness { level: i64 },
    SetColor { color: ColorInput },
    SetVolume { level: i64 },
    SetMuted { muted: bool },
    Media { action: MediaAction },
}

/// Identifies commands that supersede each other when queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Power,
    Brightness,
    Color,
    Volume,
    Mute,
    Media,
}

/// A validated, range-normalized command ready for an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum DeviceCommand {
    SetPower { on: bool },
    SetBrightness { level: u8 },
    SetColor { color: Rgb },
    SetVolume { level: u8 },
    SetMuted { muted: bool },
    Media { action: MediaAction },
}

impl Command {
    pub fn set_power(on: bool) -> Self {
        Self::SetPower { on }
    }

    pub fn set_brightness(level: i64) -> Self {
        Self::SetBrightness { level }
    }

    pub fn set_color(r: i64, g: i64, b: i64) -> Self {
        Self::SetColor {
            color: ColorInput { r, g, b },
        }
    }

    pub fn set_volume(level: i64) -> Self {
        Self::SetVolume { level }
    }

    pub fn set_muted(muted: bool) -> Self {
        Self::SetMuted { muted }
    }

    pub fn media(action: MediaAction) -> Self {
        Self::Media { action }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetPower { .. } => CommandKind::Power,
            Self::SetBrightness { .. } => CommandKind::Brightness,
            Self::SetColor { .. } => CommandKind::Color,
            Self::SetVolume { .. } => CommandKind::Volume,
            Self::SetMuted { .. } => CommandKind::Mute,
            Self::Media { .. } => CommandKind::Media,
        }
    }

    pub fn required_capability(&self) -> Capability {
        match self {
            Self::SetPower { .. } => Capability::Power,
            Self::SetBrightness { .. } => Capability::Brightness,
            Self::SetColor { .. } => Capability::Color,
            Self::SetVolume { .. } | Self::SetMuted { .. } => Capability::Volume,
            Self::Media { .. } => Capability::Media,
        }
    }

    /// Checks the command against a capability set and normalizes its
    /// arguments.
    ///
    /// Brightness and volume are clamped to 0–100. Color channels outside
    /// 0–255 are rejected.
    pub fn normalize(&self, capabilities: &CapabilitySet) -> DeviceResult<DeviceCommand> {
        let required = self.required_capability();
        if !capabilities.contains(required) {
            return Err(DeviceError::UnsupportedCapability(required));
        }

        let command = match *self {
            Self::SetPower { on } => DeviceCommand::SetPower { on },
            Self::SetBrightness { level } => DeviceCommand::SetBrightness {
                level: clamp_percent(level),
            },
            Self::SetColor { color } => DeviceCommand::SetColor {
                color: validate_color(color)?,
            },
            Self::SetVolume { level } => DeviceCommand::SetVolume {
                level: clamp_percent(level),
            },
            Self::SetMuted { muted } => DeviceCommand::SetMuted { muted },
            Self::Media { action } => DeviceCommand::Media { action },
        };
        Ok(command)
    }
}

impl DeviceCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetPower { .. } => CommandKind::Power,
            Self::SetBrightness { .. } => CommandKind::Brightness,
            Self::SetColor { .. } => CommandKind::Color,
            Self::SetVolume { .. } => CommandKind::Volume,
            Self::SetMuted { .. } => CommandKind::Mute,
            Self::Media { .. } => CommandKind::Media,
        }
    }
}

fn clamp_percent(level: i64) -> u8 {
    level.clamp(0, 100) as u8
}

fn validate_color(color: ColorInput) -> DeviceResult<Rgb> {
    let channel = |name: &str, value: i64| {
        u8::try_from(value).map_err(|_| {
            DeviceError::InvalidArgument(format!("color channel {name}={value} outside 0-255"))
        })
    };
    Ok(Rgb::new(
        channel("r", color.r)?,
        channel("g", color.g)?,
        channel("b", color.b)?,
    ))
}
