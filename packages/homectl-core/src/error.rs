//! Centralized error types for the homectl core library.
//!
//! This module provides a unified error handling system that:
//! - Defines the device error taxonomy shared by every adapter
//! - Maps errors to machine-readable codes and HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::discovery::DiscoveryError;
use crate::model::Capability;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Device Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of a device operation.
///
/// Every adapter call site converts its failures into one of these variants;
/// nothing else escapes to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Transport could not be established.
    #[error("connection failed: {0}")]
    ConnectionError(String),

    /// Transport lost mid-operation, or the operation timed out.
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    /// The command is not valid for this device.
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(Capability),

    /// Out-of-range or malformed input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The vendor protocol returned an unexpected or error response.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A required credential is missing or was rejected.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// No registry entry exists for the id.
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionError(_) => ErrorKind::ConnectionError,
            Self::DeviceUnreachable(_) => ErrorKind::DeviceUnreachable,
            Self::UnsupportedCapability(_) => ErrorKind::UnsupportedCapability,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ProtocolError(_) => ErrorKind::ProtocolError,
            Self::ConfigurationError(_) => ErrorKind::ConfigurationError,
            Self::UnknownDevice(_) => ErrorKind::UnknownDevice,
        }
    }

    /// Returns true if the registry should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::DeviceUnreachable(_) | Self::ProtocolError(_)
        )
    }

    /// Returns true if the device stays blocked until configuration changes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConfigurationError(_))
    }

    /// Returns true if the failure came from talking to the device, as
    /// opposed to rejecting the request up front.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_)
                | Self::DeviceUnreachable(_)
                | Self::ProtocolError(_)
                | Self::ConfigurationError(_)
        )
    }
}

impl ErrorCode for DeviceError {
    fn code(&self) -> &'static str {
        match self {
            Self::ConnectionError(_) => "connection_error",
            Self::DeviceUnreachable(_) => "device_unreachable",
            Self::UnsupportedCapability(_) => "unsupported_capability",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ProtocolError(_) => "protocol_error",
            Self::ConfigurationError(_) => "configuration_error",
            Self::UnknownDevice(_) => "unknown_device",
        }
    }
}

/// Serializable discriminant of [`DeviceError`], carried by events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ConnectionError,
    DeviceUnreachable,
    UnsupportedCapability,
    InvalidArgument,
    ProtocolError,
    ConfigurationError,
    UnknownDevice,
}

impl ErrorCode for DiscoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::SocketBind(_) => "socket_bind_failed",
            Self::Send(_) => "probe_send_failed",
            Self::NoInterfaces => "no_network_interfaces",
            Self::MdnsDaemon(_) => "mdns_daemon_failed",
            Self::Unavailable(_) => "probe_unavailable",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Application-wide error type for bootstrap and the HTTP surface.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A device operation failed or was rejected.
    #[error("{0}")]
    Device(DeviceError),

    /// Discovery could not be started or triggered.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration values are unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error (runtime startup, serialization).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Device(e) => e.code(),
            Self::Discovery(_) => "discovery_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Device(e) => match e {
                DeviceError::UnknownDevice(_) => StatusCode::NOT_FOUND,
                DeviceError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                DeviceError::UnsupportedCapability(_) => StatusCode::UNPROCESSABLE_ENTITY,
                DeviceError::ConfigurationError(_) => StatusCode::SERVICE_UNAVAILABLE,
                DeviceError::DeviceUnreachable(_) => StatusCode::GATEWAY_TIMEOUT,
                DeviceError::ConnectionError(_) | DeviceError::ProtocolError(_) => {
                    StatusCode::BAD_GATEWAY
                }
            },
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Discovery(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result Type Aliases
// ─────────────────────────────────────────────────────────────────────────────

pub use crate::discovery::DiscoveryResult;

/// Convenient Result alias for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Convenient Result alias for application-wide operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<DeviceError> for CoreError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

impl From<DiscoveryError> for CoreError {
    fn from(err: DiscoveryError) -> Self {
        Self::Discovery(err.to_string())
    }
}
