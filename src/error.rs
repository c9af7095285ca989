use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{transport::Operation, types::ConnectionState};

/// Errors produced while decoding a CSC Measurement notification
///
/// Decode failures never leave a partially filled measurement behind; the
/// whole packet is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The notification carried no bytes at all
    #[error("empty measurement buffer")]
    EmptyBuffer,

    /// Wheel data was flagged but fewer than 6 bytes followed the flags
    #[error("wheel revolution data truncated: {remaining} byte(s) remaining, 6 required")]
    TruncatedWheelData {
        /// Bytes left at the wheel data offset
        remaining: usize,
    },

    /// Crank data was flagged but fewer than 4 bytes remained at its offset
    #[error("crank revolution data truncated: {remaining} byte(s) remaining, 4 required")]
    TruncatedCrankData {
        /// Bytes left at the crank data offset
        remaining: usize,
    },
}

/// Errors that can occur when working with cadence sensors
#[derive(Error, Debug)]
pub enum CadenceError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is present on this host
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    /// The adapter exists but is powered off
    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    /// The permission gate refused an operation
    #[error("Permission denied for {operation}")]
    PermissionDenied {
        /// Operation that was refused
        operation: Operation,
    },

    /// Interactive scan window closed without discovering any device
    #[error("No devices found before the scan timed out")]
    DiscoveryTimeout,

    /// Auto-connect scan window closed without seeing the configured target
    #[error("Target device {} not found", address.as_deref().unwrap_or("<none configured>"))]
    TargetNotFound {
        /// Configured target address, if any
        address: Option<String>,
    },

    /// Selected address is not part of the current discovery set
    #[error("Device {address} was not discovered")]
    DeviceNotFound {
        /// Requested address
        address: String,
    },

    /// Link establishment failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Peripheral lacks the CSC service or measurement characteristic
    #[error("Cycling speed and cadence profile not supported: {0}")]
    ProfileNotSupported(String),

    /// Enabling notifications on the measurement characteristic failed
    #[error("Failed to subscribe to measurement notifications: {0}")]
    SubscriptionFailed(String),

    /// A bounded operation did not complete in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A connection is already live
    #[error("Already connected to a device - disconnect first")]
    AlreadyConnected,

    /// A scan window is already open
    #[error("Scan already in progress")]
    ScanInProgress,

    /// Disconnect requested with no live link
    #[error("Not connected")]
    NotConnected,

    /// Internal state machine refused a transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: ConnectionState,
        /// Requested state
        to: ConnectionState,
    },

    /// Malformed measurement payload
    #[error("Failed to decode measurement: {0}")]
    Decode(#[from] DecodeError),

    /// The background session worker is gone
    #[error("Session worker has stopped")]
    WorkerStopped,
}

/// Result type for cadence operations
pub type Result<T> = std::result::Result<T, CadenceError>;

/// Coarse error category surfaced to presentation layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Adapter missing or disabled, or a raw BLE stack failure
    Transport,
    /// Permission gate refusal
    PermissionDenied,
    /// Interactive scan found nothing
    DiscoveryTimeout,
    /// Configured target never advertised
    TargetNotFound,
    /// Link could not be established or a stage timed out
    Connect,
    /// Service or characteristic missing
    ProfileNotSupported,
    /// CCCD write failed
    SubscriptionFailed,
    /// Intent rejected in the current state
    InvalidState,
    /// Malformed payload
    Decode,
}

impl CadenceError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::ProfileNotSupported(_)
                | Self::SubscriptionFailed(_)
                | Self::Timeout { .. }
        )
    }

    /// Check if this error is recoverable by simply retrying the intent
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryTimeout
                | Self::TargetNotFound { .. }
                | Self::Timeout { .. }
                | Self::Decode(_)
        )
    }

    /// Category of this error for user-facing reporting
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Ble(btleplug::Error::PermissionDenied) | Self::PermissionDenied { .. } => {
                ErrorKind::PermissionDenied
            }
            Self::Ble(_) | Self::AdapterUnavailable | Self::AdapterDisabled => ErrorKind::Transport,
            Self::DiscoveryTimeout => ErrorKind::DiscoveryTimeout,
            Self::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            Self::ConnectionFailed(_) | Self::Timeout { .. } => ErrorKind::Connect,
            Self::ProfileNotSupported(_) => ErrorKind::ProfileNotSupported,
            Self::SubscriptionFailed(_) => ErrorKind::SubscriptionFailed,
            Self::DeviceNotFound { .. }
            | Self::AlreadyConnected
            | Self::ScanInProgress
            | Self::NotConnected
            | Self::InvalidTransition { .. }
            | Self::WorkerStopped => ErrorKind::InvalidState,
            Self::Decode(_) => ErrorKind::Decode,
        }
    }
}
