use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};

use crate::{
    cadence::ZeroRevolutionPolicy,
    error::{CadenceError, ErrorKind},
    transport::Advertisement,
};

/// Name shown for devices that advertise no local name
pub const UNNAMED_DEVICE: &str = "Unnamed Device";

/// Lifecycle state of the single owned sensor connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No scan and no link
    #[default]
    Idle,
    /// Scan window open, collecting advertisements
    Scanning,
    /// Link establishment in progress
    Connecting,
    /// Resolving the CSC service and measurement characteristic
    ServiceDiscovery,
    /// Writing the notification-enable descriptor
    SubscribingNotifications,
    /// Measurements are flowing
    Active,
    /// Tearing the link down
    Disconnecting,
}

impl ConnectionState {
    /// Whether a connection attempt or link is live (Connecting through Active)
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::ServiceDiscovery | Self::SubscribingNotifications | Self::Active
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "Service Discovery"),
            Self::SubscribingNotifications => write!(f, "Subscribing Notifications"),
            Self::Active => write!(f, "Active"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Opaque identifier of a discovered or connected peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    /// Wrap a device address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Device address as reported by the transport
    #[must_use]
    pub fn address(&self) -> &str {
        &self.0
    }

    /// Case-insensitive address comparison
    #[must_use]
    pub fn matches(&self, address: &str) -> bool {
        self.0.eq_ignore_ascii_case(address)
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen during a scan window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device handle
    pub handle: PeripheralHandle,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Create a discovered device entry
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            handle: PeripheralHandle::new(address),
            name,
            rssi: None,
        }
    }

    /// Advertised name, or [`UNNAMED_DEVICE`]
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED_DEVICE)
    }

    /// Selection list label: `"name (address)"`, or `"address (Unnamed)"`
    #[must_use]
    pub fn label(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => format!("{name} ({})", self.handle),
            _ => format!("{} (Unnamed)", self.handle),
        }
    }
}

impl From<Advertisement> for DiscoveredDevice {
    fn from(advertisement: Advertisement) -> Self {
        Self {
            handle: PeripheralHandle::new(advertisement.address),
            name: advertisement.local_name,
            rssi: advertisement.rssi,
        }
    }
}

/// Devices seen during the current scan window, deduplicated by address
#[derive(Debug, Clone, Default)]
pub struct DiscoverySet {
    devices: HashMap<String, DiscoveredDevice>,
}

impl DiscoverySet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(address: &str) -> String {
        address.to_ascii_uppercase()
    }

    /// Insert a device; returns `false` if the address was already present
    pub fn insert(&mut self, device: DiscoveredDevice) -> bool {
        let key = Self::key(device.handle.address());
        if self.devices.contains_key(&key) {
            return false;
        }
        self.devices.insert(key, device);
        true
    }

    /// Look up a device by address (case-insensitive)
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.get(&Self::key(address))
    }

    /// Number of distinct devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device has been seen
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget every device
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// All devices, ordered by address
    #[must_use]
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.handle.address().cmp(b.handle.address()));
        devices
    }
}

/// What happens when the scan window closes without an auto-connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    /// Offer the discovered devices for manual selection
    #[default]
    Interactive,
    /// Fail with `TargetNotFound`
    AutoConnect,
}

/// Session behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Address to connect to as soon as it is seen
    pub target_address: Option<String>,
    /// Behaviour on scan timeout
    pub scan_mode: ScanMode,
    /// Restrict the scan to peripherals advertising the CSC service
    pub filter_by_service: bool,
    /// Treatment of samples with no new revolutions
    pub zero_revolution_policy: ZeroRevolutionPolicy,
}

/// Timeouts for every bounded stage of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Scan window length in milliseconds
    pub scan_timeout_ms: u64,
    /// Link establishment timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Service discovery timeout in milliseconds
    pub service_discovery_timeout_ms: u64,
    /// Notification subscription timeout in milliseconds
    pub subscribe_timeout_ms: u64,
    /// Disconnect timeout in milliseconds
    pub disconnect_timeout_ms: u64,
    /// Quiet window before cadence is declared stale, in milliseconds
    pub stale_data_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            service_discovery_timeout_ms: 10_000,
            subscribe_timeout_ms: 5_000,
            disconnect_timeout_ms: 5_000,
            stale_data_timeout_ms: 3_000,
        }
    }
}

impl TimeoutConfig {
    /// Stale-data window as a [`Duration`]
    #[must_use]
    pub const fn stale_window(&self) -> Duration {
        Duration::from_millis(self.stale_data_timeout_ms)
    }
}

/// Snapshot of the session for polling consumers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Current connection state
    pub state: ConnectionState,
    /// Latest cadence in RPM
    pub cadence_rpm: f64,
    /// Peripheral of the live link
    pub device: Option<PeripheralHandle>,
    /// Cadence was zeroed by the staleness watchdog
    pub stale: bool,
}

/// Failure surfaced to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    /// Error category
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

impl From<&CadenceError> for SessionFailure {
    fn from(error: &CadenceError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Notifications delivered to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// A distinct measurement produced a cadence value
    CadenceUpdated(f64),
    /// No distinct measurement within the stale window; cadence is now 0
    CadenceStale,
    /// Interactive scan finished; pick one with `select_device`
    DiscoveryComplete(Vec<DiscoveredDevice>),
    /// An intent or connection attempt failed
    Error(SessionFailure),
}
