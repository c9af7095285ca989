use tracing::{debug, info};

use crate::{
    error::{CadenceError, Result},
    types::{ConnectionState, DiscoveredDevice, DiscoverySet, PeripheralHandle, ScanMode},
};

/// What the state machine made of one advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanDecision {
    /// Not scanning; the report was dropped
    Ignored,
    /// Stored in the discovery set (`true` if newly seen)
    Recorded(bool),
    /// The configured target was seen; connect to it now
    TargetMatched(PeripheralHandle),
}

/// Scan/connect state machine for the single owned connection
///
/// Owns the [`DiscoverySet`] and validates every transition against the
/// connection lifecycle. It performs no I/O.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    discovery: DiscoverySet,
    target: Option<String>,
}

impl ConnectionStateMachine {
    /// Create an idle state machine with an optional auto-connect target
    #[must_use]
    pub fn new(target: Option<String>) -> Self {
        Self {
            state: ConnectionState::Idle,
            discovery: DiscoverySet::new(),
            target,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Devices seen during the last scan window
    #[must_use]
    pub const fn discovery(&self) -> &DiscoverySet {
        &self.discovery
    }

    /// Auto-connect target address
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Whether `from -> to` is a legal transition
    #[must_use]
    pub const fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::{
            Active, Connecting, Disconnecting, Idle, Scanning, ServiceDiscovery,
            SubscribingNotifications,
        };

        matches!(
            (from, to),
            (Idle, Scanning | Connecting)
                | (Scanning, Idle | Connecting)
                | (Connecting, ServiceDiscovery | Idle | Disconnecting)
                | (ServiceDiscovery, SubscribingNotifications | Idle | Disconnecting)
                | (SubscribingNotifications, Active | Idle | Disconnecting)
                | (Active, Disconnecting)
                | (Disconnecting, Idle)
        )
    }

    /// Move to `to`, returning the previous state
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::InvalidTransition`] if the move is not part of
    /// the lifecycle; the state is left unchanged.
    pub fn transition(&mut self, to: ConnectionState) -> Result<ConnectionState> {
        let from = self.state;
        if !Self::can_transition(from, to) {
            return Err(CadenceError::InvalidTransition { from, to });
        }
        self.state = to;
        info!("Connection state: {} -> {}", from, to);
        Ok(from)
    }

    /// Fail fast if a scan cannot start from the current state
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::AlreadyConnected`] while a link is live or being
    /// torn down, and [`CadenceError::ScanInProgress`] while scanning.
    pub fn check_can_scan(&self) -> Result<()> {
        match self.state {
            ConnectionState::Idle => Ok(()),
            ConnectionState::Scanning => Err(CadenceError::ScanInProgress),
            _ => Err(CadenceError::AlreadyConnected),
        }
    }

    /// Clear the discovery set and enter `Scanning`
    ///
    /// # Errors
    ///
    /// See [`check_can_scan`](Self::check_can_scan).
    pub fn begin_scan(&mut self) -> Result<()> {
        self.check_can_scan()?;
        self.discovery.clear();
        self.transition(ConnectionState::Scanning)?;
        Ok(())
    }

    /// Record one discovered device
    pub fn record_discovery(&mut self, device: DiscoveredDevice) -> ScanDecision {
        if self.state != ConnectionState::Scanning {
            return ScanDecision::Ignored;
        }

        let handle = device.handle.clone();
        let label = device.label();
        let is_new = self.discovery.insert(device);
        if is_new {
            debug!("Device found: {}", label);
        }

        match self.target.as_deref() {
            Some(target) if handle.matches(target) => {
                info!("Target device {} found", handle);
                ScanDecision::TargetMatched(handle)
            }
            _ => ScanDecision::Recorded(is_new),
        }
    }

    /// Close the scan window after its timeout and return to `Idle`
    ///
    /// # Errors
    ///
    /// In [`ScanMode::Interactive`] returns [`CadenceError::DiscoveryTimeout`] if
    /// nothing was found; in [`ScanMode::AutoConnect`] always returns
    /// [`CadenceError::TargetNotFound`] since a matched target would already
    /// have ended the scan.
    pub fn finish_scan(&mut self, mode: ScanMode) -> Result<Vec<DiscoveredDevice>> {
        self.transition(ConnectionState::Idle)?;

        match mode {
            ScanMode::Interactive if self.discovery.is_empty() => Err(CadenceError::DiscoveryTimeout),
            ScanMode::Interactive => Ok(self.discovery.devices()),
            ScanMode::AutoConnect => Err(CadenceError::TargetNotFound {
                address: self.target.clone(),
            }),
        }
    }

    /// Resolve a user selection against the discovery set
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::DeviceNotFound`] if the address was not seen in
    /// the last scan window.
    pub fn lookup(&self, address: &str) -> Result<PeripheralHandle> {
        self.discovery
            .get(address)
            .map(|d| d.handle.clone())
            .ok_or_else(|| CadenceError::DeviceNotFound {
                address: address.to_string(),
            })
    }
}
