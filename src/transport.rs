use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::{CadenceError, Result},
    CLIENT_CHARACTERISTIC_CONFIG_UUID, CSC_MEASUREMENT_CHAR_UUID, CSC_SERVICE_UUID,
};

/// One advertisement report from a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Device address
    pub address: String,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

/// Link-level connection event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Link established
    Connected,
    /// Link closed, with an optional reason
    Disconnected(Option<String>),
}

/// Stream of advertisement reports for an open scan window
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// Stream of link events for one connection
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// Stream of raw characteristic notification payloads
pub type NotificationStream = BoxStream<'static, Bytes>;

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Supports notifications
    pub notify: bool,
    /// Supports indications
    pub indicate: bool,
    /// Descriptor UUIDs
    pub descriptors: Vec<Uuid>,
}

/// A primary service as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics of this service
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Result of service discovery on one peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTable {
    /// Discovered services
    pub services: Vec<ServiceInfo>,
}

impl ServiceTable {
    /// Resolve the CSC Measurement characteristic
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::ProfileNotSupported`] if the CSC service or the
    /// measurement characteristic is missing, or if the characteristic supports
    /// neither notifications nor indications.
    pub fn csc_measurement(&self) -> Result<&CharacteristicInfo> {
        let service = self
            .services
            .iter()
            .find(|s| s.uuid == CSC_SERVICE_UUID)
            .ok_or_else(|| CadenceError::ProfileNotSupported("CSC service not found".to_string()))?;

        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.uuid == CSC_MEASUREMENT_CHAR_UUID)
            .ok_or_else(|| {
                CadenceError::ProfileNotSupported(
                    "CSC measurement characteristic not found".to_string(),
                )
            })?;

        if !characteristic.notify && !characteristic.indicate {
            return Err(CadenceError::ProfileNotSupported(
                "characteristic cannot be notified".to_string(),
            ));
        }

        if !characteristic.descriptors.is_empty()
            && !characteristic
                .descriptors
                .contains(&CLIENT_CHARACTERISTIC_CONFIG_UUID)
        {
            warn!("CCC descriptor not reported for CSC measurement characteristic");
        }

        Ok(characteristic)
    }
}

/// BLE central operations the session depends on
///
/// Devices are addressed by the string form of their address. Implementations
/// must be cheap to share across tasks.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Whether the adapter is powered on
    async fn adapter_enabled(&self) -> Result<bool>;

    /// Open a scan window, optionally filtered to one advertised service
    async fn start_scan(&self, service_filter: Option<Uuid>) -> Result<AdvertisementStream>;

    /// Close the scan window
    async fn stop_scan(&self) -> Result<()>;

    /// Start connecting; the stream yields `Connected` once the link is up
    async fn connect(&self, address: &str) -> Result<LinkEventStream>;

    /// Discover services and characteristics
    async fn discover_services(&self, address: &str) -> Result<ServiceTable>;

    /// Enable notifications by writing the CCC descriptor
    async fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<()>;

    /// Notification payloads for one characteristic
    async fn notifications(&self, address: &str, characteristic: Uuid)
        -> Result<NotificationStream>;

    /// Close the link
    async fn disconnect(&self, address: &str) -> Result<()>;
}

/// Operations checked by a [`PermissionGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Open a scan window
    Scan,
    /// Establish a link
    Connect,
    /// Discover services
    DiscoverServices,
    /// Enable notifications
    Subscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::Connect => write!(f, "connect"),
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Capability check invoked once at each operation boundary
pub trait PermissionGate: Send + Sync {
    /// Allow or refuse an operation
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::PermissionDenied`] when the host has not granted
    /// the capability the operation needs.
    fn check(&self, operation: Operation) -> Result<()>;
}

/// Gate that allows every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantAll;

impl PermissionGate for GrantAll {
    fn check(&self, _operation: Operation) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(notify: bool, indicate: bool) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: CSC_MEASUREMENT_CHAR_UUID,
            notify,
            indicate,
            descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
        }
    }

    fn table(characteristics: Vec<CharacteristicInfo>) -> ServiceTable {
        ServiceTable {
            services: vec![ServiceInfo {
                uuid: CSC_SERVICE_UUID,
                characteristics,
            }],
        }
    }

    #[test]
    fn test_resolve_measurement_characteristic() {
        let notify = table(vec![measurement(true, false)]);
        assert!(notify.csc_measurement().is_ok());

        let indicate = table(vec![measurement(false, true)]);
        assert!(indicate.csc_measurement().is_ok());
    }

    #[test]
    fn test_missing_profile() {
        let empty = ServiceTable::default();
        assert!(matches!(
            empty.csc_measurement(),
            Err(CadenceError::ProfileNotSupported(msg)) if msg.contains("service")
        ));

        let no_char = table(vec![]);
        assert!(matches!(
            no_char.csc_measurement(),
            Err(CadenceError::ProfileNotSupported(msg)) if msg.contains("characteristic not found")
        ));

        let silent = table(vec![measurement(false, false)]);
        assert!(matches!(
            silent.csc_measurement(),
            Err(CadenceError::ProfileNotSupported(msg)) if msg.contains("cannot be notified")
        ));
    }

    #[test]
    fn test_grant_all() {
        let gate = GrantAll;
        for operation in [
            Operation::Scan,
            Operation::Connect,
            Operation::DiscoverServices,
            Operation::Subscribe,
        ] {
            tokio_test::assert_ok!(gate.check(operation));
        }
    }
}
