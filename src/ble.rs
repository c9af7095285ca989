use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{CadenceError, Result},
    transport::{
        Advertisement, AdvertisementStream, BleTransport, CharacteristicInfo, LinkEvent,
        LinkEventStream, NotificationStream, ServiceInfo, ServiceTable,
    },
};

/// [`BleTransport`] backed by the first system Bluetooth adapter
pub struct BtleplugTransport {
    _manager: Manager,
    central: Adapter,
    peripherals: Arc<Mutex<PeripheralCache<Peripheral>>>,
}

impl BtleplugTransport {
    /// Create a transport on the first available adapter
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::AdapterUnavailable`] if no Bluetooth adapter is
    /// present, or [`CadenceError::Ble`] if the BLE stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(CadenceError::AdapterUnavailable)?;

        info!("Using Bluetooth adapter: {}", central.adapter_info().await?);

        Ok(Self {
            _manager: manager,
            central,
            peripherals: Arc::new(Mutex::new(PeripheralCache::new())),
        })
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(address)
            .ok_or_else(|| CadenceError::DeviceNotFound {
                address: address.to_string(),
            })
    }
}

fn peripheral_key(address: &str) -> String {
    address.to_uppercase()
}

/// Peripherals reported by the current scan, keyed by normalized address
struct PeripheralCache<P> {
    entries: HashMap<String, P>,
}

impl<P: Clone> PeripheralCache<P> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, address: &str, peripheral: P) {
        self.entries.insert(peripheral_key(address), peripheral);
    }

    fn get(&self, address: &str) -> Option<P> {
        self.entries.get(&peripheral_key(address)).cloned()
    }

    /// Forget every entry, returning how many were dropped
    fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

fn characteristic_info(characteristic: &Characteristic) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: characteristic.uuid,
        notify: characteristic.properties.contains(CharPropFlags::NOTIFY),
        indicate: characteristic.properties.contains(CharPropFlags::INDICATE),
        descriptors: characteristic.descriptors.iter().map(|d| d.uuid).collect(),
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn adapter_enabled(&self) -> Result<bool> {
        let state = self.central.adapter_state().await?;
        debug!("Adapter state: {:?}", state);
        Ok(!matches!(state, CentralState::PoweredOff))
    }

    async fn start_scan(&self, service_filter: Option<Uuid>) -> Result<AdvertisementStream> {
        // A scan only starts with no link up, so nothing cached is still needed
        let dropped = self.peripherals.lock().await.clear();
        if dropped > 0 {
            debug!("Dropped {} peripheral(s) from the previous scan", dropped);
        }

        // Subscribe before scanning so no early advertisement is missed
        let events = self.central.events().await?;

        let scan_filter = ScanFilter {
            services: service_filter.into_iter().collect(),
        };
        self.central.start_scan(scan_filter).await?;
        info!("Scan started");

        let central = self.central.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let advertisements = events.filter_map(move |event| {
            let central = central.clone();
            let peripherals = Arc::clone(&peripherals);
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };

                let peripheral = central.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok().flatten();
                let address = peripheral.address().to_string();

                peripherals.lock().await.insert(&address, peripheral);

                let (local_name, rssi, services) = properties
                    .map_or((None, None, Vec::new()), |p| (p.local_name, p.rssi, p.services));

                Some(Advertisement {
                    address,
                    local_name,
                    rssi,
                    services,
                })
            }
        });

        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.central.stop_scan().await?;
        info!("Scan stopped");
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<LinkEventStream> {
        let peripheral = self.peripheral(address).await?;

        // Watch for link loss before the link exists
        let events = self.central.events().await?;

        peripheral
            .connect()
            .await
            .map_err(|e| CadenceError::ConnectionFailed(e.to_string()))?;
        info!("Successfully connected to {}", address);

        let id = peripheral.id();
        let lost = events
            .filter_map(move |event| {
                let id = id.clone();
                async move {
                    match event {
                        CentralEvent::DeviceDisconnected(disconnected) if disconnected == id => {
                            Some(LinkEvent::Disconnected(Some("link lost".to_string())))
                        }
                        _ => None,
                    }
                }
            })
            .take(1);

        Ok(stream::once(async { LinkEvent::Connected })
            .chain(lost)
            .boxed())
    }

    async fn discover_services(&self, address: &str) -> Result<ServiceTable> {
        let peripheral = self.peripheral(address).await?;
        peripheral.discover_services().await?;

        let services: Vec<_> = peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(characteristic_info)
                    .collect(),
            })
            .collect();

        debug!("Discovered {} service(s) on {}", services.len(), address);
        Ok(ServiceTable { services })
    }

    async fn subscribe(&self, address: &str, characteristic: Uuid) -> Result<()> {
        let peripheral = self.peripheral(address).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| {
                CadenceError::SubscriptionFailed(format!(
                    "characteristic {characteristic} not discovered"
                ))
            })?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| CadenceError::SubscriptionFailed(e.to_string()))?;

        debug!("Subscribed to {} on {}", characteristic, address);
        Ok(())
    }

    async fn notifications(
        &self,
        address: &str,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let peripheral = self.peripheral(address).await?;
        let notifications = peripheral.notifications().await?;

        Ok(notifications
            .filter_map(move |notification| async move {
                (notification.uuid == characteristic).then(|| Bytes::from(notification.value))
            })
            .boxed())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        } else {
            warn!("Disconnect requested for {} which is not connected", address);
        }
        Ok(())
    }
}
