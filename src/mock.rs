use async_trait::async_trait;
use bytes::Bytes;
use futures::{channel::mpsc, stream, StreamExt};
use std::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{CadenceError, Result},
    transport::{
        Advertisement, AdvertisementStream, BleTransport, CharacteristicInfo, LinkEvent,
        LinkEventStream, NotificationStream, ServiceInfo, ServiceTable,
    },
    CLIENT_CHARACTERISTIC_CONFIG_UUID, CSC_MEASUREMENT_CHAR_UUID, CSC_SERVICE_UUID,
};

/// How the mock answers a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Succeed,
    Refuse,
    Hang,
}

#[derive(Default)]
struct Channels {
    calls: Vec<String>,
    scan: Option<mpsc::UnboundedSender<Advertisement>>,
    link: Option<mpsc::UnboundedSender<LinkEvent>>,
    notifications: Option<mpsc::UnboundedSender<Bytes>>,
}

/// In-memory transport with scripted peripherals
pub struct MockTransport {
    pub advertisements: Vec<Advertisement>,
    pub enabled: bool,
    pub connect: ConnectBehavior,
    pub services: ServiceTable,
    pub subscribe_ok: bool,
    channels: Mutex<Channels>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            advertisements: Vec::new(),
            enabled: true,
            connect: ConnectBehavior::Succeed,
            services: csc_service_table(),
            subscribe_ok: true,
            channels: Mutex::new(Channels::default()),
        }
    }

    pub fn with_advertisement(mut self, address: &str, name: Option<&str>) -> Self {
        self.advertisements.push(advertisement(address, name));
        self
    }

    /// Add an advertisement listing `services` instead of the CSC service
    pub fn with_advertised_services(
        mut self,
        address: &str,
        name: Option<&str>,
        services: Vec<Uuid>,
    ) -> Self {
        self.advertisements.push(Advertisement {
            services,
            ..advertisement(address, name)
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_connect(mut self, behavior: ConnectBehavior) -> Self {
        self.connect = behavior;
        self
    }

    pub fn with_services(mut self, services: ServiceTable) -> Self {
        self.services = services;
        self
    }

    pub fn failing_subscribe(mut self) -> Self {
        self.subscribe_ok = false;
        self
    }

    /// Deliver one notification payload on the live link
    pub fn notify(&self, payload: &[u8]) -> bool {
        let channels = self.channels.lock().unwrap();
        channels
            .notifications
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(Bytes::copy_from_slice(payload)).is_ok())
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self, reason: &str) -> bool {
        let channels = self.channels.lock().unwrap();
        channels.link.as_ref().is_some_and(|tx| {
            tx.unbounded_send(LinkEvent::Disconnected(Some(reason.to_string())))
                .is_ok()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.channels.lock().unwrap().calls.clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.channels.lock().unwrap().calls.push(call.into());
    }
}

pub fn advertisement(address: &str, name: Option<&str>) -> Advertisement {
    Advertisement {
        address: address.to_string(),
        local_name: name.map(str::to_string),
        rssi: Some(-60),
        services: vec![CSC_SERVICE_UUID],
    }
}

pub fn csc_service_table() -> ServiceTable {
    ServiceTable {
        services: vec![ServiceInfo {
            uuid: CSC_SERVICE_UUID,
            characteristics: vec![CharacteristicInfo {
                uuid: CSC_MEASUREMENT_CHAR_UUID,
                notify: true,
                indicate: false,
                descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
            }],
        }],
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn adapter_enabled(&self) -> Result<bool> {
        self.record("adapter_enabled");
        Ok(self.enabled)
    }

    // Reports everything, like a platform that ignores the service filter
    async fn start_scan(&self, _service_filter: Option<Uuid>) -> Result<AdvertisementStream> {
        self.record("start_scan");
        let (tx, rx) = mpsc::unbounded();
        for advertisement in &self.advertisements {
            let _ = tx.unbounded_send(advertisement.clone());
        }
        self.channels.lock().unwrap().scan = Some(tx);
        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record("stop_scan");
        self.channels.lock().unwrap().scan = None;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<LinkEventStream> {
        self.record(format!("connect {address}"));
        match self.connect {
            ConnectBehavior::Succeed => {
                let (tx, rx) = mpsc::unbounded();
                let _ = tx.unbounded_send(LinkEvent::Connected);
                self.channels.lock().unwrap().link = Some(tx);
                Ok(rx.boxed())
            }
            ConnectBehavior::Refuse => Err(CadenceError::ConnectionFailed(
                "connection refused".to_string(),
            )),
            ConnectBehavior::Hang => Ok(stream::pending().boxed()),
        }
    }

    async fn discover_services(&self, address: &str) -> Result<ServiceTable> {
        self.record(format!("discover_services {address}"));
        Ok(self.services.clone())
    }

    async fn subscribe(&self, address: &str, _characteristic: Uuid) -> Result<()> {
        self.record(format!("subscribe {address}"));
        if self.subscribe_ok {
            Ok(())
        } else {
            Err(CadenceError::SubscriptionFailed(
                "descriptor write rejected".to_string(),
            ))
        }
    }

    async fn notifications(
        &self,
        address: &str,
        _characteristic: Uuid,
    ) -> Result<NotificationStream> {
        self.record(format!("notifications {address}"));
        let (tx, rx) = mpsc::unbounded();
        self.channels.lock().unwrap().notifications = Some(tx);
        Ok(rx.boxed())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.record(format!("disconnect {address}"));
        let mut channels = self.channels.lock().unwrap();
        channels.link = None;
        channels.notifications = None;
        Ok(())
    }
}
