use crate::{
    ble::BtleplugTransport,
    error::{CadenceError, Result},
    machine::{ConnectionStateMachine, ScanDecision},
    session::{ConnectionSession, LinkSignal},
    staleness::sleep_until_deadline,
    transport::{
        Advertisement, AdvertisementStream, BleTransport, GrantAll, LinkEvent, Operation,
        PermissionGate,
    },
    types::{
        ConnectionState, DiscoveredDevice, PeripheralHandle, SessionConfig, SessionEvent,
        SessionFailure, SessionStatus, TimeoutConfig,
    },
    CSC_SERVICE_UUID,
};
use futures::stream::StreamExt;
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Main interface for reading cadence from a BLE cycling speed and cadence sensor
///
/// `CadenceSensor` owns a background worker that is the single writer of the
/// connection state, the cadence estimate and the stale-data deadline. Intents
/// are queued to the worker and return immediately; outcomes are reported as
/// [`SessionEvent`]s on the receiver returned alongside the handle.
///
/// # Examples
///
/// ## Interactive selection
///
/// ```no_run
/// use cadencers::{CadenceSensor, SessionConfig, SessionEvent, TimeoutConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (sensor, mut events) =
///         CadenceSensor::start(SessionConfig::default(), TimeoutConfig::default()).await?;
///
///     sensor.request_start_scan_or_connect()?;
///
///     while let Some(event) = events.recv().await {
///         match event {
///             SessionEvent::DiscoveryComplete(devices) => {
///                 if let Some(device) = devices.first() {
///                     sensor.select_device(device.handle.address())?;
///                 }
///             }
///             SessionEvent::CadenceUpdated(rpm) => println!("{rpm:.0} RPM"),
///             other => println!("{other:?}"),
///         }
///     }
///
///     Ok(())
/// }
/// ```
///
/// ## Auto-connect to a known sensor
///
/// ```no_run
/// use cadencers::{CadenceSensor, ScanMode, SessionConfig, TimeoutConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SessionConfig {
///         target_address: Some("C2:23:F0:E9:B0:EE".to_string()),
///         scan_mode: ScanMode::AutoConnect,
///         ..Default::default()
///     };
///
///     let (sensor, _events) = CadenceSensor::start(config, TimeoutConfig::default()).await?;
///     sensor.request_start_scan_or_connect()?;
///
///     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
///     println!("Cadence: {:.0} RPM", sensor.cadence_rpm().await);
///
///     sensor.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct CadenceSensor {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<SessionStatus>>,
    worker: JoinHandle<()>,
}

impl CadenceSensor {
    /// Start a session on the first system Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::AdapterUnavailable`] if the host has no adapter,
    /// or [`CadenceError::Ble`] if the BLE stack cannot be initialized.
    pub async fn start(
        config: SessionConfig,
        timeouts: TimeoutConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let transport = BtleplugTransport::new().await?;
        Ok(Self::with_transport(
            Arc::new(transport),
            Arc::new(GrantAll),
            config,
            timeouts,
        ))
    }

    /// Start a session over an arbitrary transport and permission gate
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_transport(
        transport: Arc<dyn BleTransport>,
        gate: Arc<dyn PermissionGate>,
        config: SessionConfig,
        timeouts: TimeoutConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(SessionStatus::default()));

        let worker = SessionWorker {
            transport,
            gate,
            machine: ConnectionStateMachine::new(config.target_address.clone()),
            config,
            timeouts,
            session: None,
            scan: None,
            pending: VecDeque::new(),
            commands: command_rx,
            events: event_tx,
            status: Arc::clone(&status),
        };
        let worker = tokio::spawn(worker.run());

        (
            Self {
                commands: command_tx,
                status,
                worker,
            },
            event_rx,
        )
    }

    /// Start a scan; a configured target is connected to as soon as it is seen
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::WorkerStopped`] if the session has shut down.
    /// Scan failures are reported as [`SessionEvent::Error`].
    pub fn request_start_scan_or_connect(&self) -> Result<()> {
        self.send(Command::StartScanOrConnect)
    }

    /// Connect to a device from the current discovery set
    ///
    /// Any existing link is torn down first.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::WorkerStopped`] if the session has shut down.
    pub fn select_device(&self, address: impl Into<String>) -> Result<()> {
        self.send(Command::SelectDevice(address.into()))
    }

    /// Tear down the link, or cancel an open scan
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::WorkerStopped`] if the session has shut down.
    pub fn request_disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Get current session status
    pub async fn status(&self) -> SessionStatus {
        self.status.read().await.clone()
    }

    /// Current connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.status.read().await.state
    }

    /// Latest cadence in RPM
    pub async fn cadence_rpm(&self) -> f64 {
        self.status.read().await.cadence_rpm
    }

    /// Tear down any link and stop the worker
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::WorkerStopped`] if the worker had already exited
    /// abnormally.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.worker.await.map_err(|e| {
            error!("Session worker failed: {}", e);
            CadenceError::WorkerStopped
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CadenceError::WorkerStopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    StartScanOrConnect,
    SelectDevice(String),
    Disconnect,
    Shutdown,
}

enum Step {
    Command(Command),
    Advertisement(Option<Advertisement>),
    ScanDeadline,
    Link(LinkSignal),
}

struct ScanWindow {
    advertisements: Option<AdvertisementStream>,
    deadline: Instant,
}

/// Single consumer of intents and transport events
struct SessionWorker {
    transport: Arc<dyn BleTransport>,
    gate: Arc<dyn PermissionGate>,
    config: SessionConfig,
    timeouts: TimeoutConfig,
    machine: ConnectionStateMachine,
    session: Option<ConnectionSession>,
    scan: Option<ScanWindow>,
    pending: VecDeque<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: Arc<RwLock<SessionStatus>>,
}

impl SessionWorker {
    async fn run(mut self) {
        info!("Session worker started");

        loop {
            let step = match self.pending.pop_front() {
                Some(command) => Step::Command(command),
                None => self.next_step().await,
            };

            match step {
                Step::Command(Command::Shutdown) => break,
                Step::Command(command) => self.handle_command(command).await,
                Step::Advertisement(Some(advertisement)) => {
                    self.handle_advertisement(advertisement).await;
                }
                Step::Advertisement(None) => {
                    debug!("Advertisement stream ended before the scan window closed");
                    if let Some(scan) = self.scan.as_mut() {
                        scan.advertisements = None;
                    }
                }
                Step::ScanDeadline => self.close_scan_window().await,
                Step::Link(signal) => self.handle_signal(signal).await,
            }
        }

        self.stop_scan().await;
        self.teardown(true).await;
        info!("Session worker stopped");
    }

    async fn next_step(&mut self) -> Step {
        let scan_deadline = self.scan.as_ref().map(|scan| scan.deadline);
        let advertisements = self
            .scan
            .as_mut()
            .and_then(|scan| scan.advertisements.as_mut());
        let session = self.session.as_mut();

        tokio::select! {
            command = self.commands.recv() => Step::Command(command.unwrap_or(Command::Shutdown)),
            advertisement = next_advertisement(advertisements) => Step::Advertisement(advertisement),
            () = sleep_until_deadline(scan_deadline) => Step::ScanDeadline,
            signal = next_link_signal(session) => Step::Link(signal),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::StartScanOrConnect => self.start_scan().await,
            Command::SelectDevice(address) => self.select_device(&address).await,
            Command::Disconnect => self.disconnect().await,
            Command::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            self.fail(&e);
        }
    }

    async fn start_scan(&mut self) -> Result<()> {
        self.machine.check_can_scan()?;
        self.gate.check(Operation::Scan)?;

        if !self.transport.adapter_enabled().await? {
            return Err(CadenceError::AdapterDisabled);
        }

        let filter = self.config.filter_by_service.then_some(CSC_SERVICE_UUID);
        let advertisements = self.transport.start_scan(filter).await?;

        self.machine.begin_scan()?;
        self.announce_state().await;

        let window = Duration::from_millis(self.timeouts.scan_timeout_ms);
        info!("Scanning for cadence sensors for {}ms", window.as_millis());
        self.scan = Some(ScanWindow {
            advertisements: Some(advertisements),
            deadline: Instant::now() + window,
        });

        Ok(())
    }

    async fn handle_advertisement(&mut self, advertisement: Advertisement) {
        // Some platforms ignore the scan filter; an empty list may still be a
        // sensor that only names its services in the scan response
        if self.config.filter_by_service
            && !advertisement.services.is_empty()
            && !advertisement.services.contains(&CSC_SERVICE_UUID)
        {
            debug!(
                "Ignoring {} which advertises no cadence service",
                advertisement.address
            );
            return;
        }

        let device = DiscoveredDevice::from(advertisement);
        if let ScanDecision::TargetMatched(handle) = self.machine.record_discovery(device) {
            self.stop_scan().await;
            self.connect(handle).await;
        }
    }

    async fn close_scan_window(&mut self) {
        self.stop_scan().await;

        let result = self.machine.finish_scan(self.config.scan_mode);
        self.announce_state().await;

        match result {
            Ok(devices) => {
                info!("Scan completed. Found {} device(s)", devices.len());
                self.emit(SessionEvent::DiscoveryComplete(devices));
            }
            Err(e) => self.fail(&e),
        }
    }

    async fn stop_scan(&mut self) {
        if self.scan.take().is_none() {
            return;
        }
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    async fn select_device(&mut self, address: &str) -> Result<()> {
        let handle = self.machine.lookup(address)?;

        match self.machine.state() {
            ConnectionState::Scanning => self.stop_scan().await,
            ConnectionState::Active => self.teardown(true).await,
            _ => {}
        }

        self.connect(handle).await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        match self.machine.state() {
            ConnectionState::Scanning => {
                info!("Scan cancelled");
                self.stop_scan().await;
                self.enter(ConnectionState::Idle).await
            }
            ConnectionState::Active => {
                self.teardown(true).await;
                Ok(())
            }
            _ => Err(CadenceError::NotConnected),
        }
    }

    /// Run one connection attempt to completion, interruption, or failure
    async fn connect(&mut self, handle: PeripheralHandle) {
        match self.establish(&handle).await {
            Ok(Some(session)) => {
                self.session = Some(session);
                info!("Cadence notifications active on {}", handle);
            }
            Ok(None) => {
                info!("Connection attempt to {} interrupted", handle);
                self.abandon_attempt(&handle, true).await;
            }
            Err(e) => {
                self.abandon_attempt(&handle, false).await;
                self.fail(&e);
            }
        }
    }

    /// Walk Connecting -> ServiceDiscovery -> SubscribingNotifications -> Active
    ///
    /// `Ok(None)` means an intent interrupted the attempt.
    async fn establish(&mut self, handle: &PeripheralHandle) -> Result<Option<ConnectionSession>> {
        self.enter(ConnectionState::Connecting).await?;
        self.status.write().await.device = Some(handle.clone());
        info!("Connecting to device: {}", handle);

        self.gate.check(Operation::Connect)?;
        let transport = Arc::clone(&self.transport);
        let address = handle.address().to_string();
        let link = async move {
            let mut events = transport.connect(&address).await?;
            let first = events.next().await;
            match first {
                Some(LinkEvent::Connected) => Ok::<_, CadenceError>(events),
                Some(LinkEvent::Disconnected(reason)) => Err(CadenceError::ConnectionFailed(
                    reason.unwrap_or_else(|| "link closed".to_string()),
                )),
                None => Err(CadenceError::ConnectionFailed(
                    "link closed before it was established".to_string(),
                )),
            }
        };
        let Some(link_events) = self.run_stage(self.timeouts.connect_timeout_ms, link).await?
        else {
            return Ok(None);
        };
        let mut session = ConnectionSession::new(
            handle.clone(),
            link_events,
            self.timeouts.stale_window(),
            self.config.zero_revolution_policy,
        );

        self.enter(ConnectionState::ServiceDiscovery).await?;
        self.gate.check(Operation::DiscoverServices)?;
        let transport = Arc::clone(&self.transport);
        let address = handle.address().to_string();
        let discovery = async move { transport.discover_services(&address).await };
        let Some(services) = self
            .run_stage(self.timeouts.service_discovery_timeout_ms, discovery)
            .await?
        else {
            return Ok(None);
        };
        let characteristic = services.csc_measurement()?.uuid;
        debug!("CSC measurement characteristic resolved: {}", characteristic);

        self.enter(ConnectionState::SubscribingNotifications).await?;
        self.gate.check(Operation::Subscribe)?;
        let transport = Arc::clone(&self.transport);
        let address = handle.address().to_string();
        let subscription = async move {
            let notifications = transport.notifications(&address, characteristic).await?;
            transport.subscribe(&address, characteristic).await?;
            Ok::<_, CadenceError>(notifications)
        };
        let Some(notifications) = self
            .run_stage(self.timeouts.subscribe_timeout_ms, subscription)
            .await?
        else {
            return Ok(None);
        };

        self.enter(ConnectionState::Active).await?;
        session.attach_notifications(notifications, Instant::now());
        {
            let mut status = self.status.write().await;
            status.cadence_rpm = 0.0;
            status.stale = false;
        }

        Ok(Some(session))
    }

    /// Drive one bounded connection stage while staying responsive to intents
    ///
    /// Returns `Ok(None)` when a disconnect, a new selection, or shutdown
    /// interrupts the stage. The two latter are requeued.
    async fn run_stage<T>(
        &mut self,
        timeout_ms: u64,
        stage: impl Future<Output = Result<T>>,
    ) -> Result<Option<T>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        tokio::pin!(stage);

        loop {
            tokio::select! {
                result = &mut stage => return result.map(Some),
                () = tokio::time::sleep_until(deadline) => {
                    warn!("{} stage timed out after {}ms", self.machine.state(), timeout_ms);
                    return Err(CadenceError::Timeout { timeout_ms });
                }
                command = self.commands.recv() => match command {
                    Some(Command::StartScanOrConnect) => self.fail(&CadenceError::AlreadyConnected),
                    Some(Command::Disconnect) => return Ok(None),
                    Some(command) => {
                        self.pending.push_back(command);
                        return Ok(None);
                    }
                    None => {
                        self.pending.push_back(Command::Shutdown);
                        return Ok(None);
                    }
                },
            }
        }
    }

    async fn abandon_attempt(&mut self, handle: &PeripheralHandle, interrupted: bool) {
        if !self.machine.state().is_live() {
            return;
        }
        if interrupted {
            self.enter_or_log(ConnectionState::Disconnecting).await;
        }
        self.release_link(handle).await;
        self.enter_or_log(ConnectionState::Idle).await;
        self.reset_status().await;
    }

    /// Tear down the active session, if any
    async fn teardown(&mut self, release: bool) {
        let Some(session) = self.session.take() else {
            return;
        };

        self.enter_or_log(ConnectionState::Disconnecting).await;
        let handle = session.teardown();
        if release {
            self.release_link(&handle).await;
        }
        self.enter_or_log(ConnectionState::Idle).await;
        self.reset_status().await;
        info!("Disconnected from {}", handle);
    }

    async fn release_link(&mut self, handle: &PeripheralHandle) {
        let timeout_ms = self.timeouts.disconnect_timeout_ms;
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.transport.disconnect(handle.address()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to disconnect from {}: {}", handle, e),
            Err(_) => warn!("Disconnect from {} timed out after {}ms", handle, timeout_ms),
        }
    }

    async fn handle_signal(&mut self, signal: LinkSignal) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match signal {
            LinkSignal::Payload(payload) => match session.handle_payload(&payload, Instant::now()) {
                Ok(Some(rpm)) => {
                    {
                        let mut status = self.status.write().await;
                        status.cadence_rpm = rpm;
                        status.stale = false;
                    }
                    self.emit(SessionEvent::CadenceUpdated(rpm));
                }
                Ok(None) => {}
                Err(e) => debug!("Discarding CSC measurement {:02X?}: {}", &payload[..], e),
            },
            LinkSignal::StaleDeadline => {
                if session.check_stale(Instant::now()) {
                    {
                        let mut status = self.status.write().await;
                        status.cadence_rpm = 0.0;
                        status.stale = true;
                    }
                    self.emit(SessionEvent::CadenceStale);
                }
            }
            LinkSignal::Lost(reason) => {
                warn!(
                    "Connection to {} lost: {}",
                    session.handle(),
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.teardown(false).await;
            }
        }
    }

    async fn enter(&mut self, to: ConnectionState) -> Result<()> {
        self.machine.transition(to)?;
        self.announce_state().await;
        Ok(())
    }

    async fn enter_or_log(&mut self, to: ConnectionState) {
        if let Err(e) = self.enter(to).await {
            error!("{}", e);
        }
    }

    async fn announce_state(&mut self) {
        let state = self.machine.state();
        self.status.write().await.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    async fn reset_status(&mut self) {
        let mut status = self.status.write().await;
        status.cadence_rpm = 0.0;
        status.device = None;
        status.stale = false;
    }

    fn fail(&self, error: &CadenceError) {
        error!("{}", error);
        self.emit(SessionEvent::Error(SessionFailure::from(error)));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, no receiver");
        }
    }
}

async fn next_advertisement(
    advertisements: Option<&mut AdvertisementStream>,
) -> Option<Advertisement> {
    match advertisements {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_link_signal(session: Option<&mut ConnectionSession>) -> LinkSignal {
    match session {
        Some(session) => session.next_signal().await,
        None => std::future::pending().await,
    }
}
