use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::btle::BtleTransport;
use crate::channel::{self, Notifications, Producer};
use crate::handshake::{Discovered, DiscoveryHandshake};
use crate::peripheral::{ConnectionState, Link, Peripheral};
use crate::pending::{PendingOperation, Waiter};
use crate::service::Profile;
use crate::transport::{
    Cause, DeviceHandle, DeviceId, EventReceiver, RadioState, Transport, TransportEvent,
};
use crate::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct ScanConfig {
    /// Services a device must advertise. `None` uses the profile's services.
    services: Option<Vec<Uuid>>,
    /// Case-insensitive substring the device name must contain.
    name_filter: Option<String>,
    /// Ignore the profile's name filter when no explicit one is set.
    any_name: bool,
    /// End the scan when no new device turned up for this long.
    idle_timeout: Option<Duration>,
}

impl ScanConfig {
    /// Only report devices advertising one of these services
    pub fn filter_by_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = Some(services);
        self
    }

    /// Report devices regardless of their advertised services
    pub fn any_service(self) -> Self {
        self.filter_by_services(Vec::new())
    }

    /// Only report devices whose name contains `name`, ignoring case
    pub fn filter_by_name(mut self, name: impl Into<String>) -> Self {
        self.name_filter = Some(name.into());
        self.any_name = false;
        self
    }

    /// Report devices regardless of their name
    pub fn any_name(mut self) -> Self {
        self.name_filter = None;
        self.any_name = true;
        self
    }

    /// Stop the scan once no new device has been found for `timeout`
    pub fn stop_after_idle(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConnectConfig {
    /// Give up when the connection and discovery take longer than this.
    timeout: Option<Duration>,
}

impl ConnectConfig {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct ScanSession {
    id: u64,
    producer: Producer<DeviceHandle>,
    name_filter: Option<String>,
    last_activity: Instant,
}

/// The single device being connected to or connected.
struct Session {
    device: DeviceHandle,
    handshake: Option<DiscoveryHandshake>,
    link: Option<Arc<Link>>,
    cancel_requested: bool,
}

impl Session {
    fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            handshake: None,
            link: None,
            cancel_requested: false,
        }
    }
}

struct State {
    radio: RadioState,
    discovered: Vec<DeviceHandle>,
    scan: Option<ScanSession>,
    next_scan: u64,
    session: Option<Session>,
}

struct Shared<P: Profile> {
    transport: Arc<dyn Transport>,
    ready: PendingOperation<bool>,
    connecting: PendingOperation<Peripheral<P>>,
    state: Mutex<State>,
    connection_error: watch::Sender<bool>,
    connection_error_receiver: watch::Receiver<bool>,
    connection_state: watch::Sender<ConnectionState>,
    connection_state_receiver: watch::Receiver<ConnectionState>,
}

/// Turns the event stream of a [`Transport`] into awaitable calls.
///
/// All transport events are handled on one task spawned by [`new`](Self::new);
/// it stops once the manager is dropped.
pub struct CentralManager<P: Profile> {
    shared: Arc<Shared<P>>,
}

impl<P: Profile> CentralManager<P> {
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, events: EventReceiver) -> Self {
        let (connection_error, connection_error_receiver) = watch::channel(false);
        let (connection_state, connection_state_receiver) =
            watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            transport,
            ready: PendingOperation::new(),
            connecting: PendingOperation::new(),
            state: Mutex::new(State {
                radio: RadioState::Unknown,
                discovered: Vec::new(),
                scan: None,
                next_scan: 0,
                session: None,
            }),
            connection_error,
            connection_error_receiver,
            connection_state,
            connection_state_receiver,
        });

        tokio::spawn(listen(Arc::downgrade(&shared), events));

        Self { shared }
    }

    /// Creates a manager on the platform Bluetooth adapter with the given index.
    pub async fn open(adapter_index: usize) -> Result<Self> {
        let (transport, events) = BtleTransport::open(adapter_index).await?;
        Ok(Self::new(transport, events))
    }

    pub fn radio_state(&self) -> RadioState {
        self.shared.state.lock().unwrap().radio
    }

    /// Waits for the radio to report its state. Anything but powered on is `false`.
    pub async fn is_ready(&self) -> Result<bool> {
        let waiter = {
            let state = self.shared.state.lock().unwrap();
            if state.radio.is_ready() {
                return Ok(true);
            }
            if state.radio.is_unusable() {
                return Ok(false);
            }
            self.shared.ready.register()?
        };

        waiter.await
    }

    /// Scans for devices, yielding each device once.
    ///
    /// The discovered set is cleared when the scan starts. Dropping the stream
    /// or calling [`stop_scan`](Self::stop_scan) stops the scan.
    pub fn discover(&self, config: ScanConfig) -> Result<Notifications<DeviceHandle>> {
        let previous = {
            let mut state = self.shared.state.lock().unwrap();
            if state.radio.is_unusable() {
                return Err(Error::NotReady);
            }
            state.scan.take()
        };

        if let Some(previous) = previous {
            log::debug!("Replacing the running scan");
            previous.producer.finish();
        }

        let services = config
            .services
            .unwrap_or_else(P::advertised_services);
        let name_filter = match config.name_filter {
            Some(name) => Some(name),
            None if config.any_name => None,
            None => P::NAME_FILTER.map(str::to_owned),
        };

        let devices = {
            let mut state = self.shared.state.lock().unwrap();
            let id = state.next_scan;
            state.next_scan += 1;

            let transport = self.shared.transport.clone();
            let shared = Arc::downgrade(&self.shared);
            let (producer, devices) = channel::channel(move || {
                log::info!("Stopping the scan");
                transport.stop_scan();
                if let Some(shared) = shared.upgrade() {
                    shared.clear_scan(id);
                }
            });

            state.discovered.clear();
            state.scan = Some(ScanSession {
                id,
                producer,
                name_filter,
                last_activity: Instant::now(),
            });

            if let Some(timeout) = config.idle_timeout {
                tokio::spawn(watch_idle(Arc::downgrade(&self.shared), id, timeout));
            }

            devices
        };

        log::info!("Starting the scan for {:?}", services);
        self.shared.transport.scan(&services);

        Ok(devices)
    }

    /// Ends the discovery stream, which stops the scan.
    pub fn stop_scan(&self) {
        self.shared.finish_scan(None);
    }

    /// Devices found by the current or last scan
    pub fn discovered(&self) -> Vec<DeviceHandle> {
        self.shared.state.lock().unwrap().discovered.clone()
    }

    pub fn device(&self, id: &DeviceId) -> Option<DeviceHandle> {
        self.shared
            .state
            .lock()
            .unwrap()
            .discovered
            .iter()
            .find(|d| d.id() == id)
            .cloned()
    }

    /// Connects and runs the discovery handshake for `P`.
    ///
    /// Resolves only after the handshake succeeded. Connecting to another
    /// device drops the current connection.
    pub async fn connect(&self, device: &DeviceHandle) -> Result<Peripheral<P>> {
        self.connect_with(device, ConnectConfig::default()).await
    }

    /// Connects to a device found by the last scan.
    pub async fn connect_id(&self, id: &DeviceId) -> Result<Peripheral<P>> {
        let device = self
            .device(id)
            .ok_or_else(|| Error::PeripheralNotFound(id.clone()))?;
        self.connect(&device).await
    }

    pub async fn connect_with(
        &self,
        device: &DeviceHandle,
        config: ConnectConfig,
    ) -> Result<Peripheral<P>> {
        let (waiter, previous, issue_connect) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.radio.is_unusable() {
                return Err(Error::NotReady);
            }

            match &state.session {
                Some(session) if session.device.id() == device.id() => {
                    if let Some(link) = &session.link {
                        return Ok(Peripheral::new(link.clone()));
                    }
                    (self.shared.connecting.register()?, None, false)
                }
                _ => {
                    let waiter = self.shared.connecting.register()?;
                    let previous = state.session.replace(Session::new(device.clone()));
                    (waiter, previous, true)
                }
            }
        };

        if let Some(previous) = previous {
            self.shared.teardown(previous);
        }

        if issue_connect {
            log::info!("Connecting to {:?}", device);
            self.shared.set_connection_state(ConnectionState::Connecting);
            self.shared.transport.connect(device.id());
        }

        match config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, waiter).await {
                Ok(result) => result,
                // The handshake may have finished while the timer fired.
                Err(_) => match self.shared.abandon_connect(device.id()) {
                    Some(peripheral) => Ok(peripheral),
                    None => {
                        log::warn!("Connecting to {} timed out", device.id());
                        Err(Error::Timeout)
                    }
                },
            },
            None => waiter.await,
        }
    }

    /// Asks the transport to drop the connection. Does not wait and never fails.
    pub fn cancel_connection(&self, peripheral: &Peripheral<P>) {
        if let Some(session) = self.shared.state.lock().unwrap().session.as_mut() {
            if session.device.id() == peripheral.id() {
                session.cancel_requested = true;
            }
        }

        log::info!("Disconnecting from {}", peripheral.id());
        self.shared.transport.cancel_connect(peripheral.id());
    }

    /// Set once a connected device drops with an error. Stays set until reset.
    pub fn connection_error(&self) -> watch::Receiver<bool> {
        self.shared.connection_error_receiver.clone()
    }

    pub fn has_connection_error(&self) -> bool {
        *self.shared.connection_error_receiver.borrow()
    }

    pub fn reset_connection_error(&self) {
        self.shared.connection_error.send(false).ok();
    }

    /// State of the current or last connection attempt.
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection_state_receiver.borrow()
    }

    pub fn connection_state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection_state_receiver.clone()
    }
}

async fn listen<P: Profile>(shared: Weak<Shared<P>>, events: EventReceiver) {
    let mut events = UnboundedReceiverStream::new(events);

    while let Some(event) = events.next().await {
        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => break,
        };

        log::trace!("Transport event: {:?}", event);
        shared.handle_event(event);
    }

    log::debug!("Transport event listener stopped");
}

async fn watch_idle<P: Profile>(shared: Weak<Shared<P>>, scan: u64, timeout: Duration) {
    let mut deadline = Instant::now() + timeout;

    loop {
        tokio::time::sleep_until(deadline).await;

        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };

        let last_activity = match shared.state.lock().unwrap().scan.as_ref() {
            Some(session) if session.id == scan => session.last_activity,
            _ => return,
        };

        if last_activity + timeout <= Instant::now() {
            log::info!("No new devices within {:?}", timeout);
            shared.finish_scan(Some(scan));
            return;
        }

        deadline = last_activity + timeout;
    }
}

async fn complete_connection<P: Profile>(
    shared: Weak<Shared<P>>,
    device: DeviceId,
    waiter: Waiter<Discovered>,
) {
    let result = waiter.await;

    if let Some(shared) = shared.upgrade() {
        shared.on_handshake_finished(&device, result);
    }
}

/// A device that advertises no name is not filtered out.
fn name_matches(name: Option<&str>, filter: &str) -> bool {
    match name {
        Some(name) => name.to_lowercase().contains(&filter.to_lowercase()),
        None => true,
    }
}

impl<P: Profile> Shared<P> {
    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(radio) => self.on_state_changed(radio),
            TransportEvent::DeviceDiscovered { device, name } => {
                self.on_device_discovered(device, name)
            }
            TransportEvent::Connected(device) => self.on_connected(device),
            TransportEvent::ConnectFailed { device, cause } => self.on_connect_failed(device, cause),
            TransportEvent::Disconnected { device, cause } => self.on_disconnected(device, cause),
            TransportEvent::ServicesDiscovered { device, result } => {
                let transport = self.transport.clone();
                self.with_handshake(&device, |handshake| {
                    handshake.on_services_discovered(transport.as_ref(), result)
                });
            }
            TransportEvent::CharacteristicsDiscovered {
                device,
                service,
                result,
            } => self.with_handshake(&device, |handshake| {
                handshake.on_characteristics_discovered(service, result)
            }),
            TransportEvent::CharacteristicDiscovered {
                device,
                service,
                characteristic,
            } => self.with_handshake(&device, |handshake| {
                handshake.on_characteristic_discovered(service, characteristic)
            }),
            TransportEvent::ValueUpdated {
                device,
                characteristic,
                value,
            } => {
                let link = self.connected_link(&device);
                match link {
                    Some(link) => link.on_value(characteristic, value),
                    None => log::trace!("Dropping value from {}", device),
                }
            }
        }
    }

    fn on_state_changed(&self, radio: RadioState) {
        log::info!("Radio state: {:?}", radio);

        let mut state = self.state.lock().unwrap();
        state.radio = radio;

        if radio != RadioState::Unknown && self.ready.is_waiting() {
            self.ready.resolve(radio.is_ready()).ok();
        }
    }

    fn on_device_discovered(&self, device: DeviceId, name: Option<String>) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let scan = match state.scan.as_mut() {
            Some(scan) => scan,
            None => return,
        };

        if state.discovered.iter().any(|d| d.id() == &device) {
            return;
        }

        if let Some(filter) = &scan.name_filter {
            if !name_matches(name.as_deref(), filter) {
                log::trace!("Skipping {} ({:?})", device, name);
                return;
            }
        }

        let handle = DeviceHandle::new(device, name);
        log::info!("Found device: {:?}", handle);

        state.discovered.push(handle.clone());
        scan.last_activity = Instant::now();
        scan.producer.send(handle);
    }

    fn on_connected(self: &Arc<Self>, device: DeviceId) {
        let mut state = self.state.lock().unwrap();

        let session = match state.session.as_mut() {
            Some(session)
                if session.device.id() == &device
                    && session.link.is_none()
                    && session.handshake.is_none() =>
            {
                session
            }
            _ => {
                log::debug!("Ignoring connection of {}", device);
                return;
            }
        };

        log::debug!("Connected to {}, discovering services", device);

        let mut handshake = DiscoveryHandshake::new(device.clone(), P::REQUIRED);
        match handshake.start(self.transport.as_ref()) {
            Ok(waiter) => {
                session.handshake = Some(handshake);
                tokio::spawn(complete_connection(Arc::downgrade(self), device, waiter));
            }
            Err(e) => {
                state.session = None;
                drop(state);
                self.set_connection_state(ConnectionState::Disconnected);
                self.connecting.reject(e).ok();
            }
        }
    }

    fn on_handshake_finished(&self, device: &DeviceId, result: Result<Discovered>) {
        let outcome = {
            let mut state = self.state.lock().unwrap();

            let session = match state.session.as_mut() {
                Some(session) if session.device.id() == device && session.handshake.is_some() => {
                    session
                }
                _ => {
                    log::debug!("Discarding stale handshake result for {}", device);
                    return;
                }
            };
            session.handshake = None;

            match result {
                Ok(discovered) => {
                    let link = Link::new(session.device.clone(), self.transport.clone(), discovered);
                    session.link = Some(link.clone());
                    Ok(Peripheral::new(link))
                }
                Err(e) => {
                    state.session = None;
                    Err(e)
                }
            }
        };

        match outcome {
            Ok(peripheral) => {
                log::info!("Connected to {:?}", peripheral.handle());
                self.set_connection_state(ConnectionState::Connected);
                self.connecting.resolve(peripheral).ok();
            }
            Err(e) => {
                log::warn!("Rejecting {}: {}", device, e);
                self.set_connection_state(ConnectionState::Disconnected);
                self.transport.cancel_connect(device);
                self.connecting.reject(e).ok();
            }
        }
    }

    fn on_connect_failed(&self, device: DeviceId, cause: Option<Cause>) {
        let failed = {
            let mut state = self.state.lock().unwrap();
            match &state.session {
                Some(session) if session.device.id() == &device && session.link.is_none() => {
                    state.session = None;
                    true
                }
                _ => false,
            }
        };

        if failed {
            let error = Error::from_cause(cause);
            log::warn!("Could not connect to {}: {}", device, error);
            self.set_connection_state(ConnectionState::Disconnected);
            self.connecting.reject(error).ok();
        }
    }

    fn on_disconnected(&self, device: DeviceId, cause: Option<Cause>) {
        let session = {
            let mut state = self.state.lock().unwrap();
            match &state.session {
                Some(session) if session.device.id() == &device => state.session.take(),
                _ => None,
            }
        };

        let session = match session {
            Some(session) => session,
            None => {
                log::debug!("Ignoring disconnection of {}", device);
                return;
            }
        };

        match session.link {
            None => {
                let error = Error::from_cause(cause);
                log::warn!("{} disconnected while connecting: {}", device, error);
                self.set_connection_state(ConnectionState::Disconnected);
                self.connecting.reject(error).ok();
            }
            Some(link) => match cause {
                Some(cause) if !session.cancel_requested => {
                    log::warn!("{} disconnected: {}", device, cause);
                    link.close(ConnectionState::ErroredDisconnected);
                    self.set_connection_state(ConnectionState::ErroredDisconnected);
                    self.connection_error.send(true).ok();
                }
                _ => {
                    log::info!("{} disconnected", device);
                    link.close(ConnectionState::Disconnected);
                    self.set_connection_state(ConnectionState::Disconnected);
                }
            },
        }
    }

    fn with_handshake(&self, device: &DeviceId, f: impl FnOnce(&mut DiscoveryHandshake)) {
        let mut state = self.state.lock().unwrap();

        let handshake = state
            .session
            .as_mut()
            .filter(|session| session.device.id() == device)
            .and_then(|session| session.handshake.as_mut());

        match handshake {
            Some(handshake) => f(handshake),
            None => log::debug!("No discovery in progress for {}", device),
        }
    }

    fn connected_link(&self, device: &DeviceId) -> Option<Arc<Link>> {
        let state = self.state.lock().unwrap();
        state
            .session
            .as_ref()
            .filter(|session| session.device.id() == device)
            .and_then(|session| session.link.clone())
    }

    /// Finishes the scan with the given id, or whichever scan is running.
    fn finish_scan(&self, id: Option<u64>) {
        let scan = {
            let mut state = self.state.lock().unwrap();
            match &state.scan {
                Some(scan) if id.map(|id| id == scan.id).unwrap_or(true) => state.scan.take(),
                _ => None,
            }
        };

        if let Some(scan) = scan {
            scan.producer.finish();
        }
    }

    fn clear_scan(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.scan.as_ref().map(|scan| scan.id) == Some(id) {
            state.scan = None;
        }
    }

    /// Gives up on connecting to `device`. Returns the peripheral instead if
    /// the connection completed in the meantime.
    fn abandon_connect(&self, device: &DeviceId) -> Option<Peripheral<P>> {
        let session = {
            let mut state = self.state.lock().unwrap();
            match &state.session {
                Some(session) if session.device.id() == device => match &session.link {
                    Some(link) => return Some(Peripheral::new(link.clone())),
                    None => state.session.take(),
                },
                _ => None,
            }
        };

        self.connecting.abandon();

        if session.is_some() {
            self.set_connection_state(ConnectionState::Disconnected);
            self.transport.cancel_connect(device);
        }

        None
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.send(state).ok();
    }

    fn teardown(&self, session: Session) {
        log::debug!("Dropping session with {}", session.device.id());

        if let Some(link) = session.link {
            link.close(ConnectionState::Disconnected);
        }
        self.transport.cancel_connect(session.device.id());
    }
}

impl<P: Profile> Drop for Shared<P> {
    fn drop(&mut self) {
        let (scan, session) = match self.state.get_mut() {
            Ok(state) => (state.scan.take(), state.session.take()),
            Err(_) => return,
        };

        if let Some(scan) = scan {
            scan.producer.finish();
        }

        if let Some(session) = session {
            self.teardown(session);
        }
    }
}
