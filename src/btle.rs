use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::transport::{
    event_bus, Cause, DeviceId, EventReceiver, EventSender, RadioState, Transport, TransportEvent,
};
use crate::Result;

fn cause(message: &str) -> Cause {
    Arc::new(io::Error::new(io::ErrorKind::Other, message.to_owned()))
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

fn filtered(found: impl Iterator<Item = Uuid>, filter: &[Uuid]) -> Vec<Uuid> {
    found
        .filter(|uuid| filter.is_empty() || filter.contains(uuid))
        .collect()
}

/// Only disconnections nobody asked for carry a cause.
fn disconnect_cause(requested: bool) -> Option<Cause> {
    if requested {
        None
    } else {
        Some(cause("link lost"))
    }
}

/// Radio work, executed one at a time in the order requested.
enum Command {
    Scan(ScanFilter),
    StopScan,
    Connect(DeviceId, Peripheral),
    Disconnect(DeviceId, Peripheral),
    DiscoverServices(DeviceId, Peripheral, Vec<Uuid>),
    SetNotify(DeviceId, Peripheral, Characteristic, bool),
}

/// Notification forwarding tasks, at most one per device.
#[derive(Default)]
struct Forwarders {
    tasks: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
}

impl Forwarders {
    fn replace(&self, device: DeviceId, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.lock().unwrap().insert(device, task) {
            previous.abort();
        }
    }

    fn stop(&self, device: &DeviceId) {
        if let Some(task) = self.tasks.lock().unwrap().remove(device) {
            task.abort();
        }
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
    }
}

/// [`Transport`] on top of the platform Bluetooth stack, via btleplug.
pub struct BtleTransport {
    _manager: Manager,
    adapter: Adapter,
    events: EventSender,
    commands: mpsc::UnboundedSender<Command>,
    peripherals: Mutex<HashMap<DeviceId, Peripheral>>,
    /// Devices we asked to disconnect. Any other disconnection is a lost link.
    disconnecting: Mutex<HashSet<DeviceId>>,
    forwarders: Forwarders,
}

impl BtleTransport {
    /// Opens the adapter with the given index. Must be called from within a
    /// tokio runtime.
    pub async fn open(adapter_index: usize) -> Result<(Arc<Self>, EventReceiver)> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if adapter_index >= adapters.len() {
            return Err(btleplug::Error::DeviceNotFound.into());
        }

        let adapter = adapters.swap_remove(adapter_index);

        log::trace!("Using adapter: {:?}", adapter);

        let central_events = adapter.events().await?;
        let state = adapter.adapter_state().await?;

        let (events, receiver) = event_bus();
        events
            .send(TransportEvent::StateChanged(radio_state(state)))
            .ok();

        let (commands, command_receiver) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            _manager: manager,
            adapter,
            events,
            commands,
            peripherals: Mutex::new(HashMap::new()),
            disconnecting: Mutex::new(HashSet::new()),
            forwarders: Forwarders::default(),
        });

        tokio::spawn(pump(Arc::downgrade(&transport), central_events));
        tokio::spawn(run_commands(Arc::downgrade(&transport), command_receiver));

        Ok((transport, receiver))
    }

    fn emit(&self, event: TransportEvent) {
        self.events.send(event).ok();
    }

    fn submit(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("Command queue closed, dropping request");
        }
    }

    fn peripheral(&self, device: &DeviceId) -> Option<Peripheral> {
        self.peripherals.lock().unwrap().get(device).cloned()
    }

    async fn on_device_seen(&self, id: PeripheralId) {
        let peripheral = match self.adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                log::debug!("Could not look up {:?}: {}", id, e);
                return;
            }
        };

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|props| props.local_name);

        let device = DeviceId::new(id.to_string());
        self.peripherals
            .lock()
            .unwrap()
            .insert(device.clone(), peripheral);

        self.emit(TransportEvent::DeviceDiscovered { device, name });
    }

    fn on_device_disconnected(&self, id: PeripheralId) {
        let device = DeviceId::new(id.to_string());
        let requested = self.disconnecting.lock().unwrap().remove(&device);

        self.forwarders.stop(&device);

        let cause = disconnect_cause(requested);
        self.emit(TransportEvent::Disconnected { device, cause });
    }

    async fn execute(&self, command: Command) {
        match command {
            Command::Scan(filter) => {
                if let Err(e) = self.adapter.start_scan(filter).await {
                    log::error!("Could not start the scan: {}", e);
                }
            }
            Command::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    log::warn!("Could not stop the scan: {}", e);
                }
            }
            Command::Connect(device, peripheral) => self.connect_peripheral(device, peripheral).await,
            Command::Disconnect(device, peripheral) => {
                self.forwarders.stop(&device);
                if let Err(e) = peripheral.disconnect().await {
                    log::debug!("Could not disconnect {}: {}", device, e);
                }
            }
            Command::DiscoverServices(device, peripheral, filter) => {
                let result = match peripheral.discover_services().await {
                    Ok(()) => Ok(filtered(
                        peripheral.services().into_iter().map(|s| s.uuid),
                        &filter,
                    )),
                    Err(e) => Err(Arc::new(e) as Cause),
                };
                self.emit(TransportEvent::ServicesDiscovered { device, result });
            }
            Command::SetNotify(device, peripheral, target, enabled) => {
                let result = if enabled {
                    peripheral.subscribe(&target).await
                } else {
                    peripheral.unsubscribe(&target).await
                };
                if let Err(e) = result {
                    log::warn!(
                        "Could not set notify={} for {} on {}: {}",
                        enabled,
                        target.uuid,
                        device,
                        e
                    );
                }
            }
        }
    }

    async fn connect_peripheral(&self, device: DeviceId, peripheral: Peripheral) {
        if let Err(e) = peripheral.connect().await {
            let cause: Cause = Arc::new(e);
            return self.emit(TransportEvent::ConnectFailed {
                device,
                cause: Some(cause),
            });
        }

        // Start forwarding before reporting the connection so no update is missed.
        match peripheral.notifications().await {
            Ok(notifications) => {
                let task = tokio::spawn(forward_notifications(
                    device.clone(),
                    notifications,
                    self.events.clone(),
                ));
                self.forwarders.replace(device.clone(), task);
            }
            Err(e) => log::warn!("No notifications from {}: {}", device, e),
        }

        self.emit(TransportEvent::Connected(device));
    }
}

async fn pump(
    transport: Weak<BtleTransport>,
    mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
) {
    while let Some(event) = events.next().await {
        let transport = match transport.upgrade() {
            Some(transport) => transport,
            None => break,
        };

        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                transport.on_device_seen(id).await;
            }
            CentralEvent::DeviceDisconnected(id) => transport.on_device_disconnected(id),
            CentralEvent::StateUpdate(state) => {
                transport.emit(TransportEvent::StateChanged(radio_state(state)))
            }
            _ => {}
        }
    }

    log::debug!("Adapter event stream ended");
}

async fn run_commands(transport: Weak<BtleTransport>, commands: mpsc::UnboundedReceiver<Command>) {
    drain_in_order(commands, |command| {
        let transport = transport.upgrade()?;
        Some(async move { transport.execute(command).await })
    })
    .await;

    log::debug!("Command queue stopped");
}

/// Runs each queued item to completion before starting the next. Stops when
/// the queue closes or `run` returns `None`.
async fn drain_in_order<T, F, Fut>(mut queue: mpsc::UnboundedReceiver<T>, mut run: F)
where
    F: FnMut(T) -> Option<Fut>,
    Fut: Future<Output = ()>,
{
    while let Some(item) = queue.recv().await {
        match run(item) {
            Some(work) => work.await,
            None => break,
        }
    }
}

async fn forward_notifications(
    device: DeviceId,
    mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    events: EventSender,
) {
    while let Some(notification) = notifications.next().await {
        let event = TransportEvent::ValueUpdated {
            device: device.clone(),
            characteristic: notification.uuid,
            value: Some(notification.value),
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

impl Transport for BtleTransport {
    fn scan(&self, services: &[Uuid]) {
        self.submit(Command::Scan(ScanFilter {
            services: services.to_vec(),
        }));
    }

    fn stop_scan(&self) {
        self.submit(Command::StopScan);
    }

    fn connect(&self, device: &DeviceId) {
        let peripheral = match self.peripheral(device) {
            Some(peripheral) => peripheral,
            None => {
                return self.emit(TransportEvent::ConnectFailed {
                    device: device.clone(),
                    cause: Some(cause("unknown peripheral")),
                })
            }
        };
        self.disconnecting.lock().unwrap().remove(device);

        self.submit(Command::Connect(device.clone(), peripheral));
    }

    fn cancel_connect(&self, device: &DeviceId) {
        let peripheral = match self.peripheral(device) {
            Some(peripheral) => peripheral,
            None => return,
        };
        self.disconnecting.lock().unwrap().insert(device.clone());

        self.submit(Command::Disconnect(device.clone(), peripheral));
    }

    fn discover_services(&self, device: &DeviceId, services: &[Uuid]) {
        match self.peripheral(device) {
            Some(peripheral) => self.submit(Command::DiscoverServices(
                device.clone(),
                peripheral,
                services.to_vec(),
            )),
            None => self.emit(TransportEvent::ServicesDiscovered {
                device: device.clone(),
                result: Err(cause("unknown peripheral")),
            }),
        }
    }

    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, characteristics: &[Uuid]) {
        let result = match self.peripheral(device) {
            Some(peripheral) => peripheral
                .services()
                .into_iter()
                .find(|s| s.uuid == service)
                .map(|s| filtered(s.characteristics.into_iter().map(|c| c.uuid), characteristics))
                .ok_or_else(|| cause("service not found")),
            None => Err(cause("unknown peripheral")),
        };

        self.emit(TransportEvent::CharacteristicsDiscovered {
            device: device.clone(),
            service,
            result,
        });
    }

    fn set_notify(&self, device: &DeviceId, characteristic: Uuid, enabled: bool) {
        let peripheral = match self.peripheral(device) {
            Some(peripheral) => peripheral,
            None => return,
        };
        let target = match peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
        {
            Some(target) => target,
            None => {
                log::warn!("{} has no characteristic {}", device, characteristic);
                return;
            }
        };

        self.submit(Command::SetNotify(device.clone(), peripheral, target, enabled));
    }
}
