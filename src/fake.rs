//! Scripted radio used by the unit tests.

use std::io;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::transport::{
    event_bus, Cause, DeviceId, EventReceiver, EventSender, Transport, TransportEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Scan(Vec<Uuid>),
    StopScan,
    Connect(DeviceId),
    CancelConnect(DeviceId),
    DiscoverServices(DeviceId, Vec<Uuid>),
    DiscoverCharacteristics(DeviceId, Uuid, Vec<Uuid>),
    SetNotify(DeviceId, Uuid, bool),
}

#[derive(Clone)]
pub(crate) struct FakeDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub services: Vec<(Uuid, Vec<Uuid>)>,
    pub connect_error: Option<Option<Cause>>,
}

impl FakeDevice {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            id: DeviceId::from(id),
            name: name.map(str::to_owned),
            services: Vec::new(),
            connect_error: None,
        }
    }

    pub fn with_service(mut self, service: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.push((service, characteristics.to_vec()));
        self
    }

    /// Makes connection attempts fail with the given cause.
    pub fn failing_connect(mut self, cause: Option<Cause>) -> Self {
        self.connect_error = Some(cause);
        self
    }
}

pub(crate) fn cause(message: &str) -> Cause {
    Arc::new(io::Error::new(io::ErrorKind::Other, message.to_owned()))
}

/// Records every request. When given devices it also answers requests the
/// way a radio with those devices in range would.
pub(crate) struct FakeTransport {
    events: EventSender,
    requests: Mutex<Vec<Request>>,
    devices: Option<Vec<FakeDevice>>,
}

impl FakeTransport {
    /// A transport that only records requests; events are emitted by hand.
    pub fn new() -> (Arc<Self>, EventReceiver) {
        Self::build(None)
    }

    pub fn scripted(devices: Vec<FakeDevice>) -> (Arc<Self>, EventReceiver) {
        Self::build(Some(devices))
    }

    fn build(devices: Option<Vec<FakeDevice>>) -> (Arc<Self>, EventReceiver) {
        let (events, receiver) = event_bus();
        let transport = Arc::new(Self {
            events,
            requests: Mutex::new(Vec::new()),
            devices,
        });
        (transport, receiver)
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event).ok();
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, request: &Request) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| *r == request)
            .count()
    }

    fn record(&self, request: Request) {
        self.requests.lock().unwrap().push(request);
    }

    fn device(&self, id: &DeviceId) -> Option<&FakeDevice> {
        self.devices.as_ref()?.iter().find(|d| &d.id == id)
    }
}

fn filtered(found: &[Uuid], filter: &[Uuid]) -> Vec<Uuid> {
    found
        .iter()
        .filter(|uuid| filter.is_empty() || filter.contains(uuid))
        .copied()
        .collect()
}

impl Transport for FakeTransport {
    fn scan(&self, services: &[Uuid]) {
        self.record(Request::Scan(services.to_vec()));

        for device in self.devices.iter().flatten() {
            let advertised = device.services.iter().map(|(s, _)| *s).collect::<Vec<_>>();
            if services.is_empty() || !filtered(&advertised, services).is_empty() {
                self.emit(TransportEvent::DeviceDiscovered {
                    device: device.id.clone(),
                    name: device.name.clone(),
                });
            }
        }
    }

    fn stop_scan(&self) {
        self.record(Request::StopScan);
    }

    fn connect(&self, device: &DeviceId) {
        self.record(Request::Connect(device.clone()));

        if self.devices.is_none() {
            return;
        }

        let event = match self.device(device) {
            Some(FakeDevice {
                connect_error: Some(cause),
                ..
            }) => TransportEvent::ConnectFailed {
                device: device.clone(),
                cause: cause.clone(),
            },
            Some(_) => TransportEvent::Connected(device.clone()),
            None => TransportEvent::ConnectFailed {
                device: device.clone(),
                cause: None,
            },
        };
        self.emit(event);
    }

    fn cancel_connect(&self, device: &DeviceId) {
        self.record(Request::CancelConnect(device.clone()));

        if self.device(device).is_some() {
            self.emit(TransportEvent::Disconnected {
                device: device.clone(),
                cause: None,
            });
        }
    }

    fn discover_services(&self, device: &DeviceId, services: &[Uuid]) {
        self.record(Request::DiscoverServices(device.clone(), services.to_vec()));

        if let Some(fake) = self.device(device) {
            let found = fake.services.iter().map(|(s, _)| *s).collect::<Vec<_>>();
            self.emit(TransportEvent::ServicesDiscovered {
                device: device.clone(),
                result: Ok(filtered(&found, services)),
            });
        }
    }

    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, characteristics: &[Uuid]) {
        self.record(Request::DiscoverCharacteristics(
            device.clone(),
            service,
            characteristics.to_vec(),
        ));

        if let Some(fake) = self.device(device) {
            let result = fake
                .services
                .iter()
                .find(|(s, _)| *s == service)
                .map(|(_, found)| filtered(found, characteristics))
                .ok_or_else(|| cause("no such service"));
            self.emit(TransportEvent::CharacteristicsDiscovered {
                device: device.clone(),
                service,
                result,
            });
        }
    }

    fn set_notify(&self, device: &DeviceId, characteristic: Uuid, enabled: bool) {
        self.record(Request::SetNotify(device.clone(), characteristic, enabled));
    }
}
