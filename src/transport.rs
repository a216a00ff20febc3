//! The boundary to the radio stack.
//!
//! A [`Transport`] accepts requests without waiting for them to finish.
//! Every outcome is reported back later as a [`TransportEvent`] on the
//! event bus handed to the [`CentralManager`](crate::CentralManager).

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

/// A failure reported by the radio stack.
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates the bus that carries events from a transport to its manager.
pub fn event_bus() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Transport-assigned identity of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A device seen while scanning.
///
/// The transport owns the platform object behind the id; the handle only
/// refers to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    id: DeviceId,
    name: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<DeviceId>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    #[inline]
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Advertised local name of the device
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_ready(self) -> bool {
        self == RadioState::PoweredOn
    }

    /// Whether the stack has reported a state that rules out using the radio.
    pub fn is_unusable(self) -> bool {
        !matches!(self, RadioState::Unknown | RadioState::PoweredOn)
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(RadioState),
    DeviceDiscovered {
        device: DeviceId,
        name: Option<String>,
    },
    Connected(DeviceId),
    ConnectFailed {
        device: DeviceId,
        cause: Option<Cause>,
    },
    Disconnected {
        device: DeviceId,
        cause: Option<Cause>,
    },
    ServicesDiscovered {
        device: DeviceId,
        result: Result<Vec<Uuid>, Cause>,
    },
    /// The complete set of characteristics found for one service.
    CharacteristicsDiscovered {
        device: DeviceId,
        service: Uuid,
        result: Result<Vec<Uuid>, Cause>,
    },
    /// A single characteristic, for stacks that report them one at a time
    /// ahead of the complete per-service result.
    CharacteristicDiscovered {
        device: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
    /// A notification. `None` means the update carried no payload.
    ValueUpdated {
        device: DeviceId,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
    },
}

/// Requests understood by a radio stack.
///
/// None of these wait for the operation to complete. Implementations must
/// be callable from any thread, including from inside stream drop handlers.
pub trait Transport: Send + Sync {
    fn scan(&self, services: &[Uuid]);

    fn stop_scan(&self);

    fn connect(&self, device: &DeviceId);

    fn cancel_connect(&self, device: &DeviceId);

    /// Discover the given services. An empty filter means all services.
    fn discover_services(&self, device: &DeviceId, services: &[Uuid]);

    /// Discover the given characteristics of a service. An empty filter
    /// means all characteristics.
    fn discover_characteristics(&self, device: &DeviceId, service: Uuid, characteristics: &[Uuid]);

    fn set_notify(&self, device: &DeviceId, characteristic: Uuid, enabled: bool);
}
