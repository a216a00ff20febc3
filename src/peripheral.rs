use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use uuid::Uuid;

use crate::channel::{self, Notifications, Producer};
use crate::characteristic::{required_service, Reading, Readings};
use crate::handshake::Discovered;
use crate::service::Profile;
use crate::transport::{DeviceHandle, DeviceId, Transport};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped with an error without being asked to.
    ErroredDisconnected,
}

struct Subscription {
    id: u64,
    producer: Producer<Vec<u8>>,
}

/// Live connection to one device after a successful handshake.
///
/// Holds at most one subscription per characteristic. Opening a second one
/// ends the first.
pub(crate) struct Link {
    device: DeviceHandle,
    transport: Arc<dyn Transport>,
    discovered: Discovered,
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
    state_receiver: watch::Receiver<ConnectionState>,
}

impl Link {
    pub(crate) fn new(
        device: DeviceHandle,
        transport: Arc<dyn Transport>,
        discovered: Discovered,
    ) -> Arc<Self> {
        let (state, state_receiver) = watch::channel(ConnectionState::Connected);

        Arc::new(Self {
            device,
            transport,
            discovered,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            state,
            state_receiver,
        })
    }

    pub(crate) fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn discovered(&self) -> &Discovered {
        &self.discovered
    }

    /// Opens a subscription and enables notification for it.
    pub(crate) fn open(
        self: &Arc<Self>,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Notifications<Vec<u8>>> {
        if !self.discovered.contains(characteristic) {
            return Err(Error::MissingCharacteristic {
                service,
                characteristic,
            });
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let link = Arc::downgrade(self);
        let (producer, notifications) = channel::channel(move || {
            if let Some(link) = link.upgrade() {
                link.on_subscription_terminated(characteristic, id);
            }
        });

        let replaced = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if self.is_closed() {
                return Err(Error::NotConnected);
            }
            subscriptions.insert(characteristic, Subscription { id, producer })
        };

        if let Some(previous) = replaced {
            log::debug!(
                "Replacing subscription to {} on {}",
                characteristic,
                self.device.id()
            );
            previous.producer.finish();
        }

        log::debug!("Enabling notification for {} on {}", characteristic, self.device.id());
        self.transport.set_notify(self.device.id(), characteristic, true);

        Ok(notifications)
    }

    fn on_subscription_terminated(&self, characteristic: Uuid, id: u64) {
        let closed = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if subscriptions.get(&characteristic).map(|s| s.id) == Some(id) {
                subscriptions.remove(&characteristic);
            }
            self.is_closed()
        };

        if !closed {
            log::debug!("Disabling notification for {} on {}", characteristic, self.device.id());
            self.transport.set_notify(self.device.id(), characteristic, false);
        }
    }

    /// Routes a notification. An update without payload ends the subscription.
    pub(crate) fn on_value(&self, characteristic: Uuid, value: Option<Vec<u8>>) {
        match value {
            Some(bytes) => {
                let subscriptions = self.subscriptions.lock().unwrap();
                match subscriptions.get(&characteristic) {
                    Some(subscription) => {
                        subscription.producer.send(bytes);
                    }
                    None => log::trace!("No subscriber for {}", characteristic),
                }
            }
            None => {
                let removed = self.subscriptions.lock().unwrap().remove(&characteristic);
                if let Some(subscription) = removed {
                    log::debug!("Empty update for {}, ending its stream", characteristic);
                    subscription.producer.finish();
                }
            }
        }
    }

    /// Ends every subscription without touching the radio again.
    pub(crate) fn close(&self, state: ConnectionState) {
        let drained = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            self.closed.store(true, Ordering::SeqCst);
            subscriptions.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };

        for subscription in drained {
            subscription.producer.finish();
        }

        self.state.send(state).ok();
    }
}

/// A connected device of type `P`.
///
/// Only obtainable from [`CentralManager::connect`](crate::CentralManager::connect),
/// so every characteristic required by `P` is known to be present.
pub struct Peripheral<P> {
    link: Arc<Link>,
    _profile: PhantomData<fn() -> P>,
}

impl<P> Clone for Peripheral<P> {
    fn clone(&self) -> Self {
        Self {
            link: self.link.clone(),
            _profile: PhantomData,
        }
    }
}

impl<P> fmt::Debug for Peripheral<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("device", self.link.device())
            .field("state", &*self.link.state_receiver.borrow())
            .finish()
    }
}

impl<P: Profile> Peripheral<P> {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            _profile: PhantomData,
        }
    }

    #[inline]
    pub fn handle(&self) -> &DeviceHandle {
        self.link.device()
    }

    #[inline]
    pub fn id(&self) -> &DeviceId {
        self.link.device().id()
    }

    /// Local name of the device
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.link.device().name()
    }

    pub fn state(&self) -> ConnectionState {
        *self.link.state_receiver.borrow()
    }

    /// Observable connection state, for watching from other tasks.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.link.state_receiver.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Characteristics verified during discovery
    pub fn characteristics(&self) -> &Discovered {
        self.link.discovered()
    }

    /// Live values of one characteristic.
    ///
    /// Notification is enabled when the stream is first polled and disabled
    /// when it ends. A later call for the same characteristic ends this one.
    pub fn readings<R: Reading<Profile = P>>(&self) -> Readings<R> {
        Readings::new(self.link.clone())
    }

    /// Like [`readings`](Self::readings), but fails up front if the
    /// characteristic is unavailable.
    pub fn subscribe<R: Reading<Profile = P>>(&self) -> Result<Readings<R>> {
        if self.link.is_closed() {
            return Err(Error::NotConnected);
        }

        if !self.link.discovered().contains(R::CHARACTERISTIC) {
            return Err(Error::MissingCharacteristic {
                service: required_service::<R>(),
                characteristic: R::CHARACTERISTIC,
            });
        }

        Ok(self.readings())
    }
}
