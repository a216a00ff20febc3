use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use uuid::Uuid;

use crate::pending::{PendingOperation, Waiter};
use crate::service::ServiceRequirement;
use crate::transport::{Cause, DeviceId, Transport};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingServices,
    /// Services whose complete characteristic list has not arrived yet.
    AwaitingCharacteristics { outstanding: BTreeSet<Uuid> },
    Complete,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Complete | HandshakeState::Failed)
    }
}

/// Which required characteristics have been found so far.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryProgress {
    found: BTreeMap<(Uuid, Uuid), bool>,
}

impl DiscoveryProgress {
    pub fn new(required: &[ServiceRequirement]) -> Self {
        let found = required
            .iter()
            .flat_map(|r| r.characteristics.iter().map(move |c| ((r.service, *c), false)))
            .collect();
        Self { found }
    }

    /// Marks a characteristic as found. Returns false if it was not required.
    pub fn mark(&mut self, service: Uuid, characteristic: Uuid) -> bool {
        match self.found.get_mut(&(service, characteristic)) {
            Some(found) => {
                *found = true;
                true
            }
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.found.values().all(|found| *found)
    }

    /// First required characteristic of `service` not found yet.
    pub fn missing_in(&self, service: Uuid) -> Option<Uuid> {
        self.found
            .iter()
            .find(|((s, _), found)| *s == service && !**found)
            .map(|((_, c), _)| *c)
    }
}

/// Characteristics verified on a connected device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovered {
    services: BTreeMap<Uuid, Uuid>,
}

impl Discovered {
    pub fn contains(&self, characteristic: Uuid) -> bool {
        self.services.contains_key(&characteristic)
    }

    /// The service a characteristic was found in.
    pub fn service_of(&self, characteristic: Uuid) -> Option<Uuid> {
        self.services.get(&characteristic).copied()
    }

    pub fn characteristics(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.services.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl From<DiscoveryProgress> for Discovered {
    fn from(progress: DiscoveryProgress) -> Self {
        let services = progress
            .found
            .into_iter()
            .filter(|(_, found)| *found)
            .map(|((service, characteristic), _)| (characteristic, service))
            .collect();
        Self { services }
    }
}

/// Drives service and characteristic discovery on a freshly connected device
/// and checks the result against its profile.
///
/// Fed by transport events; the outcome is delivered through the [`Waiter`]
/// returned from [`start`](Self::start). There is no internal timeout: a
/// required service that never reports keeps the handshake waiting.
pub struct DiscoveryHandshake {
    device: DeviceId,
    required: &'static [ServiceRequirement],
    state: HandshakeState,
    progress: DiscoveryProgress,
    completion: PendingOperation<Discovered>,
}

impl DiscoveryHandshake {
    pub fn new(device: DeviceId, required: &'static [ServiceRequirement]) -> Self {
        Self {
            device,
            required,
            state: HandshakeState::Idle,
            progress: DiscoveryProgress::new(required),
            completion: PendingOperation::new(),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn start(&mut self, transport: &dyn Transport) -> Result<Waiter<Discovered>> {
        if self.state != HandshakeState::Idle {
            return Err(Error::AlreadyPending);
        }

        let waiter = self.completion.register()?;

        if self.required.is_empty() {
            self.complete();
            return Ok(waiter);
        }

        let services = self.required.iter().map(|r| r.service).collect::<Vec<_>>();
        log::debug!("Discovering services {:?} on {}", services, self.device);

        self.state = HandshakeState::AwaitingServices;
        transport.discover_services(&self.device, &services);

        Ok(waiter)
    }

    pub fn on_services_discovered(
        &mut self,
        transport: &dyn Transport,
        result: std::result::Result<Vec<Uuid>, Cause>,
    ) {
        if self.state != HandshakeState::AwaitingServices {
            log::debug!("Ignoring services of {} in state {:?}", self.device, self.state);
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(cause) => return self.fail(Error::TransportFailure(cause)),
        };

        if services.is_empty() {
            return self.fail(Error::NoServicesFound);
        }

        if let Some(unexpected) = services.iter().find(|s| self.requirement(**s).is_none()) {
            return self.fail(Error::UnexpectedService(*unexpected));
        }

        self.state = HandshakeState::AwaitingCharacteristics {
            outstanding: self.required.iter().map(|r| r.service).collect(),
        };

        for requirement in self.required {
            log::debug!(
                "Discovering characteristics {:?} of {} on {}",
                requirement.characteristics,
                requirement.service,
                self.device
            );
            transport.discover_characteristics(
                &self.device,
                requirement.service,
                requirement.characteristics,
            );
        }
    }

    /// A single characteristic report. Only records progress; absence is
    /// judged when the complete list for the service arrives.
    pub fn on_characteristic_discovered(&mut self, service: Uuid, characteristic: Uuid) {
        if !self.awaiting_characteristics() {
            return;
        }

        if self.requirement(service).is_none() {
            return self.fail(Error::UnexpectedService(service));
        }

        self.progress.mark(service, characteristic);
        self.check_complete();
    }

    pub fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        result: std::result::Result<Vec<Uuid>, Cause>,
    ) {
        if !self.awaiting_characteristics() {
            log::debug!(
                "Ignoring characteristics of {} on {} in state {:?}",
                service,
                self.device,
                self.state
            );
            return;
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(cause) => return self.fail(Error::TransportFailure(cause)),
        };

        if self.requirement(service).is_none() {
            return self.fail(Error::UnexpectedService(service));
        }

        for characteristic in characteristics {
            self.progress.mark(service, characteristic);
        }

        if let Some(characteristic) = self.progress.missing_in(service) {
            return self.fail(Error::MissingCharacteristic {
                service,
                characteristic,
            });
        }

        if let HandshakeState::AwaitingCharacteristics { outstanding } = &mut self.state {
            outstanding.remove(&service);
        }

        self.check_complete();
    }

    fn requirement(&self, service: Uuid) -> Option<&ServiceRequirement> {
        self.required.iter().find(|r| r.service == service)
    }

    fn awaiting_characteristics(&self) -> bool {
        matches!(self.state, HandshakeState::AwaitingCharacteristics { .. })
    }

    fn check_complete(&mut self) {
        if self.progress.is_complete() {
            self.complete();
        }
    }

    fn complete(&mut self) {
        log::debug!("Discovery complete on {}", self.device);

        self.state = HandshakeState::Complete;
        let progress = mem::take(&mut self.progress);
        self.completion.resolve(progress.into()).ok();
    }

    fn fail(&mut self, error: Error) {
        log::warn!("Discovery failed on {}: {}", self.device, error);

        self.state = HandshakeState::Failed;
        self.progress = DiscoveryProgress::default();
        self.completion.reject(error).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{cause, FakeTransport, Request};
    use futures::FutureExt;

    const A: Uuid = Uuid::from_u128(0xA);
    const B: Uuid = Uuid::from_u128(0xB);
    const C1: Uuid = Uuid::from_u128(0xC1);
    const C2: Uuid = Uuid::from_u128(0xC2);
    const C3: Uuid = Uuid::from_u128(0xC3);

    const ONE_SERVICE: &[ServiceRequirement] = &[ServiceRequirement::new(A, &[C1, C2])];
    const TWO_SERVICES: &[ServiceRequirement] = &[
        ServiceRequirement::new(A, &[C1]),
        ServiceRequirement::new(B, &[C2, C3]),
    ];

    fn started(
        required: &'static [ServiceRequirement],
    ) -> (DiscoveryHandshake, Waiter<Discovered>, std::sync::Arc<FakeTransport>) {
        let (transport, _events) = FakeTransport::new();
        let mut handshake = DiscoveryHandshake::new(DeviceId::from("dev"), required);
        let waiter = handshake.start(transport.as_ref()).unwrap();
        (handshake, waiter, transport)
    }

    #[test]
    fn start_requests_required_services() {
        let (handshake, _waiter, transport) = started(TWO_SERVICES);

        assert_eq!(handshake.state(), &HandshakeState::AwaitingServices);
        assert_eq!(
            transport.requests(),
            vec![Request::DiscoverServices(DeviceId::from("dev"), vec![A, B])]
        );
    }

    #[test]
    fn services_result_requests_characteristics_of_every_required_service() {
        let (mut handshake, _waiter, transport) = started(TWO_SERVICES);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![A]));

        let dev = DeviceId::from("dev");
        assert!(transport
            .requests()
            .contains(&Request::DiscoverCharacteristics(dev.clone(), A, vec![C1])));
        assert!(transport
            .requests()
            .contains(&Request::DiscoverCharacteristics(dev, B, vec![C2, C3])));
    }

    #[tokio::test]
    async fn completes_only_after_every_characteristic_is_found() {
        let (mut handshake, mut waiter, transport) = started(ONE_SERVICE);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![A]));
        handshake.on_characteristic_discovered(A, C1);

        assert!((&mut waiter).now_or_never().is_none());
        assert!(!handshake.state().is_terminal());

        handshake.on_characteristic_discovered(A, C2);

        assert_eq!(handshake.state(), &HandshakeState::Complete);
        let discovered = waiter.await.unwrap();
        assert!(discovered.contains(C1));
        assert_eq!(discovered.service_of(C2), Some(A));
    }

    #[tokio::test]
    async fn incomplete_service_result_fails() {
        let (mut handshake, waiter, transport) = started(ONE_SERVICE);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![A]));
        handshake.on_characteristics_discovered(A, Ok(vec![C1]));

        assert_eq!(handshake.state(), &HandshakeState::Failed);
        assert!(matches!(
            waiter.await,
            Err(Error::MissingCharacteristic { service: A, characteristic: C2 })
        ));
    }

    #[tokio::test]
    async fn unrelated_service_fails() {
        let (mut handshake, waiter, transport) = started(ONE_SERVICE);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![B, A]));

        assert!(matches!(waiter.await, Err(Error::UnexpectedService(B))));
        assert!(!transport
            .requests()
            .iter()
            .any(|r| matches!(r, Request::DiscoverCharacteristics(..))));
    }

    #[tokio::test]
    async fn characteristics_of_unrelated_service_fail() {
        let (mut handshake, waiter, transport) = started(ONE_SERVICE);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![A]));
        handshake.on_characteristics_discovered(B, Ok(vec![C1]));

        assert!(matches!(waiter.await, Err(Error::UnexpectedService(B))));
    }

    #[tokio::test]
    async fn completes_without_waiting_for_verified_services() {
        let (mut handshake, waiter, transport) = started(TWO_SERVICES);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![A, B]));
        handshake.on_characteristic_discovered(B, C2);
        handshake.on_characteristic_discovered(B, C3);
        handshake.on_characteristics_discovered(A, Ok(vec![C1]));

        assert_eq!(handshake.state(), &HandshakeState::Complete);
        assert_eq!(waiter.await.unwrap().len(), 3);

        // The late result for B is ignored.
        handshake.on_characteristics_discovered(B, Ok(vec![]));
        assert_eq!(handshake.state(), &HandshakeState::Complete);
    }

    #[tokio::test]
    async fn waits_for_outstanding_service() {
        let (mut handshake, mut waiter, transport) = started(TWO_SERVICES);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![A, B]));
        handshake.on_characteristics_discovered(A, Ok(vec![C1]));

        assert_eq!(
            handshake.state(),
            &HandshakeState::AwaitingCharacteristics {
                outstanding: [B].into_iter().collect()
            }
        );
        assert!((&mut waiter).now_or_never().is_none());
    }

    #[tokio::test]
    async fn transport_errors_fail_immediately() {
        let (mut handshake, waiter, transport) = started(ONE_SERVICE);

        handshake.on_services_discovered(transport.as_ref(), Err(cause("gatt error")));

        match waiter.await {
            Err(Error::TransportFailure(cause)) => assert_eq!(cause.to_string(), "gatt error"),
            other => panic!("unexpected outcome: {:?}", other.map(|d| d.len())),
        }
    }

    #[tokio::test]
    async fn empty_services_result_fails() {
        let (mut handshake, waiter, transport) = started(ONE_SERVICE);

        handshake.on_services_discovered(transport.as_ref(), Ok(vec![]));

        assert!(matches!(waiter.await, Err(Error::NoServicesFound)));
    }

    #[test]
    fn cannot_start_twice() {
        let (mut handshake, _waiter, transport) = started(ONE_SERVICE);

        assert!(matches!(
            handshake.start(transport.as_ref()),
            Err(Error::AlreadyPending)
        ));
    }
}
