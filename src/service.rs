use uuid::Uuid;

/// A service a device must expose, and the characteristics it must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRequirement {
    pub service: Uuid,
    pub characteristics: &'static [Uuid],
}

impl ServiceRequirement {
    pub const fn new(service: Uuid, characteristics: &'static [Uuid]) -> Self {
        Self {
            service,
            characteristics,
        }
    }
}

/// Static description of one device type.
///
/// The requirements decide whether a connected device is accepted: the
/// discovery handshake succeeds only if every listed characteristic is found
/// and fails on any service not listed.
pub trait Profile: Send + Sync + 'static {
    const REQUIRED: &'static [ServiceRequirement];

    /// Devices whose name does not contain this (ignoring case) are skipped
    /// while scanning.
    const NAME_FILTER: Option<&'static str> = None;

    /// Services used to filter scan results.
    fn advertised_services() -> Vec<Uuid> {
        Self::REQUIRED.iter().map(|r| r.service).collect()
    }
}
