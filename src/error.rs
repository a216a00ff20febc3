use uuid::Uuid;

use crate::transport::{Cause, DeviceId};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The radio is powered off, unsupported or otherwise unusable
    #[error("The radio is not ready")]
    NotReady,

    /// No device with this id was seen during the current scan session
    #[error("The peripheral was not found: {0}")]
    PeripheralNotFound(DeviceId),

    /// The device reported a service that its profile does not declare
    #[error("Unexpected service found: {0}")]
    UnexpectedService(Uuid),

    /// A characteristic declared by the profile was not found on the device
    #[error("Characteristic {characteristic} missing from service {service}")]
    MissingCharacteristic { service: Uuid, characteristic: Uuid },

    /// Service discovery completed without any services
    #[error("No services found")]
    NoServicesFound,

    /// The radio stack reported a failure
    #[error("Transport failure: {0}")]
    TransportFailure(Cause),

    /// The radio stack reported a failure without giving a cause
    #[error("Unknown error")]
    UnknownError,

    /// Another operation of the same kind is still waiting for its result
    #[error("An operation is already pending")]
    AlreadyPending,

    /// A pending operation was resolved more than once
    #[error("Operation resolved more than once")]
    DoubleResolution,

    /// The peripheral link has been closed
    #[error("The peripheral is not connected")]
    NotConnected,

    /// The operation did not complete within the configured time
    #[error("Operation timed out")]
    Timeout,

    /// The bridge went away before the operation completed
    #[error("The bridge was closed before the operation completed")]
    Closed,

    /// An error occurred in the underlying BLE library
    #[error("An error occurred in the underlying BLE library: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl Error {
    /// Wraps an optional transport cause, falling back to [`Error::UnknownError`].
    pub fn from_cause(cause: Option<Cause>) -> Self {
        cause.map(Error::TransportFailure).unwrap_or(Error::UnknownError)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
