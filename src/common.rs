//! Well-known identifiers and the standard Battery Service profile.

pub use btleplug::api::bleuuid::uuid_from_u16;

use crate::characteristic::Reading;
use crate::service::{Profile, ServiceRequirement};

pub mod services {
    use super::uuid_from_u16;
    use uuid::Uuid;

    pub const DEVICE_INFORMATION: Uuid = uuid_from_u16(0x180A);
    pub const BATTERY: Uuid = uuid_from_u16(0x180F);
    pub const HEART_RATE: Uuid = uuid_from_u16(0x180D);
}

pub mod characteristics {
    use super::uuid_from_u16;
    use uuid::Uuid;

    pub const SERIAL_NUMBER: Uuid = uuid_from_u16(0x2A25);
    pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);
    pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);
}

/// Any device exposing the Battery Service.
#[derive(Debug)]
pub enum BatteryMonitor {}

impl Profile for BatteryMonitor {
    const REQUIRED: &'static [ServiceRequirement] = &[ServiceRequirement::new(
        services::BATTERY,
        &[characteristics::BATTERY_LEVEL],
    )];
}

/// Remaining charge in percent.
#[derive(Debug)]
pub enum BatteryLevel {}

impl Reading for BatteryLevel {
    type Profile = BatteryMonitor;
    type Value = u8;

    const CHARACTERISTIC: uuid::Uuid = characteristics::BATTERY_LEVEL;

    fn decode(bytes: &[u8]) -> Option<u8> {
        bytes.first().copied()
    }
}
