/*!
 # GATT service table

 The three logical services the light exposes, each with its service UUID
 and the characteristics the controller uses.
*/

use uuid::Uuid;

/// Device Information service
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
/// Firmware Revision String characteristic
pub const FIRMWARE_VERSION_UUID: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
/// Battery service
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
/// Battery Level characteristic
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
/// Vendor light-control service
pub const LIGHT_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);
/// Light color characteristic, takes color frames as no-response writes
pub const LIGHT_COLOR_UUID: Uuid = Uuid::from_u128(0xabcdef01_1234_5678_1234_56789abcdef0);

/// A service UUID and the characteristics read or written under it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service UUID
    pub service: Uuid,
    /// Characteristic UUIDs, the first one is the primary endpoint
    pub characteristics: &'static [Uuid],
}

impl ServiceDescriptor {
    /// The characteristic the controller talks to for this service
    pub fn primary(&self) -> Uuid {
        self.characteristics[0]
    }
}

/// Logical services used by the controller
#[derive(Debug, Clone, Copy)]
pub struct Services {
    /// Firmware version lives here
    pub device_info: ServiceDescriptor,
    /// Battery level lives here
    pub battery: ServiceDescriptor,
    /// Color writes go here
    pub light: ServiceDescriptor,
}

impl Services {
    pub fn all(&self) -> [ServiceDescriptor; 3] {
        [self.device_info, self.battery, self.light]
    }
}

/// Process-wide service table
pub const SERVICES: Services = Services {
    device_info: ServiceDescriptor {
        service: DEVICE_INFO_SERVICE_UUID,
        characteristics: &[FIRMWARE_VERSION_UUID],
    },
    battery: ServiceDescriptor {
        service: BATTERY_SERVICE_UUID,
        characteristics: &[BATTERY_LEVEL_UUID],
    },
    light: ServiceDescriptor {
        service: LIGHT_SERVICE_UUID,
        characteristics: &[LIGHT_COLOR_UUID],
    },
};
