//! `Uuid` extensions for Bluetooth UUIDs
//!
//! Every UUID handled by this crate is a full 128-bit [`Uuid`]. 16-bit and 32-bit UUIDs assigned by the Bluetooth
//! SIG are expanded with the [Bluetooth Base UUID][BLUETOOTH_BASE_UUID], so a short UUID and its full form compare
//! equal.

use uuid::Uuid;

/// This is the Bluetooth Base UUID. It is used with 16-bit and 32-bit UUIDs
/// [defined](https://www.bluetooth.com/specifications/assigned-numbers/) by the Bluetooth SIG.
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Const function to create a 16-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u16(uuid: u16) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Const function to create a 32-bit Bluetooth UUID
pub const fn bluetooth_uuid_from_u32(uuid: u32) -> Uuid {
    Uuid::from_u128(((uuid as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Extension trait for [uuid::Uuid] with helper methods for dealing with Bluetooth 16-bit and 32-bit UUIDs
pub trait BluetoothUuidExt: private::Sealed + Sized {
    /// Creates a 16-bit Bluetooth UUID
    fn from_u16(uuid: u16) -> Self;

    /// Creates a 32-bit Bluetooth UUID
    fn from_u32(uuid: u32) -> Self;

    /// Creates a UUID from big-endian `bytes`, returning `None` unless `bytes.len()` is 2, 4, or 16
    fn from_bluetooth_bytes(bytes: &[u8]) -> Option<Self>;

    /// Creates a UUID from little-endian `bytes` as carried in ATT PDUs and advertising data, returning `None`
    /// unless `bytes.len()` is 2, 4, or 16
    fn from_le_bytes_slice(bytes: &[u8]) -> Option<Self>;

    /// Returns `true` if self is a valid 16-bit Bluetooth UUID
    fn is_u16_uuid(&self) -> bool;

    /// Returns `true` if self is a valid 32-bit Bluetooth UUID
    fn is_u32_uuid(&self) -> bool;

    /// Tries to convert self into a 16-bit Bluetooth UUID
    fn try_to_u16(&self) -> Option<u16>;

    /// Tries to convert self into a 32-bit Bluetooth UUID
    fn try_to_u32(&self) -> Option<u32>;

    /// The shortest little-endian encoding usable in ATT PDUs: 2 octets for 16-bit UUIDs, 16 octets otherwise.
    fn to_att_bytes(&self) -> Vec<u8>;
}

impl BluetoothUuidExt for Uuid {
    fn from_u16(uuid: u16) -> Self {
        bluetooth_uuid_from_u16(uuid)
    }

    fn from_u32(uuid: u32) -> Self {
        bluetooth_uuid_from_u32(uuid)
    }

    fn from_bluetooth_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Self::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))),
            4 => Some(Self::from_u32(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))),
            16 => Self::from_slice(bytes).ok(),
            _ => None,
        }
    }

    fn from_le_bytes_slice(bytes: &[u8]) -> Option<Self> {
        let mut reversed = bytes.to_vec();
        reversed.reverse();
        Self::from_bluetooth_bytes(&reversed)
    }

    fn is_u16_uuid(&self) -> bool {
        let u = self.as_u128();
        (u & ((1 << 96) - 1)) == BLUETOOTH_BASE_UUID && (((u >> 96) as u32) & 0xffff0000) == 0
    }

    fn is_u32_uuid(&self) -> bool {
        let u = self.as_u128();
        (u & ((1 << 96) - 1)) == BLUETOOTH_BASE_UUID
    }

    fn try_to_u16(&self) -> Option<u16> {
        let u = self.as_u128();
        self.is_u16_uuid().then(|| (u >> 96) as u16)
    }

    fn try_to_u32(&self) -> Option<u32> {
        let u = self.as_u128();
        self.is_u32_uuid().then(|| (u >> 96) as u32)
    }

    fn to_att_bytes(&self) -> Vec<u8> {
        match self.try_to_u16() {
            Some(short) => short.to_le_bytes().to_vec(),
            None => self.as_u128().to_le_bytes().to_vec(),
        }
    }
}

mod private {
    use uuid::Uuid;

    pub trait Sealed {}

    impl Sealed for Uuid {}
}

/// GATT attribute types used by the discovery procedures
pub mod attributes {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const PRIMARY_SERVICE: Uuid = bluetooth_uuid_from_u16(0x2800);
    pub const SECONDARY_SERVICE: Uuid = bluetooth_uuid_from_u16(0x2801);
    pub const INCLUDE: Uuid = bluetooth_uuid_from_u16(0x2802);
    pub const CHARACTERISTIC: Uuid = bluetooth_uuid_from_u16(0x2803);
}

/// Bluetooth GATT Service 16-bit UUIDs
pub mod services {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const GENERIC_ACCESS: Uuid = bluetooth_uuid_from_u16(0x1800);
    pub const GENERIC_ATTRIBUTE: Uuid = bluetooth_uuid_from_u16(0x1801);
    pub const IMMEDIATE_ALERT: Uuid = bluetooth_uuid_from_u16(0x1802);
    pub const LINK_LOSS: Uuid = bluetooth_uuid_from_u16(0x1803);
    pub const TX_POWER: Uuid = bluetooth_uuid_from_u16(0x1804);
    pub const CURRENT_TIME: Uuid = bluetooth_uuid_from_u16(0x1805);
    pub const HEALTH_THERMOMETER: Uuid = bluetooth_uuid_from_u16(0x1809);
    pub const DEVICE_INFORMATION: Uuid = bluetooth_uuid_from_u16(0x180A);
    pub const HEART_RATE: Uuid = bluetooth_uuid_from_u16(0x180D);
    pub const BATTERY: Uuid = bluetooth_uuid_from_u16(0x180F);
    pub const HUMAN_INTERFACE_DEVICE: Uuid = bluetooth_uuid_from_u16(0x1812);
    pub const ENVIRONMENTAL_SENSING: Uuid = bluetooth_uuid_from_u16(0x181A);
}

/// Bluetooth GATT Characteristic 16-bit UUIDs
pub mod characteristics {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const DEVICE_NAME: Uuid = bluetooth_uuid_from_u16(0x2A00);
    pub const APPEARANCE: Uuid = bluetooth_uuid_from_u16(0x2A01);
    pub const PERIPHERAL_PREFERRED_CONNECTION_PARAMETERS: Uuid = bluetooth_uuid_from_u16(0x2A04);
    pub const SERVICE_CHANGED: Uuid = bluetooth_uuid_from_u16(0x2A05);
    pub const ALERT_LEVEL: Uuid = bluetooth_uuid_from_u16(0x2A06);
    pub const TX_POWER_LEVEL: Uuid = bluetooth_uuid_from_u16(0x2A07);
    pub const BATTERY_LEVEL: Uuid = bluetooth_uuid_from_u16(0x2A19);
    pub const SYSTEM_ID: Uuid = bluetooth_uuid_from_u16(0x2A23);
    pub const MODEL_NUMBER_STRING: Uuid = bluetooth_uuid_from_u16(0x2A24);
    pub const SERIAL_NUMBER_STRING: Uuid = bluetooth_uuid_from_u16(0x2A25);
    pub const FIRMWARE_REVISION_STRING: Uuid = bluetooth_uuid_from_u16(0x2A26);
    pub const HARDWARE_REVISION_STRING: Uuid = bluetooth_uuid_from_u16(0x2A27);
    pub const SOFTWARE_REVISION_STRING: Uuid = bluetooth_uuid_from_u16(0x2A28);
    pub const MANUFACTURER_NAME_STRING: Uuid = bluetooth_uuid_from_u16(0x2A29);
    pub const HEART_RATE_MEASUREMENT: Uuid = bluetooth_uuid_from_u16(0x2A37);
    pub const TEMPERATURE: Uuid = bluetooth_uuid_from_u16(0x2A6E);
    pub const HUMIDITY: Uuid = bluetooth_uuid_from_u16(0x2A6F);
    pub const CENTRAL_ADDRESS_RESOLUTION: Uuid = bluetooth_uuid_from_u16(0x2AA6);
}

/// Bluetooth GATT Descriptor 16-bit UUIDs
pub mod descriptors {
    #![allow(missing_docs)]

    use uuid::Uuid;

    use super::bluetooth_uuid_from_u16;

    pub const CHARACTERISTIC_EXTENDED_PROPERTIES: Uuid = bluetooth_uuid_from_u16(0x2900);
    pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = bluetooth_uuid_from_u16(0x2901);
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = bluetooth_uuid_from_u16(0x2902);
    pub const SERVER_CHARACTERISTIC_CONFIGURATION: Uuid = bluetooth_uuid_from_u16(0x2903);
    pub const CHARACTERISTIC_PRESENTATION_FORMAT: Uuid = bluetooth_uuid_from_u16(0x2904);
    pub const CHARACTERISTIC_AGGREGATE_FORMAT: Uuid = bluetooth_uuid_from_u16(0x2905);
    pub const VALID_RANGE: Uuid = bluetooth_uuid_from_u16(0x2906);
    pub const REPORT_REFERENCE: Uuid = bluetooth_uuid_from_u16(0x2908);
}

static NAMES: &[(u16, &str)] = &[
    (0x1800, "Generic Access"),
    (0x1801, "Generic Attribute"),
    (0x1802, "Immediate Alert"),
    (0x1803, "Link Loss"),
    (0x1804, "Tx Power"),
    (0x1805, "Current Time Service"),
    (0x1809, "Health Thermometer"),
    (0x180a, "Device Information"),
    (0x180d, "Heart Rate"),
    (0x180f, "Battery Service"),
    (0x1812, "Human Interface Device"),
    (0x181a, "Environmental Sensing"),
    (0x2800, "Primary Service"),
    (0x2801, "Secondary Service"),
    (0x2802, "Include"),
    (0x2803, "Characteristic"),
    (0x2900, "Characteristic Extended Properties"),
    (0x2901, "Characteristic User Description"),
    (0x2902, "Client Characteristic Configuration"),
    (0x2903, "Server Characteristic Configuration"),
    (0x2904, "Characteristic Presentation Format"),
    (0x2905, "Characteristic Aggregate Format"),
    (0x2906, "Valid Range"),
    (0x2908, "Report Reference"),
    (0x2a00, "Device Name"),
    (0x2a01, "Appearance"),
    (0x2a04, "Peripheral Preferred Connection Parameters"),
    (0x2a05, "Service Changed"),
    (0x2a06, "Alert Level"),
    (0x2a07, "Tx Power Level"),
    (0x2a19, "Battery Level"),
    (0x2a23, "System ID"),
    (0x2a24, "Model Number String"),
    (0x2a25, "Serial Number String"),
    (0x2a26, "Firmware Revision String"),
    (0x2a27, "Hardware Revision String"),
    (0x2a28, "Software Revision String"),
    (0x2a29, "Manufacturer Name String"),
    (0x2a37, "Heart Rate Measurement"),
    (0x2a6e, "Temperature"),
    (0x2a6f, "Humidity"),
    (0x2aa6, "Central Address Resolution"),
];

/// Looks up the human-readable name of a SIG-assigned service, characteristic, or descriptor UUID.
pub fn name(uuid: &Uuid) -> Option<&'static str> {
    let short = uuid.try_to_u16()?;
    NAMES
        .binary_search_by_key(&short, |&(n, _)| n)
        .ok()
        .map(|idx| NAMES[idx].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_full_forms_are_equal() {
        let full: Uuid = "0000180f-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(Uuid::from_u16(0x180f), full);
        assert_eq!(Uuid::from_u32(0x0000180f), full);
        assert_eq!(Uuid::from_le_bytes_slice(&[0x0f, 0x18]), Some(full));
        assert_eq!(full.try_to_u16(), Some(0x180f));
    }

    #[test]
    fn vendor_uuids_stay_long() {
        let led: Uuid = "ef680301-9b35-4933-9b10-52ffa9740042".parse().unwrap();
        assert!(!led.is_u16_uuid());
        let bytes = led.to_att_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[15], 0xef);
        assert_eq!(Uuid::from_le_bytes_slice(&bytes), Some(led));
        assert_eq!(Uuid::from_le_bytes_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn names() {
        assert_eq!(name(&services::BATTERY), Some("Battery Service"));
        assert_eq!(
            name(&descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION),
            Some("Client Characteristic Configuration")
        );
        assert_eq!(name(&Uuid::from_u16(0xfff0)), None);
        assert!(NAMES.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
