//! Parsing of raw advertising and scan response payloads.
//!
//! The payload is a sequence of AD structures, each a length octet followed by an AD type and its data. See the
//! Bluetooth Core Specification Supplement, Part A for the data types.

use tracing::debug;

use crate::btuuid::BluetoothUuidExt;
use crate::{AdvertisementData, ManufacturerData, Uuid};

mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_SERVICES_16: u8 = 0x02;
    pub const COMPLETE_SERVICES_16: u8 = 0x03;
    pub const INCOMPLETE_SERVICES_32: u8 = 0x04;
    pub const COMPLETE_SERVICES_32: u8 = 0x05;
    pub const INCOMPLETE_SERVICES_128: u8 = 0x06;
    pub const COMPLETE_SERVICES_128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0a;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const SERVICE_DATA_32: u8 = 0x20;
    pub const SERVICE_DATA_128: u8 = 0x21;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xff;
}

impl AdvertisementData {
    /// Parses an advertising or scan response payload.
    ///
    /// Parsing stops at the first zero-length or truncated structure; everything before it is kept. Unknown AD
    /// types are skipped. [`is_connectable`][AdvertisementData::is_connectable] is not part of the payload and
    /// is left `false`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = AdvertisementData::default();
        data.extend_from_bytes(bytes);
        data
    }

    /// Merges the structures in `bytes` into `self`, as when a scan response follows an advertisement.
    pub fn extend_from_bytes(&mut self, mut bytes: &[u8]) {
        while let Some((&len, rest)) = bytes.split_first() {
            let len = usize::from(len);
            if len == 0 {
                break;
            }
            if rest.len() < len {
                debug!("truncated AD structure ({} of {} bytes)", rest.len(), len);
                break;
            }
            let (structure, tail) = rest.split_at(len);
            bytes = tail;
            self.apply(structure[0], &structure[1..]);
        }
    }

    fn apply(&mut self, ty: u8, value: &[u8]) {
        match ty {
            ad_type::FLAGS => {}
            ad_type::INCOMPLETE_SERVICES_16 | ad_type::COMPLETE_SERVICES_16 => self.add_services(value, 2),
            ad_type::INCOMPLETE_SERVICES_32 | ad_type::COMPLETE_SERVICES_32 => self.add_services(value, 4),
            ad_type::INCOMPLETE_SERVICES_128 | ad_type::COMPLETE_SERVICES_128 => self.add_services(value, 16),
            ad_type::SHORTENED_LOCAL_NAME => {
                if self.local_name.is_none() {
                    self.local_name = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
            ad_type::COMPLETE_LOCAL_NAME => self.local_name = Some(String::from_utf8_lossy(value).into_owned()),
            ad_type::TX_POWER_LEVEL => {
                if let [level] = value {
                    self.tx_power_level = Some(i16::from(*level as i8));
                }
            }
            ad_type::SERVICE_DATA_16 => self.add_service_data(value, 2),
            ad_type::SERVICE_DATA_32 => self.add_service_data(value, 4),
            ad_type::SERVICE_DATA_128 => self.add_service_data(value, 16),
            ad_type::MANUFACTURER_SPECIFIC_DATA => {
                if value.len() >= 2 {
                    self.manufacturer_data = Some(ManufacturerData {
                        company_id: u16::from_le_bytes([value[0], value[1]]),
                        data: value[2..].to_vec(),
                    });
                }
            }
            _ => {}
        }
    }

    fn add_services(&mut self, value: &[u8], width: usize) {
        for chunk in value.chunks_exact(width) {
            if let Some(uuid) = Uuid::from_le_bytes_slice(chunk) {
                if !self.services.contains(&uuid) {
                    self.services.push(uuid);
                }
            }
        }
    }

    fn add_service_data(&mut self, value: &[u8], width: usize) {
        if value.len() < width {
            return;
        }
        let (uuid, data) = value.split_at(width);
        if let Some(uuid) = Uuid::from_le_bytes_slice(uuid) {
            self.service_data.insert(uuid, data.to_vec());
        }
    }

    /// Whether this advertisement lists any of `services`, either in a service list or as service data. An empty
    /// filter matches everything.
    pub fn matches_services(&self, services: &[Uuid]) -> bool {
        services.is_empty()
            || services
                .iter()
                .any(|uuid| self.services.contains(uuid) || self.service_data.contains_key(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::services;

    #[test]
    fn parses_common_structures() {
        let bytes = [
            0x02, 0x01, 0x06, // flags
            0x03, 0x03, 0x0f, 0x18, // battery service
            0x07, 0x09, b'T', b'h', b'i', b'n', b'g', b'y', // complete local name
            0x02, 0x0a, 0xf8, // -8 dBm
            0x05, 0xff, 0x59, 0x00, 0xaa, 0xbb, // Nordic manufacturer data
            0x04, 0x16, 0x0f, 0x18, 0x64, // battery level service data
        ];
        let data = AdvertisementData::from_bytes(&bytes);
        assert_eq!(data.local_name.as_deref(), Some("Thingy"));
        assert_eq!(data.services, [services::BATTERY]);
        assert_eq!(data.tx_power_level, Some(-8));
        assert_eq!(
            data.manufacturer_data,
            Some(ManufacturerData {
                company_id: 0x0059,
                data: vec![0xaa, 0xbb]
            })
        );
        assert_eq!(data.service_data.get(&services::BATTERY), Some(&vec![0x64]));
        assert!(!data.is_connectable);
    }

    #[test]
    fn service_data_matches_filter() {
        // Heart rate service data without a service list.
        let data = AdvertisementData::from_bytes(&[0x04, 0x16, 0x0d, 0x18, 0x48]);
        assert!(data.services.is_empty());
        assert!(data.matches_services(&[services::HEART_RATE]));
        assert!(!data.matches_services(&[services::BATTERY]));
    }

    #[test]
    fn long_service_uuid() {
        let uis: Uuid = "ef680300-9b35-4933-9b10-52ffa9740042".parse().unwrap();
        let mut bytes = vec![0x11, 0x07];
        bytes.extend(uis.to_att_bytes());
        let data = AdvertisementData::from_bytes(&bytes);
        assert_eq!(data.services, [uis]);
        assert!(data.matches_services(&[uis]));
        assert!(!data.matches_services(&[services::BATTERY]));
        assert!(data.matches_services(&[]));
    }

    #[test]
    fn stops_at_truncated_structure() {
        let bytes = [0x05, 0x08, b'a', b'b', b'c', b'd', 0x09, 0x09, b'x'];
        let data = AdvertisementData::from_bytes(&bytes);
        assert_eq!(data.local_name.as_deref(), Some("abcd"));
    }

    #[test]
    fn complete_name_wins() {
        let mut data = AdvertisementData::from_bytes(&[0x03, 0x09, b'A', b'B']);
        data.extend_from_bytes(&[0x02, 0x08, b'A']);
        assert_eq!(data.local_name.as_deref(), Some("AB"));
    }
}
