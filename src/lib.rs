#![warn(missing_docs)]

//! Bluegatt is an event-driven [Bluetooth Low Energy] (BLE) GATT client engine for [Rust].
//!
//! The crate implements the GAP Central and GATT Client roles on top of a small [`Transport`][transport::Transport]
//! trait: scanning, connecting, walking the attribute table of a peripheral, and reading, writing and subscribing
//! to its characteristics. The ATT protocol itself runs inside the crate, so a transport only needs to move raw
//! PDUs to and from the controller. Peripheral and Server roles are not supported.
//!
//! [Rust]: https://www.rust-lang.org/
//! [Bluetooth Low Energy]: https://www.bluetooth.com/specifications/specs/
//!
//! # Usage
//!
//! ```rust,no_run
//!# use bluegatt::{Adapter, AdapterConfig, Event};
//!# use bluegatt::sim::SimulatedTransport;
//!# use futures_lite::StreamExt;
//!# #[tokio::main]
//!# async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!let adapter = Adapter::new(SimulatedTransport::new(), AdapterConfig::default())?;
//!let mut events = adapter.events();
//!adapter.open().await?;
//!adapter.wait_available().await?;
//!
//!adapter.start_scan(&[], false).await?;
//!while let Some(event) = events.next().await {
//!    if let Event::PeripheralDiscovered(discovered) = event {
//!        println!(
//!            "{}{}: {:?}",
//!            discovered.device,
//!            discovered.rssi.map(|x| format!(" ({}dBm)", x)).unwrap_or_default(),
//!            discovered.adv_data.services
//!        );
//!    }
//!}
//!#
//!#    Ok(())
//!# }
//! ```
//!
//! # Overview
//!
//! The primary functions provided by Bluegatt are:
//!
//! - Device discovery:
//!   - [Scanning][Adapter::start_scan] for devices and receiving advertisements
//!   - Finding [connected devices][Adapter::connected_devices]
//!   - [Opening][Adapter::open_device] devices by address
//!   - [Connecting][Adapter::connect_device] to devices
//! - Accessing remote GATT services:
//!   - Discovering device [services][Device::discover_services]
//!   - Discovering service [characteristics][Service::discover_characteristics]
//!   - Discovering characteristic [descriptors][Characteristic::discover_descriptors]
//!   - [Read][Characteristic::read], [write][Characteristic::write] (including
//!     [write without response][Characteristic::write_without_response]), and
//!     [notify/indicate][Characteristic::notify] operations on remote characteristics
//!   - [Read][Descriptor::read] and [write][Descriptor::write] operations on characteristic descriptors
//!
//! # Events
//!
//! Everything that happens on the radio is reported as an [`Event`]. Events are delivered in order on a dedicated
//! dispatch thread, first to the handlers registered with methods such as
//! [`on_peripheral_discovered`][Adapter::on_peripheral_discovered] and then to every stream returned by
//! [`events`][Adapter::events]. Handlers must not block; a handler that panics is logged and skipped.
//!
//! # Asynchronous runtimes
//!
//! Bluegatt does not depend on an asynchronous runtime. Timeouts use `futures-timer` and all waiting is done on
//! runtime-agnostic channels, so the returned futures can be driven by any executor.
//!
//! # Connections and requests
//!
//! ATT allows one outstanding request per link. Requests on the same link are queued in arrival order; if
//! [`max_queued_requests`][AdapterConfig::max_queued_requests] callers are already waiting, further requests fail
//! with [`Busy`][error::ErrorKind::Busy]. Every request is bounded by
//! [`request_timeout`][AdapterConfig::request_timeout].
//!
//! Services, characteristics and descriptors belong to the connection they were discovered on. They are
//! discovered once and cached until the device disconnects or [`invalidate_cache`][Device::invalidate_cache] is
//! called.
//!
//! # Feature flags
//!
//! The `serde` feature is available to enable serializing/deserializing device identifiers, power states and
//! [`AdapterConfig`].
//!
//! # Examples
//!
//! The `thingy` demo in the `demos` folder connects to a simulated Nordic Thingy, dumps its attribute table and
//! drives its LED characteristic.

mod adapter;
mod advertisement;
pub mod att;
mod async_util;
pub mod btuuid;
mod characteristic;
pub mod config;
mod connection;
mod descriptor;
mod device;
mod dispatch;
pub mod error;
mod service;
pub mod sim;
pub mod transport;
mod util;

use std::collections::HashMap;

pub use adapter::Adapter;
pub use btuuid::BluetoothUuidExt;
pub use characteristic::Characteristic;
pub use config::AdapterConfig;
pub use descriptor::Descriptor;
pub use device::{ConnectionState, Device, DeviceId};
pub use dispatch::{Event, HandlerId};
pub use error::Error;
pub use service::Service;
pub use transport::{ConnectionHandle, PowerState};
pub use uuid::Uuid;

/// Convenience alias for a result with [`Error`]
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Represents a device discovered during a scan operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingDevice {
    /// The source of the advertisement
    pub device: crate::Device,
    /// The advertisment data
    pub adv_data: AdvertisementData,
    /// The signal strength in dBm of the received advertisement packet
    pub rssi: Option<i16>,
}

/// Data included in a Bluetooth advertisement or scan reponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Manufacturer specific data (CSS §A.1.4)
    pub manufacturer_data: Option<ManufacturerData>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub services: Vec<Uuid>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
    /// Set to true for connectable advertising packets
    pub is_connectable: bool,
}

/// Manufacturer specific data included in Bluetooth advertisements. See the Bluetooth Core Specification Supplement
/// §A.1.4 for details.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManufacturerData {
    /// Company identifier, as [assigned] by the Bluetooth SIG
    ///
    /// [assigned]: https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers/
    pub company_id: u16,
    /// Manufacturer specific data
    pub data: Vec<u8>,
}

/// GATT characteristic properties as defined in the Bluetooth Core Specification, Vol 3, Part G, §3.3.1.1.
/// Extended properties are also included as defined in §3.3.3.1.
#[allow(missing_docs)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub authenticated_signed_writes: bool,
    pub extended_properties: bool,
    pub reliable_write: bool,
    pub writable_auxiliaries: bool,
}

impl CharacteristicProperties {
    /// Raw transmutation from [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn from_bits(bits: u32) -> Self {
        CharacteristicProperties {
            broadcast: (bits & (1 << 0)) != 0,
            read: (bits & (1 << 1)) != 0,
            write_without_response: (bits & (1 << 2)) != 0,
            write: (bits & (1 << 3)) != 0,
            notify: (bits & (1 << 4)) != 0,
            indicate: (bits & (1 << 5)) != 0,
            authenticated_signed_writes: (bits & (1 << 6)) != 0,
            extended_properties: (bits & (1 << 7)) != 0,
            reliable_write: (bits & (1 << 8)) != 0,
            writable_auxiliaries: (bits & (1 << 9)) != 0,
        }
    }

    /// Raw transmutation to [`u32`].
    ///
    /// Extended properties are in the upper bits.
    pub fn to_bits(self) -> u32 {
        u32::from(self.broadcast)
            | (u32::from(self.read) << 1)
            | (u32::from(self.write_without_response) << 2)
            | (u32::from(self.write) << 3)
            | (u32::from(self.notify) << 4)
            | (u32::from(self.indicate) << 5)
            | (u32::from(self.authenticated_signed_writes) << 6)
            | (u32::from(self.extended_properties) << 7)
            | (u32::from(self.reliable_write) << 8)
            | (u32::from(self.writable_auxiliaries) << 9)
    }
}

impl std::fmt::Display for CharacteristicProperties {
    /// Space separated property names, e.g. `read write notify`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.broadcast, "broadcast"),
            (self.read, "read"),
            (self.write_without_response, "write-without-response"),
            (self.write, "write"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
            (self.authenticated_signed_writes, "authenticated-signed-writes"),
            (self.extended_properties, "extended-properties"),
            (self.reliable_write, "reliable-write"),
            (self.writable_auxiliaries, "writable-auxiliaries"),
        ];
        let mut first = true;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_display() {
        let props = CharacteristicProperties::from_bits(0x1a);
        assert!(props.read && props.write && props.notify);
        assert_eq!(props.to_string(), "read write notify");
        assert_eq!(props.to_bits(), 0x1a);
        assert_eq!(CharacteristicProperties::default().to_string(), "");
    }
}
