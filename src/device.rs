use std::sync::{Arc, Weak};

use crate::adapter::AdapterInner;
use crate::connection::Connection;
use crate::error::ErrorKind;
use crate::{AdvertisementData, Error, Result, Service, Uuid};

/// A Bluetooth device address, displayed as `AA:BB:CC:DD:EE:FF`.
///
/// The bytes are stored most significant first, in the order they are displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(into = "String", try_from = "String"))]
pub struct DeviceId(pub [u8; 6]);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::with_message(ErrorKind::InvalidParameter, format!("invalid device address {s:?}"));
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c: char| c == ':' || c == '-');
        for byte in &mut bytes {
            let part = parts
                .next()
                .filter(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()))
                .ok_or_else(invalid)?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(DeviceId(bytes))
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for DeviceId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Connection state of a [`Device`].
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// disconnected
    Disconnected,
    /// connecting
    Connecting,
    /// connected
    Connected,
    /// disconnecting
    Disconnecting,
}

/// A Bluetooth LE device
///
/// Devices are cheap handles into the [`Adapter`][crate::Adapter]'s peripheral registry. They do not keep the
/// adapter alive; once it is dropped every operation fails with
/// [`AdapterUnavailable`][crate::error::ErrorKind::AdapterUnavailable].
#[derive(Clone)]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) adapter: Weak<AdapterInner>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, adapter: Weak<AdapterInner>) -> Self {
        Device { id, adapter }
    }

    fn adapter(&self) -> Result<Arc<AdapterInner>> {
        self.adapter
            .upgrade()
            .ok_or_else(|| Error::with_message(ErrorKind::AdapterUnavailable, "the adapter has been dropped"))
    }

    pub(crate) fn connection(&self) -> Result<Arc<Connection>> {
        self.adapter()?.connection(&self.id)
    }

    /// This device's unique identifier
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The local name for this device, if one has been advertised
    pub fn name(&self) -> Option<String> {
        self.adapter.upgrade()?.peripheral_name(&self.id)
    }

    /// The signal strength of the last advertisement received from this device, in dBm
    pub fn rssi(&self) -> Option<i16> {
        self.adapter.upgrade()?.peripheral_rssi(&self.id)
    }

    /// The last advertisement received from this device
    pub fn advertisement(&self) -> Option<AdvertisementData> {
        self.adapter.upgrade()?.peripheral_advertisement(&self.id)
    }

    /// The connection status for this device
    pub fn state(&self) -> ConnectionState {
        match self.adapter.upgrade() {
            Some(adapter) => adapter.connection_state(&self.id),
            None => ConnectionState::Disconnected,
        }
    }

    /// Whether this device is connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The ATT MTU of the current connection
    pub fn mtu(&self) -> Result<u16> {
        Ok(self.connection()?.mtu())
    }

    /// Negotiates a larger ATT MTU with the device and returns the MTU now in effect.
    ///
    /// `mtu` is clamped to the range 23 to 517. The exchange can only happen once per connection; later calls fail
    /// with [`NotSupported`][crate::error::ErrorKind::NotSupported], as do transports that negotiate the MTU
    /// themselves.
    pub async fn set_mtu(&self, mtu: u16) -> Result<u16> {
        self.connection()?.set_mtu(mtu).await
    }

    /// Discover the primary services of this device whose type is in `uuids`, or all of them if `uuids` is empty.
    ///
    /// The attribute table is read once per connection; later calls are answered from the cache until
    /// [`invalidate_cache`][Self::invalidate_cache] is called. Services are returned in handle order.
    pub async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<Service>> {
        let conn = self.connection()?;
        let services = conn.services().await?;
        Ok(services
            .into_iter()
            .filter(|s| uuids.is_empty() || uuids.contains(&s.uuid))
            .map(|s| Service::new(conn.clone(), s))
            .collect())
    }

    /// Discover the primary service(s) of this device with the given [`Uuid`].
    pub async fn discover_services_with_uuid(&self, uuid: Uuid) -> Result<Vec<Service>> {
        self.discover_services(&[uuid]).await
    }

    /// Get all primary services of this device, discovering them if necessary.
    pub async fn services(&self) -> Result<Vec<Service>> {
        self.discover_services(&[]).await
    }

    /// Forgets everything discovered on the current connection.
    ///
    /// Previously returned services, characteristics and descriptors remain usable for reads and writes, but
    /// notification streams end and value updates are no longer routed to them.
    pub async fn invalidate_cache(&self) -> Result<()> {
        self.connection()?.invalidate_cache().await;
        Ok(())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.adapter, &other.adapter)
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("id", &self.id).finish()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_format() {
        let id: DeviceId = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(id, DeviceId([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!("AA-BB-CC-DD-EE-FF".parse::<DeviceId>().unwrap(), id);

        for bad in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FF:00", "AA:BB:CC:DD:EE:GG", "A:BB:CC:DD:EE:FFF"] {
            let err = bad.parse::<DeviceId>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        }
    }
}
