use std::sync::Arc;

use crate::characteristic::CharacteristicInner;
use crate::connection::Connection;
use crate::{btuuid, Characteristic, DeviceId, Result, Uuid};

pub(crate) struct ServiceInner {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
    pub characteristics: async_lock::Mutex<Option<Vec<Arc<CharacteristicInner>>>>,
}

impl ServiceInner {
    pub fn new(uuid: Uuid, start_handle: u16, end_handle: u16) -> Self {
        ServiceInner {
            uuid,
            start_handle,
            end_handle,
            characteristics: async_lock::Mutex::new(None),
        }
    }
}

/// A Bluetooth GATT service
///
/// Services are only valid for the connection they were discovered on. Once the device disconnects every
/// operation fails with [`NotConnected`][crate::error::ErrorKind::NotConnected].
#[derive(Clone)]
pub struct Service {
    pub(crate) conn: Arc<Connection>,
    pub(crate) inner: Arc<ServiceInner>,
}

impl Service {
    pub(crate) fn new(conn: Arc<Connection>, inner: Arc<ServiceInner>) -> Self {
        Service { conn, inner }
    }

    /// The [`Uuid`] identifying the type of this GATT service
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// The assigned name of this service type, if it is a well known one.
    pub fn name(&self) -> Option<&'static str> {
        btuuid::name(&self.inner.uuid)
    }

    /// Whether this is a primary service of the device. Only primary services are discovered.
    pub fn is_primary(&self) -> bool {
        true
    }

    /// The range of attribute handles that make up this service.
    pub fn handles(&self) -> std::ops::RangeInclusive<u16> {
        self.inner.start_handle..=self.inner.end_handle
    }

    /// The device this service belongs to.
    pub fn device_id(&self) -> DeviceId {
        self.conn.device
    }

    /// Discover the characteristics of this service whose type is in `uuids`, or all of them if `uuids` is empty.
    ///
    /// Characteristics are read from the device once per connection and cached.
    pub async fn discover_characteristics(&self, uuids: &[Uuid]) -> Result<Vec<Characteristic>> {
        let found = self.conn.characteristics(&self.inner).await?;
        Ok(found
            .into_iter()
            .filter(|c| uuids.is_empty() || uuids.contains(&c.uuid))
            .map(|c| Characteristic::new(self.conn.clone(), c))
            .collect())
    }

    /// Discover the characteristic(s) with the given [`Uuid`].
    pub async fn discover_characteristics_with_uuid(&self, uuid: Uuid) -> Result<Vec<Characteristic>> {
        self.discover_characteristics(&[uuid]).await
    }

    /// Get all characteristics of this service, discovering them if necessary.
    pub async fn characteristics(&self) -> Result<Vec<Characteristic>> {
        self.discover_characteristics(&[]).await
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Service {}

impl std::hash::Hash for Service {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("device", &self.conn.device)
            .field("uuid", &self.inner.uuid)
            .field("handles", &self.handles())
            .finish()
    }
}
