use std::sync::{Arc, Mutex, Weak};

use crate::characteristic::CharacteristicInner;
use crate::connection::Connection;
use crate::{btuuid, Characteristic, Result, Uuid};

pub(crate) struct DescriptorInner {
    pub uuid: Uuid,
    pub handle: u16,
    pub characteristic: Weak<CharacteristicInner>,
    pub value: Mutex<Option<Vec<u8>>>,
}

impl DescriptorInner {
    pub fn new(characteristic: &Arc<CharacteristicInner>, handle: u16, uuid: Uuid) -> Self {
        DescriptorInner {
            uuid,
            handle,
            characteristic: Arc::downgrade(characteristic),
            value: Mutex::new(None),
        }
    }

    pub fn set_value(&self, value: Vec<u8>) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }
}

/// A Bluetooth GATT descriptor
#[derive(Clone)]
pub struct Descriptor {
    conn: Arc<Connection>,
    inner: Arc<DescriptorInner>,
}

impl Descriptor {
    pub(crate) fn new(conn: Arc<Connection>, inner: Arc<DescriptorInner>) -> Self {
        Descriptor { conn, inner }
    }

    /// The [`Uuid`] identifying the type of this GATT descriptor
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// The assigned name of this descriptor type, if it is a well known one.
    pub fn name(&self) -> Option<&'static str> {
        btuuid::name(&self.inner.uuid)
    }

    /// The attribute handle of this descriptor.
    pub fn handle(&self) -> u16 {
        self.inner.handle
    }

    /// The characteristic this descriptor belongs to, unless the discovery cache has been invalidated since.
    pub fn characteristic(&self) -> Option<Characteristic> {
        let characteristic = self.inner.characteristic.upgrade()?;
        Some(Characteristic::new(self.conn.clone(), characteristic))
    }

    /// The last value read from or written to this descriptor.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.inner.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Read the value of this descriptor from the device
    pub async fn read(&self) -> Result<Vec<u8>> {
        let value = self.conn.read_value(self.inner.handle).await?;
        self.inner.set_value(value.clone());
        Ok(value)
    }

    /// Write the value of this descriptor on the device to `value`
    pub async fn write(&self, value: &[u8]) -> Result<()> {
        self.conn.write_value(self.inner.handle, value).await?;
        self.inner.set_value(value.to_vec());
        Ok(())
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Descriptor {}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.inner.uuid)
            .field("handle", &self.inner.handle)
            .finish()
    }
}
