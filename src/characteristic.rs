use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_core::Stream;
use tracing::debug;

use crate::async_util::Broadcaster;
use crate::att::CharacteristicDeclaration;
use crate::btuuid::descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION;
use crate::connection::Connection;
use crate::descriptor::DescriptorInner;
use crate::error::ErrorKind;
use crate::service::ServiceInner;
use crate::{btuuid, CharacteristicProperties, Descriptor, Error, Result, Service, Uuid};

pub(crate) struct CharacteristicInner {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub declaration_handle: u16,
    pub value_handle: u16,
    pub end_handle: u16,
    pub service: Weak<ServiceInner>,
    pub value: Mutex<Option<Vec<u8>>>,
    pub descriptors: async_lock::Mutex<Option<Vec<Arc<DescriptorInner>>>>,
    pub notifier: Broadcaster<Vec<u8>>,
    pub notifying: AtomicBool,
}

impl CharacteristicInner {
    pub fn new(
        service: &Arc<ServiceInner>,
        declaration_handle: u16,
        declaration: &CharacteristicDeclaration,
        end_handle: u16,
        notification_capacity: usize,
    ) -> Self {
        CharacteristicInner {
            uuid: declaration.uuid,
            properties: CharacteristicProperties::from_bits(u32::from(declaration.properties)),
            declaration_handle,
            value_handle: declaration.value_handle,
            end_handle,
            service: Arc::downgrade(service),
            value: Mutex::new(None),
            descriptors: async_lock::Mutex::new(None),
            notifier: Broadcaster::new(notification_capacity),
            notifying: AtomicBool::new(false),
        }
    }

    pub fn set_value(&self, value: Vec<u8>) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }

    pub fn cached_value(&self) -> Option<Vec<u8>> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ends notification streams for a link that is gone.
    pub fn close(&self) {
        self.notifying.store(false, Ordering::Release);
        self.notifier.close();
    }
}

/// A Bluetooth GATT characteristic
#[derive(Clone)]
pub struct Characteristic {
    pub(crate) conn: Arc<Connection>,
    pub(crate) inner: Arc<CharacteristicInner>,
}

impl Characteristic {
    pub(crate) fn new(conn: Arc<Connection>, inner: Arc<CharacteristicInner>) -> Self {
        Characteristic { conn, inner }
    }

    /// The [`Uuid`] identifying the type of this GATT characteristic
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// The assigned name of this characteristic type, if it is a well known one.
    pub fn name(&self) -> Option<&'static str> {
        btuuid::name(&self.inner.uuid)
    }

    /// The properties of this this GATT characteristic.
    ///
    /// Characteristic properties indicate which operations (e.g. read, write, notify, etc) may be performed on this
    /// characteristic.
    pub fn properties(&self) -> CharacteristicProperties {
        self.inner.properties
    }

    /// The handle of the characteristic value attribute.
    pub fn handle(&self) -> u16 {
        self.inner.value_handle
    }

    /// The handle of the characteristic declaration attribute.
    pub fn declaration_handle(&self) -> u16 {
        self.inner.declaration_handle
    }

    /// The service this characteristic belongs to, unless the discovery cache has been invalidated since.
    pub fn service(&self) -> Option<Service> {
        let service = self.inner.service.upgrade()?;
        Some(Service::new(self.conn.clone(), service))
    }

    /// The last value read from or notified by the device.
    ///
    /// Notifications overwrite the cached value as they arrive, so a fast producer may replace a value before the
    /// application has looked at it.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.inner.cached_value()
    }

    /// Read the value of this characteristic from the device with a single Read Request.
    ///
    /// At most `MTU - 1` bytes are returned; use [`read_long`][Self::read_long] for longer values.
    pub async fn read(&self) -> Result<Vec<u8>> {
        self.require(self.inner.properties.read, "read")?;
        let value = self.conn.read_value(self.inner.value_handle).await?;
        self.inner.set_value(value.clone());
        Ok(value)
    }

    /// Read the complete value of this characteristic from the device, following up with Read Blob Requests
    /// while the device returns full-sized fragments.
    pub async fn read_long(&self) -> Result<Vec<u8>> {
        self.require(self.inner.properties.read, "read")?;
        let value = self.conn.read_long_value(self.inner.value_handle).await?;
        self.inner.set_value(value.clone());
        Ok(value)
    }

    /// Write the value of this characteristic on the device to `value` and wait for the device to acknowledge it.
    ///
    /// Values longer than [`max_write_len`][Self::max_write_len] are written with a prepared write.
    pub async fn write(&self, value: &[u8]) -> Result<()> {
        self.require(self.inner.properties.write, "write")?;
        self.conn.write_value(self.inner.value_handle, value).await
    }

    /// Write the value of this characteristic on the device to `value` without requesting a response.
    ///
    /// Returns once the transport has accepted the packet.
    pub async fn write_without_response(&self, value: &[u8]) -> Result<()> {
        self.require(self.inner.properties.write_without_response, "write without response")?;
        self.conn.write_command(self.inner.value_handle, value).await
    }

    /// Write `value`, waiting for an acknowledgement if `with_response` is set.
    pub async fn write_with(&self, value: &[u8], with_response: bool) -> Result<()> {
        if with_response {
            self.write(value).await
        } else {
            self.write_without_response(value).await
        }
    }

    /// Get the maximum amount of data that can be written in a single packet for this characteristic.
    pub fn max_write_len(&self) -> usize {
        usize::from(self.conn.mtu()) - 3
    }

    /// Enables notifications (or indications, if the characteristic does not support notifications) on the device.
    pub async fn subscribe(&self) -> Result<()> {
        let props = self.inner.properties;
        let config: [u8; 2] = if props.notify {
            [0x01, 0x00]
        } else if props.indicate {
            [0x02, 0x00]
        } else {
            return Err(Error::with_message(
                ErrorKind::PropertyNotSupported,
                "characteristic supports neither notify nor indicate",
            ));
        };
        let cccd = self.client_configuration().await?;
        self.conn.write_value(cccd.handle, &config).await?;
        cccd.set_value(config.to_vec());
        self.inner.notifying.store(true, Ordering::Release);
        debug!("subscribed to {} on {}", self.inner.uuid, self.conn.device);
        Ok(())
    }

    /// Disables notifications and indications on the device.
    pub async fn unsubscribe(&self) -> Result<()> {
        let props = self.inner.properties;
        if !(props.notify || props.indicate) {
            return Err(Error::with_message(
                ErrorKind::PropertyNotSupported,
                "characteristic supports neither notify nor indicate",
            ));
        }
        let cccd = self.client_configuration().await?;
        self.conn.write_value(cccd.handle, &[0x00, 0x00]).await?;
        cccd.set_value(vec![0x00, 0x00]);
        self.inner.notifying.store(false, Ordering::Release);
        Ok(())
    }

    /// Enables notification of value changes for this GATT characteristic.
    ///
    /// Returns a stream of values for the characteristic sent from the device. The subscription stays active
    /// when the stream is dropped; call [`unsubscribe`][Self::unsubscribe] to end it. The stream ends when the
    /// device disconnects. If the stream falls behind by more than
    /// [`notification_capacity`][crate::AdapterConfig::notification_capacity] values the oldest are dropped.
    pub async fn notify(&self) -> Result<impl Stream<Item = Vec<u8>> + Send + Unpin + 'static> {
        self.conn.check_open()?;
        let receiver = self.inner.notifier.subscribe();
        if !self.is_notifying() {
            self.subscribe().await?;
        }
        Ok(receiver)
    }

    /// Is the device currently sending notifications for this characteristic?
    pub fn is_notifying(&self) -> bool {
        self.inner.notifying.load(Ordering::Acquire)
    }

    /// Discover the descriptors of this characteristic whose type is in `uuids`, or all of them if `uuids` is
    /// empty.
    pub async fn discover_descriptors(&self, uuids: &[Uuid]) -> Result<Vec<Descriptor>> {
        let found = self.conn.descriptors(&self.inner).await?;
        Ok(found
            .into_iter()
            .filter(|d| uuids.is_empty() || uuids.contains(&d.uuid))
            .map(|d| Descriptor::new(self.conn.clone(), d))
            .collect())
    }

    /// Get all descriptors of this characteristic, discovering them if necessary.
    pub async fn descriptors(&self) -> Result<Vec<Descriptor>> {
        self.discover_descriptors(&[]).await
    }

    async fn client_configuration(&self) -> Result<Arc<DescriptorInner>> {
        self.conn
            .descriptors(&self.inner)
            .await?
            .into_iter()
            .find(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION)
            .ok_or_else(|| {
                Error::with_message(ErrorKind::NotFound, "no client characteristic configuration descriptor")
            })
    }

    fn require(&self, supported: bool, operation: &str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(Error::with_message(
                ErrorKind::PropertyNotSupported,
                format!("{} is not permitted on {}", operation, self.inner.uuid),
            ))
        }
    }
}

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Characteristic {}

impl std::hash::Hash for Characteristic {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state)
    }
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("device", &self.conn.device)
            .field("uuid", &self.inner.uuid)
            .field("handle", &self.inner.value_handle)
            .field("properties", &self.inner.properties)
            .finish()
    }
}
