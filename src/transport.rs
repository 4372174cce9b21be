//! The boundary between the GATT client engine and a platform Bluetooth stack.
//!
//! A [`Transport`] turns requests from the engine into controller operations (scanning, link setup and
//! teardown, sending ATT PDUs) and reports everything that happens on the radio back through an [`EventSink`]
//! as [`TransportEvent`]s. Operations that complete asynchronously on the controller, such as establishing a
//! link, only *initiate* the operation; the outcome arrives later as an event.

use std::sync::Weak;

use async_trait::async_trait;
use tracing::trace;

use crate::adapter::AdapterInner;
use crate::error::ErrorKind;
use crate::{AdvertisementData, DeviceId, Error, Result, Uuid};

/// Identifies one link on the transport, analogous to an HCI connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(pub u16);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Power state of the local controller.
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerState {
    /// unknown
    #[default]
    Unknown,
    /// resetting
    Resetting,
    /// unsupported
    Unsupported,
    /// unauthorized
    Unauthorized,
    /// powered off
    PoweredOff,
    /// powered on
    PoweredOn,
}

impl PowerState {
    /// Whether the controller can scan and connect.
    pub fn is_powered_on(self) -> bool {
        self == PowerState::PoweredOn
    }
}

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The peer closed the link (HCI 0x13).
    RemoteUserTerminated,
    /// The peer closed the link because it ran low on resources (HCI 0x14).
    RemoteLowResources,
    /// The peer closed the link because it is powering off (HCI 0x15).
    RemotePowerOff,
    /// The local host closed the link (HCI 0x16).
    LocalHostTerminated,
    /// The link supervision timeout expired (HCI 0x08).
    ConnectionTimeout,
    /// The controller or the platform stack went away.
    TransportLost,
    /// Any other HCI reason code.
    Other(u8),
}

impl From<u8> for DisconnectReason {
    fn from(code: u8) -> Self {
        match code {
            0x08 => DisconnectReason::ConnectionTimeout,
            0x13 => DisconnectReason::RemoteUserTerminated,
            0x14 => DisconnectReason::RemoteLowResources,
            0x15 => DisconnectReason::RemotePowerOff,
            0x16 => DisconnectReason::LocalHostTerminated,
            code => DisconnectReason::Other(code),
        }
    }
}

impl DisconnectReason {
    /// The error reported to applications for a disconnection they did not request.
    ///
    /// Orderly terminations carry no error.
    pub fn to_error(self) -> Option<Error> {
        match self {
            DisconnectReason::RemoteUserTerminated
            | DisconnectReason::RemoteLowResources
            | DisconnectReason::RemotePowerOff
            | DisconnectReason::LocalHostTerminated => None,
            DisconnectReason::ConnectionTimeout => {
                Some(Error::with_message(ErrorKind::Timeout, "link supervision timeout"))
            }
            DisconnectReason::TransportLost => Some(ErrorKind::TransportLost.into()),
            DisconnectReason::Other(code) => Some(Error::with_message(
                ErrorKind::TransportLost,
                format!("disconnected with reason 0x{code:02x}"),
            )),
        }
    }
}

/// Something that happened on the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The controller's power state changed.
    PowerStateChanged(PowerState),
    /// An advertising report was received while scanning.
    Advertisement {
        /// Address of the advertiser
        id: DeviceId,
        /// Signal strength of the report
        rssi: Option<i16>,
        /// Parsed advertising payload
        data: AdvertisementData,
    },
    /// A link initiated with [`Transport::connect`] is up.
    Connected {
        /// Address of the peer
        id: DeviceId,
        /// Handle used for all further traffic on the link
        handle: ConnectionHandle,
    },
    /// A link initiated with [`Transport::connect`] could not be established.
    ConnectFailed {
        /// Address of the peer
        id: DeviceId,
        /// The reason
        error: Error,
    },
    /// A link went down, whoever initiated it.
    Disconnected {
        /// The link
        handle: ConnectionHandle,
        /// The reason
        reason: DisconnectReason,
    },
    /// An ATT PDU arrived on a link.
    AttPdu {
        /// The link
        handle: ConnectionHandle,
        /// The raw PDU, opcode first
        pdu: Vec<u8>,
    },
}

/// Where a [`Transport`] reports [`TransportEvent`]s.
///
/// Delivery never blocks on application code, so a transport may call [`deliver`][EventSink::deliver] from its
/// receive path, including from inside one of its own [`Transport`] methods.
#[derive(Clone)]
pub struct EventSink {
    adapter: Weak<AdapterInner>,
}

impl EventSink {
    pub(crate) fn new(adapter: Weak<AdapterInner>) -> Self {
        EventSink { adapter }
    }

    /// Hands `event` to the engine.
    pub fn deliver(&self, event: TransportEvent) {
        match self.adapter.upgrade() {
            Some(adapter) => adapter.handle_transport_event(event),
            None => trace!("adapter gone, dropping {:?}", event),
        }
    }

    /// Whether the adapter this sink feeds has been dropped.
    pub fn is_closed(&self) -> bool {
        self.adapter.strong_count() == 0
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").field("closed", &self.is_closed()).finish()
    }
}

/// A platform Bluetooth stack in the LE Central role.
///
/// Implementations must not call back into the [`Adapter`][crate::Adapter] synchronously other than through
/// [`EventSink::deliver`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the controller. Events must be delivered to `sink` from now on.
    async fn open(&self, sink: EventSink) -> Result<()>;

    /// Closes the controller. All links are gone afterwards.
    async fn close(&self);

    /// The current power state.
    fn power_state(&self) -> PowerState;

    /// Starts reporting advertisements. An empty `services` list means no filtering.
    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()>;

    /// Stops reporting advertisements.
    async fn stop_scan(&self) -> Result<()>;

    /// Initiates a link to `id`. Completion is reported as [`TransportEvent::Connected`] or
    /// [`TransportEvent::ConnectFailed`].
    async fn connect(&self, id: &DeviceId) -> Result<()>;

    /// Abandons a pending [`connect`][Self::connect]. No event is required afterwards.
    async fn cancel_connect(&self, id: &DeviceId) -> Result<()>;

    /// Initiates teardown of a link. Completion is reported as [`TransportEvent::Disconnected`].
    async fn disconnect(&self, handle: ConnectionHandle) -> Result<()>;

    /// Queues an ATT PDU for transmission on a link.
    async fn send(&self, handle: ConnectionHandle, pdu: Vec<u8>) -> Result<()>;

    /// Whether the client may run the Exchange MTU procedure.
    fn supports_mtu_exchange(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_reasons() {
        assert_eq!(DisconnectReason::from(0x13), DisconnectReason::RemoteUserTerminated);
        assert!(DisconnectReason::RemoteUserTerminated.to_error().is_none());
        assert_eq!(
            DisconnectReason::ConnectionTimeout.to_error().map(|e| e.kind()),
            Some(ErrorKind::Timeout)
        );
        assert_eq!(
            DisconnectReason::from(0x3e).to_error().map(|e| e.kind()),
            Some(ErrorKind::TransportLost)
        );
    }
}
