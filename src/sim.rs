//! An in-memory [`Transport`] with simulated peripherals.
//!
//! Every [`SimPeripheral`] runs a small ATT server over its own attribute table, so everything above the
//! transport (discovery walks, long reads and writes, subscriptions) behaves as it would against a radio. Events
//! are delivered inline on the calling thread. The controls on [`SimulatedTransport`] script what the peripherals
//! do: advertise, vanish, stop answering, notify, or drop the link.
//!
//! ```rust
//!# use bluegatt::sim::{SimCharacteristic, SimPeripheral, SimService, SimulatedTransport};
//!# use bluegatt::{Adapter, AdapterConfig, DeviceId};
//!# use bluegatt::btuuid::{characteristics, services};
//!let sim = SimulatedTransport::new();
//!sim.add_peripheral(
//!    SimPeripheral::new(DeviceId([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
//!        .name("Thingy")
//!        .service(
//!            SimService::new(services::BATTERY)
//!                .characteristic(
//!                    SimCharacteristic::new(characteristics::BATTERY_LEVEL)
//!                        .readable()
//!                        .notify()
//!                        .value([87]),
//!                ),
//!        ),
//!);
//!let adapter = Adapter::new(sim.clone(), AdapterConfig::default())?;
//!# Ok::<(), bluegatt::Error>(())
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::att::{self, CharacteristicDeclaration, DecodeError, GroupEntry, Opcode, Pdu, DEFAULT_MTU};
use crate::btuuid::{attributes, descriptors};
use crate::error::{AttError, AttErrorCode, ErrorKind};
use crate::transport::{ConnectionHandle, DisconnectReason, EventSink, PowerState, Transport, TransportEvent};
use crate::{
    AdvertisementData, BluetoothUuidExt, CharacteristicProperties, DeviceId, Error, ManufacturerData, Result, Uuid,
};

/// The MTU simulated peripherals answer an Exchange MTU Request with.
pub const SERVER_MTU: u16 = 247;

/// A characteristic of a [`SimService`].
#[derive(Debug, Clone)]
pub struct SimCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<(Uuid, Vec<u8>)>,
}

impl SimCharacteristic {
    /// A characteristic of type `uuid` with no properties and an empty value.
    pub fn new(uuid: Uuid) -> Self {
        SimCharacteristic {
            uuid,
            properties: CharacteristicProperties::default(),
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    /// Allows reads.
    pub fn readable(mut self) -> Self {
        self.properties.read = true;
        self
    }

    /// Allows writes with response.
    pub fn writable(mut self) -> Self {
        self.properties.write = true;
        self
    }

    /// Allows writes without response.
    pub fn write_without_response(mut self) -> Self {
        self.properties.write_without_response = true;
        self
    }

    /// Allows notifications. Adds a client characteristic configuration descriptor.
    pub fn notify(mut self) -> Self {
        self.properties.notify = true;
        self
    }

    /// Allows indications. Adds a client characteristic configuration descriptor.
    pub fn indicate(mut self) -> Self {
        self.properties.indicate = true;
        self
    }

    /// Sets the initial value.
    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Adds a readable and writable descriptor.
    pub fn descriptor(mut self, uuid: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.descriptors.push((uuid, value.into()));
        self
    }
}

/// A primary service of a [`SimPeripheral`].
#[derive(Debug, Clone)]
pub struct SimService {
    uuid: Uuid,
    characteristics: Vec<SimCharacteristic>,
}

impl SimService {
    /// An empty primary service of type `uuid`.
    pub fn new(uuid: Uuid) -> Self {
        SimService {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Appends a characteristic.
    pub fn characteristic(mut self, characteristic: SimCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

/// A simulated peripheral. It advertises its name, manufacturer data and all of its service UUIDs.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    id: DeviceId,
    name: Option<String>,
    rssi: i16,
    manufacturer_data: Option<ManufacturerData>,
    services: Vec<SimService>,
}

impl SimPeripheral {
    /// A nameless peripheral at `id` with no services.
    pub fn new(id: DeviceId) -> Self {
        SimPeripheral {
            id,
            name: None,
            rssi: -60,
            manufacturer_data: None,
            services: Vec::new(),
        }
    }

    /// Sets the advertised local name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Sets the signal strength reported with each advertisement.
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Sets the advertised manufacturer specific data.
    pub fn manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data = Some(ManufacturerData {
            company_id,
            data: data.into(),
        });
        self
    }

    /// Appends a primary service.
    pub fn service(mut self, service: SimService) -> Self {
        self.services.push(service);
        self
    }

    fn advertising_payload(&self) -> Vec<u8> {
        fn structure(buf: &mut Vec<u8>, ty: u8, data: &[u8]) {
            buf.push(data.len() as u8 + 1);
            buf.push(ty);
            buf.extend_from_slice(data);
        }

        let mut buf = Vec::new();
        structure(&mut buf, 0x01, &[0x06]);
        if let Some(name) = &self.name {
            structure(&mut buf, 0x09, name.as_bytes());
        }
        let (short, long): (Vec<Uuid>, Vec<Uuid>) =
            self.services.iter().map(|s| s.uuid).partition(|uuid| uuid.is_u16_uuid());
        if !short.is_empty() {
            structure(&mut buf, 0x03, &short.iter().flat_map(|u| u.to_att_bytes()).collect::<Vec<_>>());
        }
        for uuid in long {
            structure(&mut buf, 0x07, &uuid.to_att_bytes());
        }
        if let Some(mfg) = &self.manufacturer_data {
            let mut data = mfg.company_id.to_le_bytes().to_vec();
            data.extend_from_slice(&mfg.data);
            structure(&mut buf, 0xff, &data);
        }
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttributeKind {
    Service,
    Declaration,
    Value,
    Descriptor,
}

#[derive(Debug, Clone)]
struct Attribute {
    handle: u16,
    kind: AttributeKind,
    ty: Uuid,
    value: Vec<u8>,
    readable: bool,
    writable: bool,
    group_end: u16,
}

fn build_database(services: &[SimService]) -> Vec<Attribute> {
    fn push(db: &mut Vec<Attribute>, kind: AttributeKind, ty: Uuid, value: Vec<u8>, readable: bool, writable: bool) {
        let handle = db.len() as u16 + 1;
        db.push(Attribute {
            handle,
            kind,
            ty,
            value,
            readable,
            writable,
            group_end: handle,
        });
    }

    let mut db: Vec<Attribute> = Vec::new();

    for service in services {
        let start = db.len();
        push(
            &mut db,
            AttributeKind::Service,
            attributes::PRIMARY_SERVICE,
            service.uuid.to_att_bytes(),
            true,
            false,
        );
        for c in &service.characteristics {
            let declaration = CharacteristicDeclaration {
                properties: c.properties.to_bits() as u8,
                value_handle: db.len() as u16 + 2,
                uuid: c.uuid,
            };
            push(
                &mut db,
                AttributeKind::Declaration,
                attributes::CHARACTERISTIC,
                declaration.to_bytes(),
                true,
                false,
            );
            let props = c.properties;
            push(
                &mut db,
                AttributeKind::Value,
                c.uuid,
                c.value.clone(),
                props.read,
                props.write || props.write_without_response,
            );
            if props.notify || props.indicate {
                push(
                    &mut db,
                    AttributeKind::Descriptor,
                    descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION,
                    vec![0, 0],
                    true,
                    true,
                );
            }
            for (uuid, value) in &c.descriptors {
                push(&mut db, AttributeKind::Descriptor, *uuid, value.clone(), true, true);
            }
        }
        let end = db.len() as u16;
        db[start].group_end = end;
    }
    db
}

fn error(request: Opcode, handle: u16, code: AttErrorCode) -> Option<Pdu> {
    Some(Pdu::error(request, handle, code))
}

struct SimDevice {
    peripheral: SimPeripheral,
    db: Vec<Attribute>,
    present: bool,
    unresponsive: bool,
    reject_connections: bool,
    link: Option<ConnectionHandle>,
    mtu: u16,
    prepared: Vec<(u16, u16, Vec<u8>)>,
    requests: usize,
    client_pdus: Vec<Vec<u8>>,
}

impl SimDevice {
    fn attribute_mut(&mut self, handle: u16) -> Option<&mut Attribute> {
        self.db.get_mut(usize::from(handle).checked_sub(1)?)
    }

    fn value_handle(&self, uuid: Uuid) -> Option<u16> {
        self.db
            .iter()
            .find(|a| a.kind == AttributeKind::Value && a.ty == uuid)
            .map(|a| a.handle)
    }

    fn client_configuration(&self, value_handle: u16) -> u16 {
        self.db
            .iter()
            .skip(usize::from(value_handle))
            .take_while(|a| a.kind == AttributeKind::Descriptor)
            .find(|a| a.ty == descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION)
            .and_then(|a| a.value.get(..2))
            .map(|v| u16::from_le_bytes([v[0], v[1]]))
            .unwrap_or(0)
    }

    fn reset_link_state(&mut self) {
        self.mtu = DEFAULT_MTU;
        self.prepared.clear();
        for attr in &mut self.db {
            if attr.ty == descriptors::CLIENT_CHARACTERISTIC_CONFIGURATION {
                attr.value = vec![0, 0];
            }
        }
    }

    /// Runs one inbound PDU through the ATT server.
    fn serve(&mut self, bytes: &[u8]) -> Option<Pdu> {
        let request = match Pdu::decode(bytes) {
            Ok(pdu) => pdu,
            Err(DecodeError::UnknownOpcode(raw)) if !att::is_command(raw) => {
                return Some(Pdu::ErrorResponse {
                    request: raw,
                    handle: 0,
                    error: AttError::Known(AttErrorCode::RequestNotSupported),
                })
            }
            Err(DecodeError::Truncated(opcode) | DecodeError::Malformed(opcode)) if opcode.is_request() => {
                return error(opcode, 0, AttErrorCode::InvalidPdu)
            }
            Err(err) => {
                debug!("sim: dropping bad PDU: {}", err);
                return None;
            }
        };

        let opcode = request.opcode();
        if opcode.is_request() {
            self.requests += 1;
        } else if !att::is_command(opcode as u8) {
            self.client_pdus.push(bytes.to_vec());
            return None;
        }

        let mtu = usize::from(self.mtu);
        match request {
            Pdu::ExchangeMtuRequest { mtu } => {
                self.mtu = mtu.clamp(DEFAULT_MTU, SERVER_MTU);
                Some(Pdu::ExchangeMtuResponse { mtu: SERVER_MTU })
            }
            Pdu::ReadByGroupTypeRequest { start, end, group_type } => {
                if start == 0 || start > end {
                    return error(opcode, start, AttErrorCode::InvalidHandle);
                }
                if group_type != attributes::PRIMARY_SERVICE {
                    return error(opcode, start, AttErrorCode::UnsupportedGroupType);
                }
                let mut entries: Vec<GroupEntry> = Vec::new();
                let mut size = 2;
                for attr in self.db.iter().filter(|a| {
                    a.kind == AttributeKind::Service && (start..=end).contains(&a.handle)
                }) {
                    if entries.first().map(|e| e.value.len() != attr.value.len()).unwrap_or(false)
                        || size + 4 + attr.value.len() > mtu
                    {
                        break;
                    }
                    size += 4 + attr.value.len();
                    entries.push(GroupEntry {
                        handle: attr.handle,
                        end_group: attr.group_end,
                        value: attr.value.clone(),
                    });
                }
                if entries.is_empty() {
                    return error(opcode, start, AttErrorCode::AttributeNotFound);
                }
                Some(Pdu::ReadByGroupTypeResponse { entries })
            }
            Pdu::ReadByTypeRequest {
                start,
                end,
                attribute_type,
            } => {
                if start == 0 || start > end {
                    return error(opcode, start, AttErrorCode::InvalidHandle);
                }
                let max_value = (mtu - 4).min(253);
                let mut entries: Vec<(u16, Vec<u8>)> = Vec::new();
                let mut size = 2;
                for attr in self
                    .db
                    .iter()
                    .filter(|a| a.ty == attribute_type && (start..=end).contains(&a.handle))
                {
                    if !attr.readable {
                        if entries.is_empty() {
                            return error(opcode, attr.handle, AttErrorCode::ReadNotPermitted);
                        }
                        break;
                    }
                    let value = &attr.value[..attr.value.len().min(max_value)];
                    if entries.first().map(|(_, v)| v.len() != value.len()).unwrap_or(false)
                        || size + 2 + value.len() > mtu
                    {
                        break;
                    }
                    size += 2 + value.len();
                    entries.push((attr.handle, value.to_vec()));
                }
                if entries.is_empty() {
                    return error(opcode, start, AttErrorCode::AttributeNotFound);
                }
                Some(Pdu::ReadByTypeResponse { entries })
            }
            Pdu::FindInformationRequest { start, end } => {
                if start == 0 || start > end {
                    return error(opcode, start, AttErrorCode::InvalidHandle);
                }
                let mut entries: Vec<(u16, Uuid)> = Vec::new();
                let mut size = 2;
                for attr in self.db.iter().filter(|a| (start..=end).contains(&a.handle)) {
                    let width = if attr.ty.is_u16_uuid() { 2 } else { 16 };
                    if entries
                        .first()
                        .map(|(_, uuid)| uuid.is_u16_uuid() != attr.ty.is_u16_uuid())
                        .unwrap_or(false)
                        || size + 2 + width > mtu
                    {
                        break;
                    }
                    size += 2 + width;
                    entries.push((attr.handle, attr.ty));
                }
                if entries.is_empty() {
                    return error(opcode, start, AttErrorCode::AttributeNotFound);
                }
                Some(Pdu::FindInformationResponse { entries })
            }
            Pdu::ReadRequest { handle } => match self.attribute_mut(handle) {
                None => error(opcode, handle, AttErrorCode::InvalidHandle),
                Some(attr) if !attr.readable => error(opcode, handle, AttErrorCode::ReadNotPermitted),
                Some(attr) => Some(Pdu::ReadResponse {
                    value: attr.value[..attr.value.len().min(mtu - 1)].to_vec(),
                }),
            },
            Pdu::ReadBlobRequest { handle, offset } => match self.attribute_mut(handle) {
                None => error(opcode, handle, AttErrorCode::InvalidHandle),
                Some(attr) if !attr.readable => error(opcode, handle, AttErrorCode::ReadNotPermitted),
                Some(attr) if usize::from(offset) > attr.value.len() => {
                    error(opcode, handle, AttErrorCode::InvalidOffset)
                }
                Some(attr) => {
                    let start = usize::from(offset);
                    let end = attr.value.len().min(start + mtu - 1);
                    Some(Pdu::ReadBlobResponse {
                        value: attr.value[start..end].to_vec(),
                    })
                }
            },
            Pdu::WriteRequest { handle, value } => match self.attribute_mut(handle) {
                None => error(opcode, handle, AttErrorCode::InvalidHandle),
                Some(attr) if !attr.writable => error(opcode, handle, AttErrorCode::WriteNotPermitted),
                Some(attr) => {
                    attr.value = value;
                    Some(Pdu::WriteResponse)
                }
            },
            Pdu::WriteCommand { handle, value } => {
                match self.attribute_mut(handle) {
                    Some(attr) if attr.writable => attr.value = value,
                    _ => debug!("sim: ignoring write command to 0x{:04x}", handle),
                }
                None
            }
            Pdu::PrepareWriteRequest { handle, offset, value } => match self.attribute_mut(handle) {
                None => error(opcode, handle, AttErrorCode::InvalidHandle),
                Some(attr) if !attr.writable => error(opcode, handle, AttErrorCode::WriteNotPermitted),
                Some(_) => {
                    self.prepared.push((handle, offset, value.clone()));
                    Some(Pdu::PrepareWriteResponse { handle, offset, value })
                }
            },
            Pdu::ExecuteWriteRequest { commit } => {
                let prepared = std::mem::take(&mut self.prepared);
                if commit {
                    for (handle, offset, part) in prepared {
                        let Some(attr) = self.attribute_mut(handle) else {
                            return error(opcode, handle, AttErrorCode::InvalidHandle);
                        };
                        let offset = usize::from(offset);
                        if offset > attr.value.len() {
                            return error(opcode, handle, AttErrorCode::InvalidOffset);
                        }
                        if offset + part.len() > att::MAX_ATTRIBUTE_LEN {
                            return error(opcode, handle, AttErrorCode::InvalidAttributeValueLength);
                        }
                        attr.value.truncate(offset);
                        attr.value.extend_from_slice(&part);
                    }
                }
                Some(Pdu::ExecuteWriteResponse)
            }
            other => error(other.opcode(), 0, AttErrorCode::RequestNotSupported),
        }
    }
}

struct SimState {
    sink: Option<EventSink>,
    power: PowerState,
    scanning: bool,
    mtu_exchange_allowed: bool,
    devices: HashMap<DeviceId, SimDevice>,
    pending: HashSet<DeviceId>,
    links: HashMap<ConnectionHandle, DeviceId>,
    next_handle: u16,
}

impl SimState {
    fn advertisement(&self, id: &DeviceId) -> Option<TransportEvent> {
        let device = self.devices.get(id)?;
        if !self.scanning || !device.present {
            return None;
        }
        let mut data = AdvertisementData::from_bytes(&device.peripheral.advertising_payload());
        data.is_connectable = true;
        Some(TransportEvent::Advertisement {
            id: *id,
            rssi: Some(device.peripheral.rssi),
            data,
        })
    }

    fn establish(&mut self, id: &DeviceId) -> Option<TransportEvent> {
        let device = self.devices.get_mut(id)?;
        if !device.present || device.link.is_some() {
            return None;
        }
        self.pending.remove(id);
        if device.reject_connections {
            return Some(TransportEvent::ConnectFailed {
                id: *id,
                error: Error::with_message(ErrorKind::ConnectionFailed, "connection rejected by peer"),
            });
        }
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(0x0040);
        device.link = Some(handle);
        device.reset_link_state();
        self.links.insert(handle, *id);
        debug!("sim: {} connected on {}", id, handle);
        Some(TransportEvent::Connected { id: *id, handle })
    }

    fn unlink(&mut self, id: &DeviceId) -> Option<ConnectionHandle> {
        let handle = self.devices.get_mut(id)?.link.take()?;
        self.links.remove(&handle);
        Some(handle)
    }
}

/// A [`Transport`] backed by simulated peripherals.
///
/// Cloning yields another handle to the same simulation, so a test can keep one to script the peripherals
/// while the [`Adapter`][crate::Adapter] owns the other.
#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// A powered on controller with no peripherals.
    pub fn new() -> Self {
        SimulatedTransport {
            state: Arc::new(Mutex::new(SimState {
                sink: None,
                power: PowerState::PoweredOn,
                scanning: false,
                mtu_exchange_allowed: true,
                devices: HashMap::new(),
                pending: HashSet::new(),
                links: HashMap::new(),
                next_handle: 0x0040,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands `events` to the adapter. Must be called without the state lock held.
    fn deliver(&self, events: impl IntoIterator<Item = TransportEvent>) {
        let sink = self.lock().sink.clone();
        if let Some(sink) = sink {
            for event in events {
                trace!("sim: delivering {:?}", event);
                sink.deliver(event);
            }
        }
    }

    /// Adds a peripheral that is present and, while scanning, advertises immediately.
    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        let id = peripheral.id;
        let events = {
            let mut state = self.lock();
            let db = build_database(&peripheral.services);
            state.devices.insert(
                id,
                SimDevice {
                    peripheral,
                    db,
                    present: true,
                    unresponsive: false,
                    reject_connections: false,
                    link: None,
                    mtu: DEFAULT_MTU,
                    prepared: Vec::new(),
                    requests: 0,
                    client_pdus: Vec::new(),
                },
            );
            let mut events: Vec<_> = state.advertisement(&id).into_iter().collect();
            if state.pending.contains(&id) {
                events.extend(state.establish(&id));
            }
            events
        };
        self.deliver(events);
    }

    /// Changes the controller's power state. Losing power drops every link without a disconnection event.
    pub fn set_power(&self, power: PowerState) {
        {
            let mut state = self.lock();
            state.power = power;
            if !power.is_powered_on() {
                state.scanning = false;
                state.pending.clear();
                let ids: Vec<DeviceId> = state.links.values().copied().collect();
                for id in ids {
                    state.unlink(&id);
                }
            }
        }
        self.deliver([TransportEvent::PowerStateChanged(power)]);
    }

    /// Sends another advertisement from `id`. Returns `false` if nothing was sent.
    pub fn advertise(&self, id: &DeviceId) -> bool {
        let event = self.lock().advertisement(id);
        let sent = event.is_some();
        self.deliver(event);
        sent
    }

    /// Makes a peripheral appear or vanish. A peripheral that appears completes a pending connection attempt.
    pub fn set_present(&self, id: &DeviceId, present: bool) {
        let events = {
            let mut state = self.lock();
            let Some(device) = state.devices.get_mut(id) else {
                return;
            };
            device.present = present;
            let mut events: Vec<_> = state.advertisement(id).into_iter().collect();
            if present && state.pending.contains(id) {
                events.extend(state.establish(id));
            }
            events
        };
        self.deliver(events);
    }

    /// Makes a peripheral silently swallow every request.
    pub fn set_unresponsive(&self, id: &DeviceId, unresponsive: bool) {
        if let Some(device) = self.lock().devices.get_mut(id) {
            device.unresponsive = unresponsive;
        }
    }

    /// Makes a peripheral refuse connection attempts.
    pub fn reject_connections(&self, id: &DeviceId, reject: bool) {
        if let Some(device) = self.lock().devices.get_mut(id) {
            device.reject_connections = reject;
        }
    }

    /// Whether the client may run the Exchange MTU procedure.
    pub fn set_mtu_exchange_allowed(&self, allowed: bool) {
        self.lock().mtu_exchange_allowed = allowed;
    }

    /// Drops the link to `id` as if the peer or the radio had ended it. Returns `false` if not connected.
    pub fn drop_link(&self, id: &DeviceId, reason: DisconnectReason) -> bool {
        let handle = self.lock().unlink(id);
        match handle {
            Some(handle) => {
                self.deliver([TransportEvent::Disconnected { handle, reason }]);
                true
            }
            None => false,
        }
    }

    /// Sets the value of the characteristic `uuid` on `id` and sends it to the client as a notification or
    /// indication, whichever the client enabled. Returns `false` if the client has not subscribed.
    pub fn notify(&self, id: &DeviceId, uuid: Uuid, value: &[u8]) -> bool {
        let event = {
            let mut state = self.lock();
            let Some(device) = state.devices.get_mut(id) else {
                return false;
            };
            let Some(handle) = device.value_handle(uuid) else {
                return false;
            };
            if let Some(attr) = device.attribute_mut(handle) {
                attr.value = value.to_vec();
            }
            let (Some(link), config) = (device.link, device.client_configuration(handle)) else {
                return false;
            };
            let pdu = if config & 0x0001 != 0 {
                Pdu::HandleValueNotification {
                    handle,
                    value: value.to_vec(),
                }
            } else if config & 0x0002 != 0 {
                Pdu::HandleValueIndication {
                    handle,
                    value: value.to_vec(),
                }
            } else {
                return false;
            };
            TransportEvent::AttPdu {
                handle: link,
                pdu: pdu.encode(),
            }
        };
        self.deliver([event]);
        true
    }

    /// Sends a raw PDU from `id` to the client. Returns `false` if not connected.
    pub fn inject(&self, id: &DeviceId, pdu: Vec<u8>) -> bool {
        let link = self.lock().devices.get(id).and_then(|d| d.link);
        match link {
            Some(handle) => {
                self.deliver([TransportEvent::AttPdu { handle, pdu }]);
                true
            }
            None => false,
        }
    }

    /// Takes the responses and confirmations the client has sent to `id`.
    pub fn take_client_pdus(&self, id: &DeviceId) -> Vec<Vec<u8>> {
        self.lock()
            .devices
            .get_mut(id)
            .map(|d| std::mem::take(&mut d.client_pdus))
            .unwrap_or_default()
    }

    /// The server side value of the characteristic `uuid` on `id`.
    pub fn value(&self, id: &DeviceId, uuid: Uuid) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let device = state.devices.get_mut(id)?;
        let handle = device.value_handle(uuid)?;
        device.attribute_mut(handle).map(|a| a.value.clone())
    }

    /// The number of ATT requests `id` has received.
    pub fn request_count(&self, id: &DeviceId) -> usize {
        self.lock().devices.get(id).map(|d| d.requests).unwrap_or(0)
    }

    /// Whether `id` has a link.
    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.lock().devices.get(id).map(|d| d.link.is_some()).unwrap_or(false)
    }

    /// Whether the client is scanning.
    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }
}

fn unavailable(power: PowerState) -> Error {
    Error::with_message(ErrorKind::AdapterUnavailable, format!("controller {power}"))
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&self, sink: EventSink) -> Result<()> {
        self.lock().sink = Some(sink);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.lock();
        state.sink = None;
        state.scanning = false;
        state.pending.clear();
        let ids: Vec<DeviceId> = state.links.values().copied().collect();
        for id in ids {
            state.unlink(&id);
        }
    }

    fn power_state(&self) -> PowerState {
        self.lock().power
    }

    async fn start_scan(&self, _services: &[Uuid], _allow_duplicates: bool) -> Result<()> {
        let events: Vec<_> = {
            let mut state = self.lock();
            if !state.power.is_powered_on() {
                return Err(unavailable(state.power));
            }
            state.scanning = true;
            let mut ids: Vec<DeviceId> = state.devices.keys().copied().collect();
            ids.sort();
            ids.iter().filter_map(|id| state.advertisement(id)).collect()
        };
        self.deliver(events);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let event = {
            let mut state = self.lock();
            if !state.power.is_powered_on() {
                return Err(unavailable(state.power));
            }
            if state.devices.get(id).map(|d| d.link.is_some()).unwrap_or(false) {
                return Err(Error::with_message(ErrorKind::ConnectionFailed, format!("{id} already has a link")));
            }
            state.pending.insert(*id);
            state.establish(id)
        };
        self.deliver(event);
        Ok(())
    }

    async fn cancel_connect(&self, id: &DeviceId) -> Result<()> {
        self.lock().pending.remove(id);
        Ok(())
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
        let unlinked = {
            let mut state = self.lock();
            match state.links.get(&handle).copied() {
                Some(id) => state.unlink(&id),
                None => None,
            }
        };
        match unlinked {
            Some(handle) => {
                self.deliver([TransportEvent::Disconnected {
                    handle,
                    reason: DisconnectReason::LocalHostTerminated,
                }]);
                Ok(())
            }
            None => Err(Error::with_message(ErrorKind::NotConnected, format!("no link {handle}"))),
        }
    }

    async fn send(&self, handle: ConnectionHandle, pdu: Vec<u8>) -> Result<()> {
        let response = {
            let mut state = self.lock();
            let Some(id) = state.links.get(&handle).copied() else {
                return Err(Error::with_message(ErrorKind::NotConnected, format!("no link {handle}")));
            };
            let Some(device) = state.devices.get_mut(&id) else {
                return Err(Error::with_message(ErrorKind::NotConnected, format!("no link {handle}")));
            };
            if device.unresponsive {
                if pdu.first().and_then(|&raw| Opcode::try_from(raw).ok()).map(Opcode::is_request) == Some(true) {
                    device.requests += 1;
                }
                trace!("sim: {} ignoring {}", id, crate::util::hex(&pdu));
                None
            } else {
                device.serve(&pdu)
            }
        };
        if let Some(response) = response {
            self.deliver([TransportEvent::AttPdu {
                handle,
                pdu: response.encode(),
            }]);
        }
        Ok(())
    }

    fn supports_mtu_exchange(&self) -> bool {
        self.lock().mtu_exchange_allowed
    }
}

impl std::fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SimulatedTransport")
            .field("power", &state.power)
            .field("scanning", &state.scanning)
            .field("peripherals", &state.devices.len())
            .field("links", &state.links.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btuuid::{characteristics, services};

    fn device() -> SimDevice {
        let peripheral = SimPeripheral::new(DeviceId([1, 2, 3, 4, 5, 6])).service(
            SimService::new(services::BATTERY).characteristic(
                SimCharacteristic::new(characteristics::BATTERY_LEVEL)
                    .readable()
                    .notify()
                    .value([90]),
            ),
        );
        let db = build_database(&peripheral.services);
        SimDevice {
            peripheral,
            db,
            present: true,
            unresponsive: false,
            reject_connections: false,
            link: None,
            mtu: DEFAULT_MTU,
            prepared: Vec::new(),
            requests: 0,
            client_pdus: Vec::new(),
        }
    }

    #[test]
    fn attribute_table_layout() {
        let device = device();
        let handles: Vec<_> = device.db.iter().map(|a| (a.handle, a.kind)).collect();
        assert_eq!(
            handles,
            [
                (1, AttributeKind::Service),
                (2, AttributeKind::Declaration),
                (3, AttributeKind::Value),
                (4, AttributeKind::Descriptor),
            ]
        );
        assert_eq!(device.db[0].group_end, 4);
        let declaration = CharacteristicDeclaration::parse(&device.db[1].value).unwrap();
        assert_eq!(declaration.value_handle, 3);
        assert_eq!(declaration.properties, 0x12);
    }

    #[test]
    fn server_answers_requests() {
        let mut device = device();
        let read = Pdu::ReadRequest { handle: 3 }.encode();
        assert_eq!(device.serve(&read), Some(Pdu::ReadResponse { value: vec![90] }));
        let write = Pdu::WriteRequest { handle: 3, value: vec![1] }.encode();
        assert_eq!(device.serve(&write), Some(Pdu::error(Opcode::WriteRequest, 3, AttErrorCode::WriteNotPermitted)));
        let missing = Pdu::ReadRequest { handle: 9 }.encode();
        assert_eq!(device.serve(&missing), Some(Pdu::error(Opcode::ReadRequest, 9, AttErrorCode::InvalidHandle)));
        assert_eq!(device.requests, 3);
    }

    #[test]
    fn client_configuration_gates_notifications() {
        let mut device = device();
        assert_eq!(device.client_configuration(3), 0);
        device.serve(&Pdu::WriteRequest { handle: 4, value: vec![1, 0] }.encode());
        assert_eq!(device.client_configuration(3), 1);
        device.reset_link_state();
        assert_eq!(device.client_configuration(3), 0);
    }
}
