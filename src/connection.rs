//! One ATT bearer to a connected peripheral.
//!
//! ATT allows a single outstanding request per bearer and responses carry no transaction id, so every request
//! goes through the [`RequestQueue`] and is matched to its response by opcode. The discovery caches of a link
//! live here as well and die with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::async_util::{timeout, DoneSignal, QueueGuard, RequestQueue};
use crate::att::{self, CharacteristicDeclaration, DecodeError, Opcode, Pdu, DEFAULT_MTU, MAX_MTU};
use crate::btuuid::attributes;
use crate::characteristic::CharacteristicInner;
use crate::config::AdapterConfig;
use crate::descriptor::DescriptorInner;
use crate::dispatch::{Event, Job, JobQueue};
use crate::error::{AttError, AttErrorCode, ErrorKind};
use crate::service::ServiceInner;
use crate::transport::{ConnectionHandle, Transport};
use crate::util::{defer, hex};
use crate::{BluetoothUuidExt, Characteristic, DeviceId, Error, Result, Uuid};

type Reply = Result<Pdu>;

struct PendingRequest {
    request: Opcode,
    reply: async_channel::Sender<Reply>,
}

pub(crate) struct Connection {
    pub device: DeviceId,
    pub handle: ConnectionHandle,
    transport: Arc<dyn Transport>,
    jobs: JobQueue,
    config: AdapterConfig,
    mtu: AtomicU16,
    mtu_exchanged: AtomicBool,
    bearer: RequestQueue,
    pending: Mutex<Option<PendingRequest>>,
    abandoned: Mutex<Option<async_channel::Receiver<Reply>>>,
    closed: DoneSignal,
    services: async_lock::Mutex<Option<Vec<Arc<ServiceInner>>>>,
    by_value_handle: Mutex<HashMap<u16, Arc<CharacteristicInner>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn unexpected(pdu: &Pdu) -> Error {
    Error::with_message(
        ErrorKind::Protocol(AttError::Known(AttErrorCode::InvalidPdu)),
        format!("unexpected {:?}", pdu.opcode()),
    )
}

fn malformed(what: &str) -> Error {
    Error::with_message(ErrorKind::Protocol(AttError::Known(AttErrorCode::InvalidPdu)), what)
}

fn is_attribute_not_found(err: &Error) -> bool {
    err.att_error() == Some(AttError::Known(AttErrorCode::AttributeNotFound))
}

impl Connection {
    pub fn new(
        device: DeviceId,
        handle: ConnectionHandle,
        transport: Arc<dyn Transport>,
        jobs: JobQueue,
        config: AdapterConfig,
    ) -> Self {
        let bearer = RequestQueue::new(config.max_queued_requests);
        Connection {
            device,
            handle,
            transport,
            jobs,
            config,
            mtu: AtomicU16::new(DEFAULT_MTU),
            mtu_exchanged: AtomicBool::new(false),
            bearer,
            pending: Mutex::new(None),
            abandoned: Mutex::new(None),
            closed: DoneSignal::new(),
            services: async_lock::Mutex::new(None),
            by_value_handle: Mutex::new(HashMap::new()),
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_signalled()
    }

    pub fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::with_message(ErrorKind::NotConnected, format!("{} is not connected", self.device)))
        } else {
            Ok(())
        }
    }

    /// Resolves once the link has been torn down.
    pub async fn wait_closed(&self) {
        self.closed.wait().await
    }

    /// Tears down all per-link state. Runs exactly once per link.
    pub fn close(&self) {
        if self.closed.is_signalled() {
            return;
        }
        self.closed.signal();
        self.bearer.close();
        if let Some(pending) = lock(&self.pending).take() {
            debug!("failing in-flight {:?} on {}", pending.request, self.device);
            let _ = pending
                .reply
                .try_send(Err(Error::with_message(ErrorKind::TransportLost, "link closed")));
        }
        lock(&self.abandoned).take();
        let characteristics: Vec<_> = lock(&self.by_value_handle).drain().map(|(_, c)| c).collect();
        for characteristic in characteristics {
            characteristic.close();
        }
        if let Some(mut services) = self.services.try_lock() {
            services.take();
        }
    }

    async fn acquire(&self) -> Result<QueueGuard<'_>> {
        self.check_open()?;
        self.bearer.acquire().await
    }

    /// Sends a single request and waits for its response.
    pub async fn request(&self, pdu: Pdu) -> Result<Pdu> {
        let _bearer = self.acquire().await?;
        self.exchange(pdu).await
    }

    /// Sends `pdu` and waits for the matching response. The caller must own the bearer.
    async fn exchange(&self, pdu: Pdu) -> Result<Pdu> {
        self.drain_abandoned().await;
        if self.is_closed() {
            return Err(Error::with_message(ErrorKind::TransportLost, "link closed"));
        }

        let request = pdu.opcode();
        let (tx, rx) = async_channel::bounded(1);
        *lock(&self.pending) = Some(PendingRequest { request, reply: tx });
        if self.is_closed() {
            lock(&self.pending).take();
            return Err(Error::with_message(ErrorKind::TransportLost, "link closed"));
        }

        // If this future is dropped or times out, the next request must first absorb the late response.
        let stale = rx.clone();
        let abandon = defer(move || *lock(&self.abandoned) = Some(stale));

        trace!("{} <- {:?}", self.device, pdu);
        if let Err(err) = self.transport.send(self.handle, pdu.encode()).await {
            abandon.defuse();
            lock(&self.pending).take();
            return Err(err);
        }

        match timeout(self.config.request_timeout, rx.recv()).await {
            Some(Ok(reply)) => {
                abandon.defuse();
                reply
            }
            Some(Err(_)) => {
                abandon.defuse();
                Err(Error::with_message(ErrorKind::TransportLost, "link closed"))
            }
            None => {
                warn!("{:?} to {} timed out", request, self.device);
                Err(Error::with_message(
                    ErrorKind::Timeout,
                    format!("no response to {:?} after {:?}", request, self.config.request_timeout),
                ))
            }
        }
    }

    async fn drain_abandoned(&self) {
        let Some(stale) = lock(&self.abandoned).take() else {
            return;
        };
        let restore = stale.clone();
        let guard = defer(move || *lock(&self.abandoned) = Some(restore));
        match timeout(self.config.request_timeout, stale.recv()).await {
            Some(Ok(reply)) => debug!("discarded late response {:?} from {}", reply, self.device),
            Some(Err(_)) => {}
            None => warn!("abandoned request to {} never completed", self.device),
        }
        guard.defuse();
        lock(&self.pending).take();
    }

    pub(crate) fn handle_pdu(self: &Arc<Self>, bytes: Vec<u8>) {
        let pdu = match Pdu::decode(&bytes) {
            Ok(pdu) => pdu,
            Err(DecodeError::UnknownOpcode(raw)) if self.is_peer_request(raw) => {
                self.reject(raw);
                return;
            }
            Err(err) => {
                warn!("malformed PDU from {}: {} ({})", self.device, err, hex(&bytes));
                self.fail_pending(bytes.first().copied(), err);
                return;
            }
        };
        trace!("{} -> {:?}", self.device, pdu);

        match pdu {
            Pdu::HandleValueNotification { handle, value } => self.handle_value(handle, value, false),
            Pdu::HandleValueIndication { handle, value } => self.handle_value(handle, value, true),
            Pdu::WriteCommand { .. } | Pdu::HandleValueConfirmation => {
                debug!("ignoring {:?} from {}", pdu.opcode(), self.device)
            }
            pdu if pdu.opcode().is_request() => self.reject(pdu.opcode() as u8),
            pdu => self.handle_response(pdu),
        }
    }

    fn is_peer_request(&self, raw: u8) -> bool {
        !att::is_command(raw) && Opcode::try_from(raw).map(Opcode::is_request).unwrap_or(true)
    }

    /// Answers a request from the peer. There is no local GATT server.
    fn reject(&self, request: u8) {
        debug!("rejecting request 0x{:02x} from {}", request, self.device);
        let pdu = Pdu::ErrorResponse {
            request,
            handle: 0,
            error: AttError::Known(AttErrorCode::RequestNotSupported),
        };
        self.jobs.submit(Job::Send {
            handle: self.handle,
            pdu: pdu.encode(),
        });
    }

    fn handle_response(&self, pdu: Pdu) {
        let mut pending = lock(&self.pending);
        let matches = match (pending.as_ref(), &pdu) {
            (None, _) => {
                debug!("discarding unsolicited {:?} from {}", pdu.opcode(), self.device);
                return;
            }
            (Some(p), Pdu::ErrorResponse { request, .. }) => *request == p.request as u8,
            (Some(p), pdu) => pdu.opcode().request() == Some(p.request),
        };
        if !matches {
            warn!("unexpected {:?} from {}", pdu.opcode(), self.device);
            return;
        }
        if let Some(p) = pending.take() {
            let reply = match pdu {
                Pdu::ErrorResponse { request, handle, error } => Err(Error::with_message(
                    ErrorKind::Protocol(error),
                    format!("request 0x{request:02x} on handle 0x{handle:04x}"),
                )),
                pdu => Ok(pdu),
            };
            let _ = p.reply.try_send(reply);
        }
    }

    fn fail_pending(&self, raw: Option<u8>, err: DecodeError) {
        let mut pending = lock(&self.pending);
        let responds = |p: &PendingRequest| {
            raw == Some(Opcode::ErrorResponse as u8)
                || raw
                    .and_then(|raw| Opcode::try_from(raw).ok())
                    .and_then(Opcode::request)
                    == Some(p.request)
        };
        if pending.as_ref().map(responds).unwrap_or(false) {
            if let Some(p) = pending.take() {
                let _ = p.reply.try_send(Err(err.into()));
            }
        }
    }

    fn handle_value(self: &Arc<Self>, handle: u16, value: Vec<u8>, indication: bool) {
        if indication {
            self.jobs.submit(Job::Send {
                handle: self.handle,
                pdu: Pdu::HandleValueConfirmation.encode(),
            });
        }
        let characteristic = lock(&self.by_value_handle).get(&handle).cloned();
        let Some(inner) = characteristic else {
            debug!("value for undiscovered handle 0x{:04x} from {}", handle, self.device);
            return;
        };
        inner.set_value(value.clone());
        inner.notifier.send(value.clone());
        self.jobs.emit(Event::ValueUpdated {
            characteristic: Characteristic::new(self.clone(), inner),
            value,
        });
    }

    pub async fn set_mtu(&self, mtu: u16) -> Result<u16> {
        if !self.transport.supports_mtu_exchange() {
            return Err(Error::with_message(
                ErrorKind::NotSupported,
                "the transport does not allow MTU negotiation",
            ));
        }
        self.check_open()?;
        if self.mtu_exchanged.swap(true, Ordering::AcqRel) {
            return Err(Error::with_message(
                ErrorKind::NotSupported,
                "the MTU has already been exchanged on this link",
            ));
        }

        let client = mtu.clamp(DEFAULT_MTU, MAX_MTU);
        let result = match self.request(Pdu::ExchangeMtuRequest { mtu: client }).await {
            Ok(Pdu::ExchangeMtuResponse { mtu: server }) => Ok(client.min(server).max(DEFAULT_MTU)),
            Ok(pdu) => Err(unexpected(&pdu)),
            Err(err) => Err(err),
        };
        match result {
            Ok(negotiated) => {
                self.mtu.store(negotiated, Ordering::Release);
                debug!("MTU for {} is {}", self.device, negotiated);
                Ok(negotiated)
            }
            Err(err) => {
                self.mtu_exchanged.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    pub async fn read_value(&self, handle: u16) -> Result<Vec<u8>> {
        match self.request(Pdu::ReadRequest { handle }).await? {
            Pdu::ReadResponse { value } => Ok(value),
            pdu => Err(unexpected(&pdu)),
        }
    }

    pub async fn read_long_value(&self, handle: u16) -> Result<Vec<u8>> {
        let _bearer = self.acquire().await?;
        let mut value = match self.exchange(Pdu::ReadRequest { handle }).await? {
            Pdu::ReadResponse { value } => value,
            pdu => return Err(unexpected(&pdu)),
        };

        let max = self.config.max_attribute_len;
        let mut fragment = value.len();
        while fragment == usize::from(self.mtu()) - 1 && value.len() < max {
            let offset = u16::try_from(value.len()).map_err(|_| malformed("attribute value too long"))?;
            let chunk = match self.exchange(Pdu::ReadBlobRequest { handle, offset }).await? {
                Pdu::ReadBlobResponse { value } => value,
                pdu => return Err(unexpected(&pdu)),
            };
            if chunk.is_empty() {
                break;
            }
            fragment = chunk.len();
            value.extend_from_slice(&chunk);
        }
        value.truncate(max);
        Ok(value)
    }

    pub async fn write_value(&self, handle: u16, value: &[u8]) -> Result<()> {
        if value.len() > self.config.max_attribute_len {
            return Err(Error::with_message(
                ErrorKind::InvalidParameter,
                format!("{} bytes exceeds the maximum attribute length", value.len()),
            ));
        }
        if value.len() <= usize::from(self.mtu()) - 3 {
            let pdu = Pdu::WriteRequest {
                handle,
                value: value.to_vec(),
            };
            match self.request(pdu).await? {
                Pdu::WriteResponse => Ok(()),
                pdu => Err(unexpected(&pdu)),
            }
        } else {
            self.write_long_value(handle, value).await
        }
    }

    async fn write_long_value(&self, handle: u16, value: &[u8]) -> Result<()> {
        let _bearer = self.acquire().await?;
        let chunk_len = usize::from(self.mtu()) - 5;
        for (i, part) in value.chunks(chunk_len).enumerate() {
            let offset = u16::try_from(i * chunk_len).map_err(|_| malformed("attribute value too long"))?;
            let request = Pdu::PrepareWriteRequest {
                handle,
                offset,
                value: part.to_vec(),
            };
            match self.exchange(request).await {
                Ok(Pdu::PrepareWriteResponse {
                    handle: h,
                    offset: o,
                    value: echo,
                }) if h == handle && o == offset && echo == part => {}
                Ok(pdu) => {
                    warn!("prepared write to {} not echoed intact, cancelling", self.device);
                    self.cancel_prepared().await;
                    return Err(match pdu {
                        Pdu::PrepareWriteResponse { .. } => Error::with_message(
                            ErrorKind::Protocol(AttError::Known(AttErrorCode::UnlikelyError)),
                            format!("prepared write at offset {offset} was corrupted"),
                        ),
                        pdu => unexpected(&pdu),
                    });
                }
                Err(err) => {
                    if err.att_error().is_some() {
                        self.cancel_prepared().await;
                    }
                    return Err(err);
                }
            }
        }
        match self.exchange(Pdu::ExecuteWriteRequest { commit: true }).await? {
            Pdu::ExecuteWriteResponse => Ok(()),
            pdu => Err(unexpected(&pdu)),
        }
    }

    async fn cancel_prepared(&self) {
        if let Err(err) = self.exchange(Pdu::ExecuteWriteRequest { commit: false }).await {
            debug!("cancelling prepared writes on {} failed: {}", self.device, err);
        }
    }

    pub async fn write_command(&self, handle: u16, value: &[u8]) -> Result<()> {
        self.check_open()?;
        let max = usize::from(self.mtu()) - 3;
        if value.len() > max {
            return Err(Error::with_message(
                ErrorKind::InvalidParameter,
                format!("{} bytes exceeds the {} byte write without response limit", value.len(), max),
            ));
        }
        let pdu = Pdu::WriteCommand {
            handle,
            value: value.to_vec(),
        };
        self.transport.send(self.handle, pdu.encode()).await
    }

    /// Primary services of the peer, discovered once per link.
    pub async fn services(&self) -> Result<Vec<Arc<ServiceInner>>> {
        self.check_open()?;
        let mut cache = self.services.lock().await;
        if let Some(services) = cache.as_ref() {
            return Ok(services.clone());
        }
        let services = self.read_services().await?;
        debug!("{} has {} services", self.device, services.len());
        *cache = Some(services.clone());
        Ok(services)
    }

    /// Drops all discovery results. Notification streams of previously discovered characteristics end.
    pub async fn invalidate_cache(&self) {
        self.services.lock().await.take();
        let characteristics: Vec<_> = lock(&self.by_value_handle).drain().map(|(_, c)| c).collect();
        for characteristic in characteristics {
            characteristic.close();
        }
    }

    async fn read_services(&self) -> Result<Vec<Arc<ServiceInner>>> {
        let _bearer = self.acquire().await?;
        let mut services = Vec::new();
        let mut start = 0x0001;
        loop {
            let request = Pdu::ReadByGroupTypeRequest {
                start,
                end: 0xffff,
                group_type: attributes::PRIMARY_SERVICE,
            };
            let entries = match self.exchange(request).await {
                Ok(Pdu::ReadByGroupTypeResponse { entries }) => entries,
                Ok(pdu) => return Err(unexpected(&pdu)),
                Err(err) if is_attribute_not_found(&err) => break,
                Err(err) => return Err(err),
            };

            let mut last = start;
            for entry in entries {
                if entry.handle < start || entry.end_group < entry.handle {
                    return Err(malformed("service handles out of order"));
                }
                let uuid = Uuid::from_le_bytes_slice(&entry.value).ok_or_else(|| malformed("bad service UUID"))?;
                services.push(Arc::new(ServiceInner::new(uuid, entry.handle, entry.end_group)));
                last = entry.end_group;
            }
            if last == 0xffff {
                break;
            }
            start = last + 1;
        }
        Ok(services)
    }

    /// Characteristics of `service`, discovered once per link.
    pub async fn characteristics(&self, service: &Arc<ServiceInner>) -> Result<Vec<Arc<CharacteristicInner>>> {
        self.check_open()?;
        let mut cache = service.characteristics.lock().await;
        if let Some(characteristics) = cache.as_ref() {
            return Ok(characteristics.clone());
        }
        let characteristics = self.read_characteristics(service).await?;
        {
            let mut index = lock(&self.by_value_handle);
            for c in &characteristics {
                index.insert(c.value_handle, c.clone());
            }
        }
        *cache = Some(characteristics.clone());
        Ok(characteristics)
    }

    async fn read_characteristics(&self, service: &Arc<ServiceInner>) -> Result<Vec<Arc<CharacteristicInner>>> {
        let _bearer = self.acquire().await?;
        let mut declarations: Vec<(u16, CharacteristicDeclaration)> = Vec::new();
        let mut start = service.start_handle;
        while start <= service.end_handle {
            let request = Pdu::ReadByTypeRequest {
                start,
                end: service.end_handle,
                attribute_type: attributes::CHARACTERISTIC,
            };
            let entries = match self.exchange(request).await {
                Ok(Pdu::ReadByTypeResponse { entries }) => entries,
                Ok(pdu) => return Err(unexpected(&pdu)),
                Err(err) if is_attribute_not_found(&err) => break,
                Err(err) => return Err(err),
            };

            let mut last = start;
            for (handle, value) in entries {
                if handle < start || handle > service.end_handle {
                    return Err(malformed("characteristic handle outside its service"));
                }
                let declaration = CharacteristicDeclaration::parse(&value)
                    .ok_or_else(|| malformed("bad characteristic declaration"))?;
                declarations.push((handle, declaration));
                last = handle;
            }
            if last >= service.end_handle {
                break;
            }
            start = last + 1;
        }

        let characteristics = declarations
            .iter()
            .enumerate()
            .map(|(i, (handle, declaration))| {
                let end = declarations
                    .get(i + 1)
                    .map(|(next, _)| next - 1)
                    .unwrap_or(service.end_handle);
                Arc::new(CharacteristicInner::new(
                    service,
                    *handle,
                    declaration,
                    end,
                    self.config.notification_capacity,
                ))
            })
            .collect();
        Ok(characteristics)
    }

    /// Descriptors of `characteristic`, discovered once per link.
    pub async fn descriptors(&self, characteristic: &Arc<CharacteristicInner>) -> Result<Vec<Arc<DescriptorInner>>> {
        self.check_open()?;
        let mut cache = characteristic.descriptors.lock().await;
        if let Some(descriptors) = cache.as_ref() {
            return Ok(descriptors.clone());
        }
        let descriptors = self.read_descriptors(characteristic).await?;
        *cache = Some(descriptors.clone());
        Ok(descriptors)
    }

    async fn read_descriptors(&self, characteristic: &Arc<CharacteristicInner>) -> Result<Vec<Arc<DescriptorInner>>> {
        let mut descriptors = Vec::new();
        if characteristic.value_handle >= characteristic.end_handle {
            return Ok(descriptors);
        }

        let _bearer = self.acquire().await?;
        let end = characteristic.end_handle;
        let mut start = characteristic.value_handle + 1;
        loop {
            let entries = match self.exchange(Pdu::FindInformationRequest { start, end }).await {
                Ok(Pdu::FindInformationResponse { entries }) => entries,
                Ok(pdu) => return Err(unexpected(&pdu)),
                Err(err) if is_attribute_not_found(&err) => break,
                Err(err) => return Err(err),
            };

            let mut last = start;
            for (handle, uuid) in entries {
                if handle < start || handle > end {
                    return Err(malformed("descriptor handle outside its characteristic"));
                }
                descriptors.push(Arc::new(DescriptorInner::new(characteristic, handle, uuid)));
                last = handle;
            }
            if last >= end {
                break;
            }
            start = last + 1;
        }
        Ok(descriptors)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.device)
            .field("handle", &self.handle)
            .field("mtu", &self.mtu())
            .field("closed", &self.is_closed())
            .finish()
    }
}
