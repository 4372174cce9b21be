//! The central-role state machine.
//!
//! The [`Adapter`] owns the registry of known peripherals and the per-peripheral link state. All state lives
//! behind one lock that is never held across an `await` or a call into the [`Transport`], which lets transports
//! deliver events inline from inside their own methods.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_core::Stream;
use futures_lite::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::async_util::{timeout, DoneSignal};
use crate::config::AdapterConfig;
use crate::connection::Connection;
use crate::device::ConnectionState;
use crate::dispatch::{Dispatcher, Event, Handler, HandlerId, Job};
use crate::error::ErrorKind;
use crate::transport::{ConnectionHandle, EventSink, PowerState, Transport, TransportEvent};
use crate::util::defer;
use crate::{AdvertisementData, AdvertisingDevice, Characteristic, Device, DeviceId, Error, Result, Uuid};

enum Link {
    Idle,
    Connecting(async_channel::Sender<Result<()>>),
    Connected(Arc<Connection>),
    Disconnecting(Arc<Connection>),
}

struct PeripheralRecord {
    name: Option<String>,
    rssi: Option<i16>,
    adv_data: Option<AdvertisementData>,
    link: Link,
}

impl PeripheralRecord {
    fn new() -> Self {
        PeripheralRecord {
            name: None,
            rssi: None,
            adv_data: None,
            link: Link::Idle,
        }
    }
}

struct ScanState {
    services: Vec<Uuid>,
    allow_duplicates: bool,
    seen: HashSet<DeviceId>,
}

struct CentralState {
    closed: bool,
    power: PowerState,
    scan: Option<ScanState>,
    peripherals: HashMap<DeviceId, PeripheralRecord>,
    connections: HashMap<ConnectionHandle, Arc<Connection>>,
    all_disconnected: DoneSignal,
}

pub(crate) struct AdapterInner {
    this: Weak<AdapterInner>,
    transport: Arc<dyn Transport>,
    config: AdapterConfig,
    dispatcher: Dispatcher,
    state: Mutex<CentralState>,
}

impl AdapterInner {
    fn lock(&self) -> MutexGuard<'_, CentralState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn device(&self, id: DeviceId) -> Device {
        Device::new(id, self.this.clone())
    }

    pub(crate) fn connection(&self, id: &DeviceId) -> Result<Arc<Connection>> {
        match self.lock().peripherals.get(id).map(|r| &r.link) {
            Some(Link::Connected(conn)) => Ok(conn.clone()),
            _ => Err(Error::with_message(ErrorKind::NotConnected, format!("{id} is not connected"))),
        }
    }

    pub(crate) fn connection_state(&self, id: &DeviceId) -> ConnectionState {
        match self.lock().peripherals.get(id).map(|r| &r.link) {
            None | Some(Link::Idle) => ConnectionState::Disconnected,
            Some(Link::Connecting(_)) => ConnectionState::Connecting,
            Some(Link::Connected(_)) => ConnectionState::Connected,
            Some(Link::Disconnecting(_)) => ConnectionState::Disconnecting,
        }
    }

    pub(crate) fn peripheral_name(&self, id: &DeviceId) -> Option<String> {
        self.lock().peripherals.get(id)?.name.clone()
    }

    pub(crate) fn peripheral_rssi(&self, id: &DeviceId) -> Option<i16> {
        self.lock().peripherals.get(id)?.rssi
    }

    pub(crate) fn peripheral_advertisement(&self, id: &DeviceId) -> Option<AdvertisementData> {
        self.lock().peripherals.get(id)?.adv_data.clone()
    }

    pub(crate) fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PowerStateChanged(power) => self.set_power(power),
            TransportEvent::Advertisement { id, rssi, data } => self.advertisement(id, rssi, data),
            TransportEvent::Connected { id, handle } => self.connected(id, handle),
            TransportEvent::ConnectFailed { id, error } => {
                self.abort_connect(&id, error, false);
            }
            TransportEvent::Disconnected { handle, reason } => {
                let conn = self.lock().connections.get(&handle).cloned();
                match conn {
                    Some(conn) => self.teardown(&conn, reason.to_error()),
                    None => debug!("disconnection of unknown link {}", handle),
                }
            }
            TransportEvent::AttPdu { handle, pdu } => {
                let conn = self.lock().connections.get(&handle).cloned();
                match conn {
                    Some(conn) => conn.handle_pdu(pdu),
                    None => debug!("PDU for unknown link {}", handle),
                }
            }
        }
    }

    fn set_power(&self, power: PowerState) {
        let (connections, attempts) = {
            let mut state = self.lock();
            if state.power == power {
                return;
            }
            info!("adapter {}", power);
            state.power = power;
            if power.is_powered_on() {
                (Vec::new(), Vec::new())
            } else {
                state.scan = None;
                let connections: Vec<_> = state.connections.values().cloned().collect();
                let attempts: Vec<_> = state
                    .peripherals
                    .iter()
                    .filter(|(_, r)| matches!(r.link, Link::Connecting(_)))
                    .map(|(id, _)| *id)
                    .collect();
                (connections, attempts)
            }
        };

        self.dispatcher.emit(Event::StateChanged(power));
        for conn in connections {
            self.teardown(
                &conn,
                Some(Error::with_message(ErrorKind::TransportLost, format!("adapter {power}"))),
            );
        }
        for id in attempts {
            let error = Error::with_message(ErrorKind::AdapterUnavailable, format!("adapter {power}"));
            self.abort_connect(&id, error, false);
        }
    }

    fn advertisement(&self, id: DeviceId, rssi: Option<i16>, data: AdvertisementData) {
        let report = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(scan) = state.scan.as_mut() else {
                trace!("advertisement from {} while not scanning", id);
                return;
            };
            if !data.matches_services(&scan.services) {
                return;
            }
            let first = scan.seen.insert(id);
            let allow_duplicates = scan.allow_duplicates;

            let record = state.peripherals.entry(id).or_insert_with(PeripheralRecord::new);
            record.rssi = rssi;
            if data.local_name.is_some() {
                record.name = data.local_name.clone();
            }
            record.adv_data = Some(data.clone());
            first || allow_duplicates
        };

        if report {
            self.dispatcher.emit(Event::PeripheralDiscovered(AdvertisingDevice {
                device: self.device(id),
                adv_data: data,
                rssi,
            }));
        }
    }

    fn connected(&self, id: DeviceId, handle: ConnectionHandle) {
        let established = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.peripherals.get_mut(&id) {
                Some(record) if matches!(record.link, Link::Connecting(_)) => {
                    let conn = Arc::new(Connection::new(
                        id,
                        handle,
                        self.transport.clone(),
                        self.dispatcher.queue().clone(),
                        self.config.clone(),
                    ));
                    let previous = std::mem::replace(&mut record.link, Link::Connected(conn.clone()));
                    // A queued signal from the previous teardown must not release this link's waiters.
                    if state.connections.is_empty() {
                        state.all_disconnected = DoneSignal::new();
                    }
                    state.connections.insert(handle, conn);
                    match previous {
                        Link::Connecting(waiter) => Some(waiter),
                        _ => None,
                    }
                }
                _ => None,
            }
        };

        match established {
            Some(waiter) => {
                info!("connected to {} on link {}", id, handle);
                let _ = waiter.try_send(Ok(()));
                self.dispatcher.emit(Event::PeripheralConnected {
                    device: self.device(id),
                    error: None,
                });
            }
            None => {
                warn!("unexpected connection to {}, disconnecting", id);
                self.dispatcher.submit(Job::Disconnect(handle));
            }
        }
    }

    /// Ends a pending connection attempt with `error`. Returns `false` if `id` was not connecting.
    fn abort_connect(&self, id: &DeviceId, error: Error, cancel: bool) -> bool {
        let waiter = {
            let mut state = self.lock();
            match state.peripherals.get_mut(id) {
                Some(record) if matches!(record.link, Link::Connecting(_)) => {
                    match std::mem::replace(&mut record.link, Link::Idle) {
                        Link::Connecting(waiter) => Some(waiter),
                        _ => None,
                    }
                }
                _ => None,
            }
        };
        let Some(waiter) = waiter else {
            return false;
        };

        warn!("connecting to {} failed: {}", id, error);
        let _ = waiter.try_send(Err(error.clone()));
        if cancel {
            self.dispatcher.submit(Job::CancelConnect(*id));
        }
        self.dispatcher.emit(Event::PeripheralConnected {
            device: self.device(*id),
            error: Some(error),
        });
        true
    }

    /// The single path by which a link goes away, whoever initiated it.
    fn teardown(&self, conn: &Arc<Connection>, error: Option<Error>) {
        let (error, done) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.connections.remove(&conn.handle).is_none() {
                return;
            }
            let mut error = error;
            if let Some(record) = state.peripherals.get_mut(&conn.device) {
                if matches!(record.link, Link::Disconnecting(_)) {
                    error = None;
                }
                record.link = Link::Idle;
            }
            let done = state.connections.is_empty().then(|| state.all_disconnected.clone());
            (error, done)
        };

        conn.close();
        match &error {
            None => info!("disconnected from {}", conn.device),
            Some(err) => warn!("lost connection to {}: {}", conn.device, err),
        }
        self.dispatcher.emit(Event::PeripheralDisconnected {
            device: self.device(conn.device),
            error,
        });
        if let Some(done) = done {
            self.dispatcher.submit(Job::Signal(done));
        }
    }

    fn check_available(&self, state: &CentralState) -> Result<()> {
        if state.closed {
            Err(Error::with_message(ErrorKind::AdapterUnavailable, "the adapter has been closed"))
        } else if !state.power.is_powered_on() {
            Err(Error::with_message(ErrorKind::AdapterUnavailable, format!("adapter {}", state.power)))
        } else {
            Ok(())
        }
    }
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

/// A Bluetooth adapter in the LE Central role, driving a [`Transport`].
///
/// Cloning an `Adapter` yields another handle to the same adapter.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

impl Adapter {
    /// Creates an adapter on top of `transport` and starts its dispatch thread.
    ///
    /// The transport is not opened until [`open`][Self::open] is called, so handlers registered in between see
    /// every event.
    pub fn new(transport: impl Transport, config: AdapterConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let dispatcher = Dispatcher::spawn(transport.clone(), config.event_capacity)?;
        let inner = Arc::new_cyclic(|this| AdapterInner {
            this: this.clone(),
            transport,
            config,
            dispatcher,
            state: Mutex::new(CentralState {
                closed: false,
                power: PowerState::Unknown,
                scan: None,
                peripherals: HashMap::new(),
                connections: HashMap::new(),
                all_disconnected: DoneSignal::new(),
            }),
        });
        Ok(Adapter { inner })
    }

    /// Opens the transport and picks up its current power state.
    pub async fn open(&self) -> Result<()> {
        let sink = EventSink::new(Arc::downgrade(&self.inner));
        self.inner.transport.open(sink).await?;
        self.inner.set_power(self.inner.transport.power_state());
        Ok(())
    }

    /// The configuration this adapter was created with.
    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// The controller's power state.
    pub fn state(&self) -> PowerState {
        self.inner.lock().power
    }

    /// Whether a scan is in progress.
    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scan.is_some()
    }

    /// Asynchronously blocks until the adapter is powered on.
    ///
    /// Fails with [`AdapterUnavailable`][ErrorKind::AdapterUnavailable] if the adapter is closed first.
    pub async fn wait_available(&self) -> Result<()> {
        let mut events = self.inner.dispatcher.subscribe();
        if self.state().is_powered_on() {
            return Ok(());
        }
        while let Some(event) = events.next().await {
            if let Event::StateChanged(PowerState::PoweredOn) = event {
                return Ok(());
            }
        }
        Err(Error::with_message(ErrorKind::AdapterUnavailable, "the adapter has been closed"))
    }

    /// A stream of every [`Event`] generated from now on.
    ///
    /// The stream is delivered after the registered handlers have run. If it falls behind by more than
    /// [`event_capacity`][AdapterConfig::event_capacity] events the oldest are dropped. The stream ends when the
    /// adapter is closed.
    pub fn events(&self) -> impl Stream<Item = Event> + Send + Unpin + 'static {
        self.inner.dispatcher.subscribe()
    }

    /// Starts scanning for advertisements.
    ///
    /// Each advertising peripheral produces an [`Event::PeripheralDiscovered`] the first time it is seen, or for
    /// every advertisement if `allow_duplicates` is set. If `services` is not empty, only advertisements listing
    /// at least one of them are reported. Starting a scan while one is running replaces its parameters.
    pub async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<()> {
        {
            let mut state = self.inner.lock();
            self.inner.check_available(&state)?;
            state.scan = Some(ScanState {
                services: services.to_vec(),
                allow_duplicates,
                seen: HashSet::new(),
            });
        }
        debug!("starting scan for {:?}", services);
        if let Err(err) = self.inner.transport.start_scan(services, allow_duplicates).await {
            self.inner.lock().scan = None;
            return Err(err);
        }
        Ok(())
    }

    /// Stops scanning. Does nothing if no scan is running.
    pub async fn stop_scan(&self) -> Result<()> {
        if self.inner.lock().scan.take().is_none() {
            return Ok(());
        }
        debug!("stopping scan");
        self.inner.transport.stop_scan().await
    }

    /// Gets a handle to the device at `id`, adding it to the registry if it has not been seen.
    pub fn open_device(&self, id: &DeviceId) -> Device {
        self.inner
            .lock()
            .peripherals
            .entry(*id)
            .or_insert_with(PeripheralRecord::new);
        self.inner.device(*id)
    }

    /// All peripherals in the registry.
    pub fn peripherals(&self) -> Vec<Device> {
        let mut ids: Vec<DeviceId> = self.inner.lock().peripherals.keys().copied().collect();
        ids.sort();
        ids.into_iter().map(|id| self.inner.device(id)).collect()
    }

    /// All connected peripherals.
    pub fn connected_devices(&self) -> Vec<Device> {
        let mut ids: Vec<DeviceId> = self.inner.lock().connections.values().map(|c| c.device).collect();
        ids.sort();
        ids.into_iter().map(|id| self.inner.device(id)).collect()
    }

    /// Removes a peripheral from the registry.
    ///
    /// Fails with [`Busy`][ErrorKind::Busy] unless the device is disconnected.
    pub fn remove_device(&self, device: &Device) -> Result<()> {
        let mut state = self.inner.lock();
        let idle = match state.peripherals.get(&device.id) {
            None => return Ok(()),
            Some(record) => matches!(record.link, Link::Idle),
        };
        if !idle {
            return Err(Error::with_message(ErrorKind::Busy, format!("{} is not disconnected", device.id)));
        }
        state.peripherals.remove(&device.id);
        Ok(())
    }

    /// Connects to the [`Device`].
    ///
    /// Returns once the link is up, or fails with [`Timeout`][ErrorKind::Timeout] after
    /// [`connect_timeout`][AdapterConfig::connect_timeout]. Either way an [`Event::PeripheralConnected`] is
    /// generated. Succeeds immediately if the device is already connected. Fails with
    /// [`AlreadyConnecting`][ErrorKind::AlreadyConnecting] while another attempt on the same device is pending, and
    /// with [`Cancelled`][ErrorKind::Cancelled] if the attempt is cancelled with
    /// [`cancel_connection`][Self::cancel_connection].
    pub async fn connect_device(&self, device: &Device) -> Result<()> {
        let inner = &self.inner;
        let id = device.id;
        let (tx, rx) = async_channel::bounded(1);
        {
            let mut state = inner.lock();
            inner.check_available(&state)?;
            let record = state.peripherals.entry(id).or_insert_with(PeripheralRecord::new);
            match &record.link {
                Link::Idle => record.link = Link::Connecting(tx),
                Link::Connecting(_) => {
                    return Err(Error::with_message(
                        ErrorKind::AlreadyConnecting,
                        format!("already connecting to {id}"),
                    ))
                }
                Link::Connected(_) => return Ok(()),
                Link::Disconnecting(_) => {
                    return Err(Error::with_message(ErrorKind::Busy, format!("{id} is disconnecting")))
                }
            }
        }

        debug!("connecting to {}", id);
        let abandon = defer(|| {
            inner.abort_connect(&id, Error::with_message(ErrorKind::Cancelled, "connect abandoned"), true);
        });

        if let Err(err) = inner.transport.connect(&id).await {
            abandon.defuse();
            inner.abort_connect(&id, err.clone(), false);
            return Err(err);
        }

        let result = timeout(inner.config.connect_timeout, rx.recv()).await;
        abandon.defuse();
        match result {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(Error::with_message(ErrorKind::Cancelled, "connection attempt dropped")),
            None => {
                let error = Error::with_message(
                    ErrorKind::Timeout,
                    format!("no connection to {} after {:?}", id, inner.config.connect_timeout),
                );
                if inner.abort_connect(&id, error.clone(), true) {
                    Err(error)
                } else {
                    // The attempt finished while the timer fired.
                    rx.try_recv().unwrap_or_else(|_| {
                        Err(Error::with_message(ErrorKind::Cancelled, "connection attempt dropped"))
                    })
                }
            }
        }
    }

    /// Cancels a pending connection attempt or disconnects an established link.
    ///
    /// Either way an [`Event::PeripheralDisconnected`] without an error is generated. A pending
    /// [`connect_device`][Self::connect_device] fails with [`Cancelled`][ErrorKind::Cancelled]. If the transport does
    /// not confirm the disconnection within [`disconnect_timeout`][AdapterConfig::disconnect_timeout] the link is
    /// torn down locally. Does nothing if the device is not connected.
    pub async fn cancel_connection(&self, device: &Device) -> Result<()> {
        enum Action {
            Nothing,
            Cancel(async_channel::Sender<Result<()>>),
            Disconnect(Arc<Connection>),
            Wait(Arc<Connection>),
        }

        let inner = &self.inner;
        let id = device.id;
        let action = {
            let mut state = inner.lock();
            match state.peripherals.get_mut(&id) {
                None => Action::Nothing,
                Some(record) => match std::mem::replace(&mut record.link, Link::Idle) {
                    Link::Idle => Action::Nothing,
                    Link::Connecting(waiter) => Action::Cancel(waiter),
                    Link::Connected(conn) => {
                        record.link = Link::Disconnecting(conn.clone());
                        Action::Disconnect(conn)
                    }
                    Link::Disconnecting(conn) => {
                        record.link = Link::Disconnecting(conn.clone());
                        Action::Wait(conn)
                    }
                },
            }
        };

        let conn = match action {
            Action::Nothing => return Ok(()),
            Action::Cancel(waiter) => {
                info!("cancelled connection attempt to {}", id);
                let _ = waiter.try_send(Err(Error::with_message(ErrorKind::Cancelled, "connection cancelled")));
                inner.dispatcher.emit(Event::PeripheralDisconnected {
                    device: inner.device(id),
                    error: None,
                });
                return inner.transport.cancel_connect(&id).await;
            }
            Action::Disconnect(conn) => {
                debug!("disconnecting from {}", id);
                if let Err(err) = inner.transport.disconnect(conn.handle).await {
                    warn!("disconnecting from {} failed: {}", id, err);
                    inner.teardown(&conn, None);
                    return Ok(());
                }
                conn
            }
            Action::Wait(conn) => conn,
        };

        if timeout(inner.config.disconnect_timeout, conn.wait_closed()).await.is_none() {
            warn!("no disconnection from {} after {:?}, closing locally", id, inner.config.disconnect_timeout);
            inner.teardown(&conn, None);
        }
        Ok(())
    }

    /// Asynchronously blocks until no peripheral is connected.
    ///
    /// Resolves immediately if nothing is connected, otherwise once the last link is gone and its
    /// [`Event::PeripheralDisconnected`] has been delivered.
    pub async fn wait_all_disconnected(&self) {
        let done = {
            let state = self.inner.lock();
            if state.connections.is_empty() {
                return;
            }
            state.all_disconnected.clone()
        };
        done.wait().await
    }

    /// Disconnects every peripheral, closes the transport and stops the dispatch thread.
    ///
    /// Event streams end once the events generated up to this point have been delivered. The adapter cannot be
    /// used afterwards.
    pub async fn close(&self) {
        let (scanning, connections, attempts) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let connections: Vec<_> = state.connections.values().cloned().collect();
            for conn in &connections {
                if let Some(record) = state.peripherals.get_mut(&conn.device) {
                    record.link = Link::Disconnecting(conn.clone());
                }
            }
            let attempts: Vec<_> = state
                .peripherals
                .iter()
                .filter(|(_, r)| matches!(r.link, Link::Connecting(_)))
                .map(|(id, _)| *id)
                .collect();
            (state.scan.take().is_some(), connections, attempts)
        };

        if scanning {
            if let Err(err) = self.inner.transport.stop_scan().await {
                debug!("stopping scan failed: {}", err);
            }
        }
        for id in attempts {
            self.inner
                .abort_connect(&id, Error::with_message(ErrorKind::Cancelled, "adapter closed"), true);
        }
        for conn in connections {
            if let Err(err) = self.inner.transport.disconnect(conn.handle).await {
                debug!("disconnecting from {} failed: {}", conn.device, err);
            }
            self.inner.teardown(&conn, None);
        }
        self.inner.transport.close().await;
        self.inner.dispatcher.shutdown();
        info!("adapter closed");
    }

    /// Registers `handler` to run when the controller's power state changes.
    pub fn on_state_changed(&self, handler: impl Fn(PowerState) + Send + Sync + 'static) -> HandlerId {
        self.inner.dispatcher.add_handler(Handler::StateChanged(Arc::new(handler)))
    }

    /// Registers `handler` to run for each reported advertisement.
    pub fn on_peripheral_discovered(
        &self,
        handler: impl Fn(&AdvertisingDevice) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner
            .dispatcher
            .add_handler(Handler::PeripheralDiscovered(Arc::new(handler)))
    }

    /// Registers `handler` to run when a connection attempt finishes. The error is `None` on success.
    pub fn on_peripheral_connected(
        &self,
        handler: impl Fn(&Device, Option<&Error>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner
            .dispatcher
            .add_handler(Handler::PeripheralConnected(Arc::new(handler)))
    }

    /// Registers `handler` to run when a link or connection attempt ends. The error is `None` for orderly and
    /// cancelled disconnections.
    pub fn on_peripheral_disconnected(
        &self,
        handler: impl Fn(&Device, Option<&Error>) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner
            .dispatcher
            .add_handler(Handler::PeripheralDisconnected(Arc::new(handler)))
    }

    /// Registers `handler` to run for each notification or indication.
    pub fn on_value_updated(&self, handler: impl Fn(&Characteristic, &[u8]) + Send + Sync + 'static) -> HandlerId {
        self.inner.dispatcher.add_handler(Handler::ValueUpdated(Arc::new(handler)))
    }

    /// Unregisters a handler. Returns `false` if it was not registered.
    ///
    /// Handlers are called on the dispatch thread, so a handler that keeps a clone of its `Adapter` keeps the
    /// adapter alive until it is removed or the adapter is [closed][Self::close].
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.remove_handler(id)
    }
}

impl PartialEq for Adapter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Adapter {}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Adapter")
            .field("power", &state.power)
            .field("scanning", &state.scan.is_some())
            .field("peripherals", &state.peripherals.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}
