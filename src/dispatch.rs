//! Delivery of [`Event`]s to application handlers on a dedicated thread.
//!
//! Everything that must not run on the transport's receive path is queued here as a [`Job`]: application
//! callbacks, and transport calls the engine makes in reaction to inbound traffic. Jobs run strictly in
//! submission order, which keeps the events of any one peripheral in the order they happened.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_broadcast::Receiver;
use futures_lite::future::block_on;
use tracing::{debug, error, trace, warn};

use crate::async_util::{Broadcaster, DoneSignal};
use crate::transport::{ConnectionHandle, PowerState, Transport};
use crate::{AdvertisingDevice, Characteristic, Device, DeviceId, Error, Result};

/// Events generated by an [`Adapter`][crate::Adapter].
#[derive(Debug, Clone)]
pub enum Event {
    /// The controller's power state changed.
    StateChanged(PowerState),
    /// An advertisement was received while scanning.
    PeripheralDiscovered(AdvertisingDevice),
    /// A connection attempt finished. `error` is `None` on success.
    PeripheralConnected {
        /// The peripheral
        device: Device,
        /// Why the attempt failed
        error: Option<Error>,
    },
    /// A connection, or an attempt at one, ended. `error` is `None` for orderly and cancelled disconnections.
    PeripheralDisconnected {
        /// The peripheral
        device: Device,
        /// Why the link was lost
        error: Option<Error>,
    },
    /// A notification or indication was received.
    ValueUpdated {
        /// The characteristic whose value changed
        characteristic: Characteristic,
        /// The new value
        value: Vec<u8>,
    },
}

/// Identifies a registered event handler. See [`Adapter::remove_handler`][crate::Adapter::remove_handler].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

pub(crate) type StateChangedFn = dyn Fn(PowerState) + Send + Sync + 'static;
pub(crate) type DiscoveredFn = dyn Fn(&AdvertisingDevice) + Send + Sync + 'static;
pub(crate) type ConnectionFn = dyn Fn(&Device, Option<&Error>) + Send + Sync + 'static;
pub(crate) type ValueUpdatedFn = dyn Fn(&Characteristic, &[u8]) + Send + Sync + 'static;

pub(crate) enum Handler {
    StateChanged(Arc<StateChangedFn>),
    PeripheralDiscovered(Arc<DiscoveredFn>),
    PeripheralConnected(Arc<ConnectionFn>),
    PeripheralDisconnected(Arc<ConnectionFn>),
    ValueUpdated(Arc<ValueUpdatedFn>),
}

type HandlerList<T> = Vec<(HandlerId, Arc<T>)>;

#[derive(Default)]
struct Handlers {
    state_changed: HandlerList<StateChangedFn>,
    peripheral_discovered: HandlerList<DiscoveredFn>,
    peripheral_connected: HandlerList<ConnectionFn>,
    peripheral_disconnected: HandlerList<ConnectionFn>,
    value_updated: HandlerList<ValueUpdatedFn>,
}

pub(crate) enum Job {
    Emit(Event),
    Send { handle: ConnectionHandle, pdu: Vec<u8> },
    CancelConnect(DeviceId),
    Disconnect(ConnectionHandle),
    Signal(DoneSignal),
}

/// Submits jobs to the dispatch thread.
#[derive(Clone)]
pub(crate) struct JobQueue(async_channel::Sender<Job>);

impl JobQueue {
    pub fn submit(&self, job: Job) {
        if self.0.try_send(job).is_err() {
            debug!("dispatcher stopped, dropping job");
        }
    }

    pub fn emit(&self, event: Event) {
        self.submit(Job::Emit(event))
    }
}

struct Shared {
    handlers: Mutex<Handlers>,
    events: Broadcaster<Event>,
    next_id: AtomicU64,
}

pub(crate) struct Dispatcher {
    jobs: JobQueue,
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn spawn(transport: Arc<dyn Transport>, event_capacity: usize) -> Result<Self> {
        let (sender, receiver) = async_channel::unbounded();
        let shared = Arc::new(Shared {
            handlers: Mutex::new(Handlers::default()),
            events: Broadcaster::new(event_capacity),
            next_id: AtomicU64::new(1),
        });

        let worker = shared.clone();
        std::thread::Builder::new()
            .name("bluegatt-dispatch".into())
            .spawn(move || run(worker, transport, receiver))
            .map_err(|err| Error::with_source(crate::error::ErrorKind::Internal, err))?;

        Ok(Dispatcher {
            jobs: JobQueue(sender),
            shared,
        })
    }

    pub fn queue(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn submit(&self, job: Job) {
        self.jobs.submit(job)
    }

    pub fn emit(&self, event: Event) {
        self.jobs.emit(event)
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn add_handler(&self, handler: Handler) -> HandlerId {
        let id = HandlerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        if self.jobs.0.is_closed() {
            debug!("dispatcher stopped, not registering handler");
            return id;
        }
        let mut handlers = self.shared.lock_handlers();
        match handler {
            Handler::StateChanged(f) => handlers.state_changed.push((id, f)),
            Handler::PeripheralDiscovered(f) => handlers.peripheral_discovered.push((id, f)),
            Handler::PeripheralConnected(f) => handlers.peripheral_connected.push((id, f)),
            Handler::PeripheralDisconnected(f) => handlers.peripheral_disconnected.push((id, f)),
            Handler::ValueUpdated(f) => handlers.value_updated.push((id, f)),
        }
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.shared.lock_handlers();
        let before = handlers.len();
        handlers.state_changed.retain(|(x, _)| *x != id);
        handlers.peripheral_discovered.retain(|(x, _)| *x != id);
        handlers.peripheral_connected.retain(|(x, _)| *x != id);
        handlers.peripheral_disconnected.retain(|(x, _)| *x != id);
        handlers.value_updated.retain(|(x, _)| *x != id);
        handlers.len() != before
    }

    /// Stops the dispatch thread once the queued jobs have run.
    pub fn shutdown(&self) {
        self.jobs.0.close();
    }
}

impl Handlers {
    fn len(&self) -> usize {
        self.state_changed.len()
            + self.peripheral_discovered.len()
            + self.peripheral_connected.len()
            + self.peripheral_disconnected.len()
            + self.value_updated.len()
    }
}

impl Shared {
    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot<T: ?Sized>(&self, select: fn(&Handlers) -> &HandlerList<T>) -> Vec<Arc<T>> {
        let handlers = self.lock_handlers();
        select(&handlers).iter().map(|(_, f)| f.clone()).collect()
    }

    fn emit(&self, event: Event) {
        match &event {
            Event::StateChanged(state) => {
                for f in self.snapshot(|h| &h.state_changed) {
                    guarded("state changed", || f(*state));
                }
            }
            Event::PeripheralDiscovered(adv) => {
                for f in self.snapshot(|h| &h.peripheral_discovered) {
                    guarded("peripheral discovered", || f(adv));
                }
            }
            Event::PeripheralConnected { device, error } => {
                for f in self.snapshot(|h| &h.peripheral_connected) {
                    guarded("peripheral connected", || f(device, error.as_ref()));
                }
            }
            Event::PeripheralDisconnected { device, error } => {
                for f in self.snapshot(|h| &h.peripheral_disconnected) {
                    guarded("peripheral disconnected", || f(device, error.as_ref()));
                }
            }
            Event::ValueUpdated { characteristic, value } => {
                for f in self.snapshot(|h| &h.value_updated) {
                    guarded("value updated", || f(characteristic, value.as_slice()));
                }
            }
        }
        self.events.send(event);
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{} handler panicked", kind);
    }
}

fn run(shared: Arc<Shared>, transport: Arc<dyn Transport>, jobs: async_channel::Receiver<Job>) {
    trace!("dispatch thread started");
    while let Ok(job) = jobs.recv_blocking() {
        match job {
            Job::Emit(event) => shared.emit(event),
            Job::Send { handle, pdu } => {
                if let Err(err) = block_on(transport.send(handle, pdu)) {
                    warn!("sending on link {} failed: {}", handle, err);
                }
            }
            Job::CancelConnect(id) => {
                if let Err(err) = block_on(transport.cancel_connect(&id)) {
                    warn!("cancelling connection to {} failed: {}", id, err);
                }
            }
            Job::Disconnect(handle) => {
                if let Err(err) = block_on(transport.disconnect(handle)) {
                    warn!("disconnecting link {} failed: {}", handle, err);
                }
            }
            Job::Signal(done) => done.signal(),
        }
    }
    shared.events.close();
    // Dropped outside the lock; a handler may own the last adapter reference.
    let handlers = std::mem::take(&mut *shared.lock_handlers());
    drop(handlers);
    debug!("dispatch thread stopped");
}
