use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use futures_lite::FutureExt;
use futures_timer::Delay;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// Resolves to `None` if `fut` does not complete within `duration`.
pub async fn timeout<T>(duration: Duration, fut: impl Future<Output = T>) -> Option<T> {
    async { Some(fut.await) }
        .or(async {
            Delay::new(duration).await;
            None
        })
        .await
}

/// Serializes access to a shared resource in FIFO order with a bounded number of waiters.
///
/// Ownership is handed directly from the releasing guard to the next waiter, so a caller arriving while others
/// are queued can never overtake them.
pub struct RequestQueue {
    max_waiting: usize,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    held: bool,
    closed: bool,
    waiters: VecDeque<async_channel::Sender<()>>,
}

/// Exclusive ownership of a [`RequestQueue`]. Passes ownership on when dropped.
pub struct QueueGuard<'a> {
    queue: &'a RequestQueue,
}

struct Waiter<'a> {
    queue: &'a RequestQueue,
    receiver: async_channel::Receiver<()>,
    granted: bool,
}

impl RequestQueue {
    pub fn new(max_waiting: usize) -> Self {
        RequestQueue {
            max_waiting,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Waits for exclusive ownership.
    ///
    /// Fails with [`Busy`][ErrorKind::Busy] if `max_waiting` callers are already queued, or with
    /// [`TransportLost`][ErrorKind::TransportLost] if the queue is closed while waiting.
    pub async fn acquire(&self) -> Result<QueueGuard<'_>> {
        let mut waiter = {
            let mut state = self.lock();
            if state.closed {
                return Err(ErrorKind::NotConnected.into());
            }
            if !state.held {
                state.held = true;
                return Ok(QueueGuard { queue: self });
            }
            state.waiters.retain(|tx| !tx.is_closed());
            if state.waiters.len() >= self.max_waiting {
                return Err(Error::with_message(
                    ErrorKind::Busy,
                    format!("{} requests already queued", state.waiters.len()),
                ));
            }
            let (tx, rx) = async_channel::bounded(1);
            state.waiters.push_back(tx);
            Waiter {
                queue: self,
                receiver: rx,
                granted: false,
            }
        };

        match waiter.receiver.recv().await {
            Ok(()) => {
                waiter.granted = true;
                Ok(QueueGuard { queue: self })
            }
            Err(_) => Err(ErrorKind::TransportLost.into()),
        }
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
    }

    /// The number of callers waiting for ownership.
    #[cfg(test)]
    pub fn waiting(&self) -> usize {
        self.lock().waiters.iter().filter(|tx| !tx.is_closed()).count()
    }

    fn release(&self) {
        let mut state = self.lock();
        while let Some(tx) = state.waiters.pop_front() {
            if tx.try_send(()).is_ok() {
                return;
            }
        }
        state.held = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        // Ownership may have been handed over after the waiting future was abandoned.
        self.receiver.close();
        if self.receiver.try_recv().is_ok() {
            self.queue.release();
        }
    }
}

/// A one-shot signal that any number of tasks can wait for.
#[derive(Debug, Clone)]
pub struct DoneSignal {
    sender: async_channel::Sender<()>,
    receiver: async_channel::Receiver<()>,
}

impl DoneSignal {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::bounded(1);
        DoneSignal { sender, receiver }
    }

    pub fn signal(&self) {
        self.sender.close();
    }

    pub fn is_signalled(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn wait(&self) {
        let _ = self.receiver.recv().await;
    }
}

impl Default for DoneSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// An overflowing broadcast channel that stays open while it has no receivers.
pub struct Broadcaster<T: Clone> {
    sender: Sender<T>,
    _keep_open: InactiveReceiver<T>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        sender.set_await_active(false);
        Broadcaster {
            sender,
            _keep_open: receiver.deactivate(),
        }
    }

    /// A new receiver that sees every value sent from now on.
    pub fn subscribe(&self) -> Receiver<T> {
        self.sender.new_receiver()
    }

    /// Sends `value` to all receivers, dropping the oldest queued value of any receiver that is full.
    pub fn send(&self, value: T) {
        let _ = self.sender.try_broadcast(value);
    }

    /// Ends every receiver's stream once it has drained.
    pub fn close(&self) {
        self.sender.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_lite::future::block_on;
    use futures_lite::StreamExt;

    use super::*;

    #[test]
    fn queue_is_fifo_and_bounded() {
        let queue = Arc::new(RequestQueue::new(1));
        let first = block_on(queue.acquire()).unwrap();

        let (order_tx, order_rx) = async_channel::unbounded();
        let second = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let _guard = block_on(queue.acquire()).unwrap();
                order_tx.send_blocking(2).unwrap();
            })
        };
        while queue.waiting() == 0 {
            std::thread::yield_now();
        }

        let err = block_on(queue.acquire()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Busy);

        drop(first);
        second.join().unwrap();
        assert_eq!(order_rx.try_recv(), Ok(2));
        assert!(block_on(queue.acquire()).is_ok());
    }

    #[test]
    fn abandoned_waiter_passes_ownership_on() {
        let queue = RequestQueue::new(4);
        let guard = block_on(queue.acquire()).unwrap();
        {
            let mut fut = Box::pin(queue.acquire());
            assert!(block_on(futures_lite::future::poll_once(&mut fut)).is_none());
            drop(guard);
        }
        assert!(block_on(queue.acquire()).is_ok());
    }

    #[test]
    fn closed_queue_fails_waiters() {
        let queue = Arc::new(RequestQueue::new(4));
        let guard = block_on(queue.acquire()).unwrap();
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || block_on(queue.acquire()).map(|_| ()).map_err(|e| e.kind()))
        };
        while queue.waiting() == 0 {
            std::thread::yield_now();
        }
        queue.close();
        assert_eq!(waiter.join().unwrap(), Err(ErrorKind::TransportLost));
        drop(guard);
        assert_eq!(
            block_on(queue.acquire()).err().map(|e| e.kind()),
            Some(ErrorKind::NotConnected)
        );
    }

    #[test]
    fn timeout_expires() {
        let res = block_on(timeout(Duration::from_millis(10), futures_lite::future::pending::<()>()));
        assert!(res.is_none());
        assert_eq!(block_on(timeout(Duration::from_secs(1), async { 5 })), Some(5));
    }

    #[test]
    fn broadcaster_overflows_and_closes() {
        let broadcaster = Broadcaster::new(2);
        broadcaster.send(0);
        let mut rx = broadcaster.subscribe();
        for i in 1..=3 {
            broadcaster.send(i);
        }
        broadcaster.close();
        let values: Vec<i32> = block_on((&mut rx).collect());
        assert_eq!(values, [2, 3]);
    }

    #[test]
    fn done_signal() {
        let done = DoneSignal::new();
        assert!(!done.is_signalled());
        done.signal();
        assert!(done.is_signalled());
        block_on(done.clone().wait());
    }
}
