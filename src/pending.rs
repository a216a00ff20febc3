use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::{Error, Result};

enum Slot<T> {
    Empty,
    Waiting(oneshot::Sender<Result<T>>),
    Resolved,
}

/// Single-slot completion cell bridging an event callback to one awaiting caller.
///
/// At most one [`Waiter`] is registered at a time and it receives exactly one
/// result. Resolving with nobody waiting is a no-op, since the caller may have
/// given up. Resolving an operation that was already resolved is reported as
/// [`Error::DoubleResolution`].
pub struct PendingOperation<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Default for PendingOperation<T> {
    fn default() -> Self {
        PendingOperation::new()
    }
}

impl<T> PendingOperation<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Stores a new waiter. Fails if a live waiter is already registered.
    ///
    /// A waiter whose future was dropped counts as abandoned and is replaced.
    pub fn register(&self) -> Result<Waiter<T>> {
        let mut slot = self.slot.lock().unwrap();

        if let Slot::Waiting(sender) = &*slot {
            if !sender.is_closed() {
                return Err(Error::AlreadyPending);
            }
            log::debug!("Replacing an abandoned waiter");
        }

        let (sender, receiver) = oneshot::channel();
        *slot = Slot::Waiting(sender);

        Ok(Waiter { receiver })
    }

    /// Whether a live waiter is registered.
    pub fn is_waiting(&self) -> bool {
        matches!(&*self.slot.lock().unwrap(), Slot::Waiting(sender) if !sender.is_closed())
    }

    pub fn resolve(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    pub fn reject(&self, error: Error) -> Result<()> {
        self.complete(Err(error))
    }

    /// Drops the registered waiter, if any, without resolving it.
    pub fn abandon(&self) {
        *self.slot.lock().unwrap() = Slot::Empty;
    }

    fn complete(&self, result: Result<T>) -> Result<()> {
        let mut slot = self.slot.lock().unwrap();

        match mem::replace(&mut *slot, Slot::Resolved) {
            Slot::Waiting(sender) => {
                if sender.send(result).is_err() {
                    log::debug!("Waiter went away before the operation completed");
                }
                Ok(())
            }
            Slot::Empty => {
                *slot = Slot::Empty;
                Ok(())
            }
            Slot::Resolved => {
                log::error!("Pending operation resolved more than once");
                Err(Error::DoubleResolution)
            }
        }
    }
}

/// The awaiting side of a [`PendingOperation`].
///
/// Resolves to [`Error::Closed`] if the operation is dropped unresolved.
pub struct Waiter<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for Waiter<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
