use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use uuid::Uuid;

use crate::channel::Notifications;
use crate::peripheral::Link;
use crate::service::Profile;

/// One subscribable quantity of a device type.
///
/// The byte layout is device specific; `decode` returns `None` for payloads
/// it cannot make sense of and those are skipped.
pub trait Reading: 'static {
    type Profile: Profile;
    type Value: Send + 'static;

    const CHARACTERISTIC: Uuid;

    fn decode(bytes: &[u8]) -> Option<Self::Value>;
}

/// The service `R` is declared under in its profile, or nil if it is not.
pub(crate) fn required_service<R: Reading>() -> Uuid {
    <R::Profile as Profile>::REQUIRED
        .iter()
        .find(|r| r.characteristics.contains(&R::CHARACTERISTIC))
        .map(|r| r.service)
        .unwrap_or_else(Uuid::nil)
}

enum State {
    Unopened,
    Open(Notifications<Vec<u8>>),
    Ended,
}

/// Stream of decoded values from one characteristic.
///
/// Nothing is requested from the device until the first poll. Once the
/// stream ends it stays ended.
pub struct Readings<R: Reading> {
    link: Arc<Link>,
    state: State,
    _reading: PhantomData<fn() -> R>,
}

impl<R: Reading> Readings<R> {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            state: State::Unopened,
            _reading: PhantomData,
        }
    }

    pub fn characteristic(&self) -> Uuid {
        R::CHARACTERISTIC
    }

    /// Ends the stream and disables notification.
    pub fn close(&mut self) {
        // Dropping the open notifications runs their teardown.
        self.state = State::Ended;
    }
}

impl<R: Reading> Stream for Readings<R> {
    type Item = R::Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R::Value>> {
        let this = self.get_mut();

        if let State::Unopened = this.state {
            this.state = match this.link.open(required_service::<R>(), R::CHARACTERISTIC) {
                Ok(notifications) => State::Open(notifications),
                Err(e) => {
                    log::warn!("Could not subscribe to {}: {}", R::CHARACTERISTIC, e);
                    State::Ended
                }
            };
        }

        let notifications = match &mut this.state {
            State::Open(notifications) => notifications,
            _ => return Poll::Ready(None),
        };

        loop {
            match Pin::new(&mut *notifications).poll_next(cx) {
                Poll::Ready(Some(bytes)) => match R::decode(&bytes) {
                    Some(value) => return Poll::Ready(Some(value)),
                    None => log::trace!("Skipping undecodable value of {}", R::CHARACTERISTIC),
                },
                Poll::Ready(None) => {
                    this.state = State::Ended;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
