use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use stream_cancel::{Trigger, Valved};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Hook = Box<dyn FnOnce() + Send>;

struct Shared<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    valve: Mutex<Option<Trigger>>,
    on_terminate: Mutex<Option<Hook>>,
}

impl<T> Shared<T> {
    /// Closes the channel. With `cut` set, values still buffered are discarded.
    fn terminate(&self, cut: bool) {
        self.sender.lock().unwrap().take();

        if cut {
            // Dropping the trigger closes the valve.
            self.valve.lock().unwrap().take();
        }

        let hook = self.on_terminate.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Opens a live-value channel.
///
/// `on_terminate` runs exactly once, on whichever comes first: the producer
/// finishing, the consumer closing, or the consumer being dropped.
pub fn channel<T: Send + 'static>(
    on_terminate: impl FnOnce() + Send + 'static,
) -> (Producer<T>, Notifications<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();

    let stream: Pin<Box<dyn Stream<Item = T> + Send>> =
        Box::pin(UnboundedReceiverStream::new(receiver));
    let (trigger, stream) = Valved::new(stream);

    let shared = Arc::new(Shared {
        sender: Mutex::new(Some(sender)),
        valve: Mutex::new(Some(trigger)),
        on_terminate: Mutex::new(Some(Box::new(on_terminate))),
    });

    (
        Producer {
            shared: shared.clone(),
        },
        Notifications { stream, shared },
    )
}

/// Feeding side of a channel.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Producer<T> {
    /// Delivers a value. Returns false if the channel is already terminated.
    pub fn send(&self, value: T) -> bool {
        match self.shared.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    /// Ends the stream after the values already sent have been read.
    pub fn finish(&self) {
        self.shared.terminate(false);
    }

    pub fn is_finished(&self) -> bool {
        self.shared.sender.lock().unwrap().is_none()
    }
}

/// Consuming side of a channel. Once it ends it never yields again.
pub struct Notifications<T> {
    stream: Valved<Pin<Box<dyn Stream<Item = T> + Send>>>,
    shared: Arc<Shared<T>>,
}

impl<T> Notifications<T> {
    /// Stops the stream immediately, discarding anything not yet read.
    pub fn close(&mut self) {
        self.shared.terminate(true);
    }
}

impl<T> Stream for Notifications<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<T> Drop for Notifications<T> {
    fn drop(&mut self) {
        self.shared.terminate(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_channel() -> (Producer<u32>, Notifications<u32>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let (producer, notifications) = channel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (producer, notifications, fired)
    }

    #[tokio::test]
    async fn finish_drains_then_ends() {
        let (producer, mut values, fired) = counting_channel();

        assert!(producer.send(1));
        assert!(producer.send(2));
        producer.finish();

        assert!(!producer.send(3));
        assert_eq!(values.next().await, Some(1));
        assert_eq!(values.next().await, Some(2));
        assert_eq!(values.next().await, None);
        assert_eq!(values.next().await, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_cuts_the_stream() {
        let (producer, mut values, fired) = counting_channel();

        producer.send(1);
        values.close();

        assert_eq!(values.next().await, None);
        assert!(producer.is_finished());
        assert!(!producer.send(2));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_consumer_fires_hook_once() {
        let (producer, values, fired) = counting_channel();

        drop(values);
        producer.finish();
        producer.finish();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_termination_fires_hook_once() {
        for _ in 0..100 {
            let (producer, values, fired) = counting_channel();
            let other = producer.clone();

            let finisher = std::thread::spawn(move || other.finish());
            let dropper = std::thread::spawn(move || drop(values));
            producer.finish();

            finisher.join().unwrap();
            dropper.join().unwrap();

            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }
}
