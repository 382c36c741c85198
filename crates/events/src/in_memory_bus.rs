//! In-process fan-out bus over std channels.

use std::convert::Infallible;
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::bus::{EventBus, Subscription};

/// Broadcast bus for a single process (tests, the stdin daemon).
///
/// Subscribers whose receiving end was dropped are pruned on the next publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = Infallible;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        let mut subs = self.subscribers.lock();
        subs.push(tx);
        tracing::trace!(subscribers = subs.len(), "bus subscriber added");
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_each_message() {
        let bus = InMemoryEventBus::<u32>::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();
        bus.publish(8).unwrap();

        assert_eq!(a.drain(), vec![7, 8]);
        assert_eq!(b.drain(), vec![7, 8]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::<u32>::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(1).unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_hide_the_others() {
        let bus = std::sync::Arc::new(InMemoryEventBus::<u32>::new());
        let kept = bus.subscribe();

        let crashed = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                let _subs = bus.subscribers.lock();
                panic!("subscriber crashed while holding the list");
            })
        };
        assert!(crashed.join().is_err());

        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(3).unwrap();
        assert_eq!(kept.try_recv().unwrap(), 3);
    }
}
