//! # Event bus for broadcasting runtime events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that provides
//! non-blocking publishing from the scheduler, its result loop and the roster.
//!
//! ```text
//! Publishers:                          Receivers:
//!   submit / cancel ──┐
//!   result loop     ──┼──► Bus ──┬──► subscriber listener ──► SubscriberSet
//!   roster dispatch ──┘          └──► TaskScheduler::subscribe() (raw)
//! ```
//!
//! Publishing never blocks. The ring buffer keeps the most recent `capacity` events;
//! a receiver that falls behind sees `RecvError::Lagged(n)` and skips `n` of them.
//! Events sent while nobody listens are dropped.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events.
///
/// Cheap to clone; every clone publishes into the same channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus holding up to `capacity` events (at least 1), shared by all receivers.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Event>(capacity);
        Self { tx }
    }

    /// Publishes to every current receiver; dropped when there are none.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Independent receiver of events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Receivers currently subscribed.
    pub fn receivers(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn late_receivers_miss_earlier_events() {
        let bus = Bus::new(0);
        bus.publish(Event::new(EventKind::TaskQueued));
        let mut rx = bus.subscribe();
        assert_eq!(bus.receivers(), 1);
        bus.publish(Event::new(EventKind::LoadChanged).with_load(3));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::LoadChanged);
        assert_eq!(ev.load, Some(3));
    }
}
