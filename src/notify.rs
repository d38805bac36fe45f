use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource change feed. Calendar views subscribe to the resources they
/// show and re-project when anything arrives.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        let orphaned = match self.channels.get(&resource_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if orphaned {
            // Every receiver is gone.
            self.channels
                .remove_if(&resource_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn subscriber_count(&self, resource_id: &Ulid) -> usize {
        self.channels
            .get(resource_id)
            .map_or(0, |sender| sender.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn deleted(resource_id: Ulid) -> Event {
        Event::BookingDeleted { id: Ulid::new(), resource_id }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = deleted(rid);
        hub.send(rid, &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_resources_are_not_delivered() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let mut rx = hub.subscribe(watched);

        hub.send(Ulid::new(), &deleted(watched));
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send(rid, &deleted(rid));
        assert_eq!(hub.subscriber_count(&rid), 0);
    }

    #[tokio::test]
    async fn dropped_subscribers_release_the_channel() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let rx = hub.subscribe(rid);
        assert_eq!(hub.subscriber_count(&rid), 1);
        drop(rx);

        hub.send(rid, &deleted(rid));
        assert!(hub.channels.get(&rid).is_none());
    }
}
