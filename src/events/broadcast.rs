use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Event, EventSink};

const CHANNEL_CAPACITY: usize = 64;

/// Live event feed for stream subscribers.
///
/// Clone-able; every clone publishes to the same channel. Publishing with
/// no subscribers is not an error.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Event>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event and return the number of subscribers reached.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for Broadcaster {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn emit(&self, event: &Event) -> anyhow::Result<()> {
        self.publish(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mode;

    #[test]
    fn test_publish_without_subscribers() {
        let hub = Broadcaster::new();
        assert_eq!(hub.publish(Event::state(Mode::AsideWaitLoss)), 0);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        tokio_test::block_on(async {
            let hub = Broadcaster::new();
            let mut a = hub.subscribe();
            let mut b = hub.subscribe();
            assert_eq!(hub.subscriber_count(), 2);

            tokio_test::assert_ok!(hub.emit(&Event::state(Mode::WaitProfitAfterLoss)).await);
            tokio_test::assert_ok!(hub.emit(&Event::state(Mode::ArmedWaitEntry)).await);

            for rx in [&mut a, &mut b] {
                let first = rx.recv().await.unwrap();
                let second = rx.recv().await.unwrap();
                assert!(matches!(first, Event::State { mode: Mode::WaitProfitAfterLoss, .. }));
                assert!(matches!(second, Event::State { mode: Mode::ArmedWaitEntry, .. }));
            }
        });
    }
}
