//! In-process event fan-out connecting discovery, enrichment and the
//! store consumers.

use tokio::sync::broadcast;

use crate::model::{Device, Network};

/// Everything that moves between the services.
#[derive(Debug, Clone)]
pub enum Event {
    DeviceDiscovered(Device),
    DeviceUpdated(Device),
    NetworkAdded(Network),
}

/// Broadcast bus; every subscriber sees every event published after it
/// subscribed. Slow subscribers drop the oldest events.
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers; with none the event vanishes.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_reaches_all_subscribers() {
        let bus = Bus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let device = Device::new("192.168.1.2".parse().unwrap());
        bus.publish(Event::DeviceDiscovered(device.clone()));

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                Event::DeviceDiscovered(d) => assert_eq!(d.addr, device.addr),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = Bus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(Event::NetworkAdded(Network::new(
            "home",
            "192.168.1.0/24".parse().unwrap(),
        )));
    }
}
