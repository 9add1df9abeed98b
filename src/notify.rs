use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const FIREHOSE_CAPACITY: usize = 4096;

/// Broadcast hub for committed events, per accommodation plus one firehose
/// carrying everything. Delivery to end users happens elsewhere; this only
/// fans events out in-process.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(FIREHOSE_CAPACITY).0,
        }
    }

    /// Subscribe to one accommodation's events. Creates the channel if needed.
    pub fn subscribe(&self, accommodation_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(accommodation_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(&event.accommodation_id()) {
            let _ = sender.send(event.clone());
        }
        let _ = self.firehose.send(event.clone());
    }

    /// Drop an accommodation's channel once its last period is gone.
    pub fn remove(&self, accommodation_id: &Ulid) {
        self.channels.remove(accommodation_id);
    }
}
