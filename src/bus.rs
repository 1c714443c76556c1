//! Link state bus: one channel per endpoint with replay-latest on subscribe.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::model::LinkEvent;

struct Channel {
    endpoint_id: i32,
    latest: bool,
    subscribers: Vec<(Uuid, mpsc::UnboundedSender<LinkEvent>)>,
}

impl Channel {
    fn current(&self) -> LinkEvent {
        LinkEvent {
            endpoint_id: self.endpoint_id,
            is_linked: self.latest,
        }
    }
}

#[derive(Clone)]
pub struct LinkBus {
    channels: Arc<BTreeMap<i32, Mutex<Channel>>>,
}

impl std::fmt::Debug for LinkBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkBus")
            .field("endpoints", &self.channels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Receiving side of a subscription. Dropping it detaches lazily; use
/// `LinkBus::unsubscribe` to detach right away.
#[derive(Debug)]
pub struct LinkSubscription {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl LinkSubscription {
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<LinkEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl LinkBus {
    /// One channel per endpoint id, seeded with the current link state.
    pub fn new(initial: impl IntoIterator<Item = (i32, bool)>) -> Self {
        let channels = initial
            .into_iter()
            .map(|(endpoint_id, linked)| {
                (
                    endpoint_id,
                    Mutex::new(Channel {
                        endpoint_id,
                        latest: linked,
                        subscribers: Vec::new(),
                    }),
                )
            })
            .collect();
        Self {
            channels: Arc::new(channels),
        }
    }

    /// Queue the current state of every endpoint, then attach. Each channel is
    /// locked while its initial event is queued, so no later event can overtake it.
    pub fn subscribe(&self) -> LinkSubscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        for channel in self.channels.values() {
            let mut channel = channel.lock();
            let _ = tx.send(channel.current());
            channel.subscribers.push((id, tx.clone()));
        }
        debug!(%id, "link bus subscriber attached");
        LinkSubscription { id, rx }
    }

    pub fn unsubscribe(&self, subscription: &LinkSubscription) {
        for channel in self.channels.values() {
            channel
                .lock()
                .subscribers
                .retain(|(id, _)| *id != subscription.id);
        }
        debug!(id = %subscription.id, "link bus subscriber detached");
    }

    pub fn publish(&self, event: LinkEvent) {
        let Some(channel) = self.channels.get(&event.endpoint_id) else {
            debug!(endpoint_id = event.endpoint_id, "link event for unknown endpoint dropped");
            return;
        };
        let mut channel = channel.lock();
        channel.latest = event.is_linked;
        channel.subscribers.retain(|(_, tx)| tx.send(event).is_ok());
    }

    /// Bring the cached state in line with `event`, which was read from
    /// storage. Publishes only when it differs, so a change made by another
    /// process reaches current subscribers. Returns whether it published.
    pub fn refresh(&self, event: LinkEvent) -> bool {
        let Some(channel) = self.channels.get(&event.endpoint_id) else {
            return false;
        };
        let mut channel = channel.lock();
        if channel.latest == event.is_linked {
            return false;
        }
        debug!(
            endpoint_id = event.endpoint_id,
            is_linked = event.is_linked,
            "link state changed outside this process"
        );
        channel.latest = event.is_linked;
        channel.subscribers.retain(|(_, tx)| tx.send(event).is_ok());
        true
    }

    pub fn latest(&self, endpoint_id: i32) -> Option<bool> {
        self.channels.get(&endpoint_id).map(|c| c.lock().latest)
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels
            .values()
            .map(|c| c.lock().subscribers.len())
            .max()
            .unwrap_or(0)
    }
}
