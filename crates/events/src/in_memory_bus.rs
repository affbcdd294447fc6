//! In-memory notification bus for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak, mpsc};

use crate::bus::{BusError, NotificationBus, Subscription};
use crate::event::{Channel, Notification};

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<String, Vec<(u64, mpsc::Sender<Notification>)>>,
}

impl Registry {
    fn detach(&mut self, channel: &str, id: u64) {
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                self.channels.remove(channel);
            }
        }
    }
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Best-effort fan-out per channel
/// - Dead receivers are pruned on the next publish
#[derive(Debug, Default)]
pub struct InMemoryNotificationBus {
    registry: Arc<Mutex<Registry>>,
}

impl InMemoryNotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.registry
            .lock()
            .map(|r| r.channels.get(channel.name()).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl NotificationBus for InMemoryNotificationBus {
    fn publish(&self, channel: &Channel, notification: Notification) -> Result<(), BusError> {
        let mut registry = self.registry.lock().map_err(|_| BusError::Poisoned)?;

        if let Some(subs) = registry.channels.get_mut(channel.name()) {
            subs.retain(|(_, tx)| tx.send(notification.clone()).is_ok());
            if subs.is_empty() {
                registry.channels.remove(channel.name());
            }
        }

        Ok(())
    }

    fn subscribe(&self, channel: &Channel) -> Subscription {
        let (tx, rx) = mpsc::channel();

        // A poisoned registry still hands out a subscription; it just never
        // receives anything.
        let id = match self.registry.lock() {
            Ok(mut registry) => {
                registry.next_id += 1;
                let id = registry.next_id;
                registry
                    .channels
                    .entry(channel.name().to_string())
                    .or_default()
                    .push((id, tx));
                Some(id)
            }
            Err(_) => None,
        };

        let subscription = Subscription::new(channel.clone(), rx);
        let Some(id) = id else {
            return subscription;
        };

        let registry: Weak<Mutex<Registry>> = Arc::downgrade(&self.registry);
        let name = channel.name().to_string();
        subscription.with_canceller(move || {
            if let Some(registry) = registry.upgrade() {
                if let Ok(mut registry) = registry.lock() {
                    registry.detach(&name, id);
                }
            }
        })
    }
}
