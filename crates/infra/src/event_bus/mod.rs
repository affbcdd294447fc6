//! Notification publishing for the queue components.
//!
//! The bus abstraction lives in `fairq-events`; this module wires it to the
//! queue's channels and provides the Redis-backed implementation.

use tracing::warn;

use fairq_core::{BatchId, SharedClock, TenantId, UserId};
use fairq_events::{BatchEvent, Channel, Notification, SharedBus, TaskEvent};

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubNotificationBus;

/// Publishes task and batch events to their channels.
///
/// Publishing is best-effort: a failure is logged and never propagated to
/// the operation that caused the event.
#[derive(Clone)]
pub struct Notifier {
    bus: SharedBus,
    clock: SharedClock,
}

impl core::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(bus: SharedBus, clock: SharedClock) -> Self {
        Self { bus, clock }
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    /// Publish on `task:{id}` and `user:{tenant}:{user}`.
    pub fn task(&self, tenant_id: &TenantId, user_id: &UserId, event: TaskEvent) {
        let task_channel = Channel::task(event.task_id());
        let user_channel = Channel::user(tenant_id, user_id);
        let notification = Notification::task(tenant_id.clone(), self.clock.now(), event);

        self.publish(&task_channel, notification.clone());
        self.publish(&user_channel, notification);
    }

    /// Publish on `batch:{id}`.
    pub fn batch(&self, tenant_id: &TenantId, batch_id: &BatchId, event: BatchEvent) {
        let notification = Notification::batch(tenant_id.clone(), self.clock.now(), event);
        self.publish(&Channel::batch(batch_id), notification);
    }

    fn publish(&self, channel: &Channel, notification: Notification) {
        if let Err(e) = self.bus.publish(channel, notification) {
            warn!(channel = %channel, error = %e, "failed to publish notification");
        }
    }
}
