//! Publish/subscribe abstraction for notifications (mechanics only).
//!
//! The bus is **best-effort**:
//!
//! - **No durability**: a subscriber that connects after a publish never sees it
//! - **No ordering across publishers**
//! - **Not a source of truth**: task and batch records are authoritative
//!
//! Subscriptions are per channel and cancellable. Cancelling (or dropping) a
//! subscription detaches it immediately and has no effect on task delivery.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use crate::event::{Channel, Notification};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// Internal lock poisoning.
    #[error("notification bus poisoned")]
    Poisoned,
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification encoding error: {0}")]
    Encoding(String),
}

/// A live subscription to one channel.
///
/// ## Usage Pattern
///
/// ```ignore
/// let sub = bus.subscribe(&Channel::task(&task_id));
///
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(notification) => render(notification),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
pub struct Subscription {
    channel: Channel,
    receiver: Receiver<Notification>,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(channel: Channel, receiver: Receiver<Notification>) -> Self {
        Self {
            channel,
            receiver,
            canceller: None,
        }
    }

    /// Attach the hook that detaches this subscription from its bus.
    pub fn with_canceller(mut self, canceller: impl FnOnce() + Send + 'static) -> Self {
        self.canceller = Some(Box::new(canceller));
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Block until the next notification is available.
    pub fn recv(&self) -> Result<Notification, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification without blocking.
    pub fn try_recv(&self) -> Result<Notification, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a notification.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Notification, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Detach from the bus now. Same as dropping the subscription.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Channel-addressed notification bus.
///
/// Implementations must be safe to share across threads; publishing from
/// many workers at once is the normal case.
pub trait NotificationBus: Send + Sync {
    /// Deliver to every current subscriber of `channel`.
    fn publish(&self, channel: &Channel, notification: Notification) -> Result<(), BusError>;

    /// Open a live subscription on `channel`.
    fn subscribe(&self, channel: &Channel) -> Subscription;
}

/// Shared, dynamically-dispatched bus handle.
pub type SharedBus = Arc<dyn NotificationBus>;

impl<B> NotificationBus for Arc<B>
where
    B: NotificationBus + ?Sized,
{
    fn publish(&self, channel: &Channel, notification: Notification) -> Result<(), BusError> {
        (**self).publish(channel, notification)
    }

    fn subscribe(&self, channel: &Channel) -> Subscription {
        (**self).subscribe(channel)
    }
}
