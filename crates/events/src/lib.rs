//! Task and batch notifications, plus the best-effort bus that carries them.
//!
//! Notifications are never the source of truth: the queue and batch stores
//! are. The bus only exists so observers do not have to poll.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BusError, NotificationBus, SharedBus, Subscription};
pub use event::{BatchEvent, Channel, Event, Notification, TaskEvent};
pub use in_memory_bus::InMemoryNotificationBus;
