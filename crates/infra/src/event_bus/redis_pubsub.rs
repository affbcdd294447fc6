//! Redis pub/sub notification bus (optional).
//!
//! Redis pub/sub is fire-and-forget, which matches the bus contract: a
//! subscriber that is not connected when an event is published never sees
//! it. Channel names are prefixed so several deployments can share a server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use redis::Commands;
use tracing::{debug, warn};

use fairq_events::{BusError, Channel, Notification, NotificationBus, Subscription};

/// How often a subscriber thread wakes up to notice cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RedisPubSubNotificationBus {
    client: redis::Client,
    prefix: String,
}

impl RedisPubSubNotificationBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    fn redis_channel(&self, channel: &Channel) -> String {
        format!("{}:events:{}", self.prefix, channel.name())
    }
}

impl NotificationBus for RedisPubSubNotificationBus {
    fn publish(&self, channel: &Channel, notification: Notification) -> Result<(), BusError> {
        let payload = serde_json::to_string(&notification).map_err(|e| BusError::Encoding(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let _: i64 = conn
            .publish(self.redis_channel(channel), payload)
            .map_err(|e| BusError::Transport(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self, channel: &Channel) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let client = self.client.clone();
        let redis_channel = self.redis_channel(channel);
        let flag = cancelled.clone();

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = %redis_channel, error = %e, "subscriber could not connect");
                    return;
                }
            };
            if let Err(e) = conn.set_read_timeout(Some(CANCEL_POLL)) {
                warn!(channel = %redis_channel, error = %e, "subscriber could not set read timeout");
                return;
            }

            let mut pubsub = conn.as_pubsub();
            if pubsub.subscribe(&redis_channel).is_err() {
                return;
            }

            while !flag.load(Ordering::Relaxed) {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => {
                        debug!(channel = %redis_channel, error = %e, "subscriber connection closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let notification: Notification = match serde_json::from_str(&payload) {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(channel = %redis_channel, error = %e, "skipping undecodable notification");
                        continue;
                    }
                };

                if tx.send(notification).is_err() {
                    return;
                }
            }
        });

        Subscription::new(channel.clone(), rx).with_canceller(move || {
            cancelled.store(true, Ordering::Relaxed);
        })
    }
}
