//! Process-wide broadcast-channel registry: the only process-wide mutable
//! state in the engine, a single shared map guarded by an async mutex with
//! no re-entrancy.
//!
//! A `dashmap`-keyed subscriber table would be the lock-free alternative, but
//! registration here is explicitly non-re-entrant, so a plain
//! `tokio::sync::Mutex<HashMap<..>>` is enough.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, Mutex};

use crate::protocol::Action;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL: OnceLock<Arc<BroadcastRegistry>> = OnceLock::new();

/// The process-wide registry every [`crate::connection::Connection`] shares.
/// There is exactly one instance per process: broadcasts published on one
/// connection must reach subscribers registered through any other.
pub fn global() -> Arc<BroadcastRegistry> {
    GLOBAL.get_or_init(|| Arc::new(BroadcastRegistry::new())).clone()
}

/// Bounded inbox size for a single connection's broadcast subscription.
const INBOX_CAPACITY: usize = 64;

#[derive(Default)]
pub struct BroadcastRegistry {
    channels: Mutex<HashMap<String, HashMap<u64, mpsc::Sender<Action>>>>,
}

/// A single connection's subscription to a named broadcast channel.
pub struct Subscription {
    id: u64,
    channel: String,
    pub rx: mpsc::Receiver<Action>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.channels.lock().await.entry(channel.clone()).or_default().insert(id, tx);
        Subscription { id, channel, rx }
    }

    pub async fn unsubscribe(&self, sub: &Subscription) {
        self.unsubscribe_by_id(&sub.channel, sub.id).await;
    }

    /// Same as [`Self::unsubscribe`] without holding on to the `Subscription`
    /// itself, for a caller (e.g. a closing `Connection`) that only kept the
    /// channel name and subscriber id around.
    pub async fn unsubscribe_by_id(&self, channel: &str, id: u64) {
        let mut channels = self.channels.lock().await;
        if let Some(subs) = channels.get_mut(channel) {
            subs.remove(&id);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Deliver `action` to every current subscriber of `channel`. Delivery
    /// is best-effort: a full inbox silently drops the broadcast for that
    /// subscriber rather than blocking the publisher, and a channel with no
    /// subscribers at all is a silent no-op.
    pub async fn publish(&self, channel: &str, action: Action) {
        let channels = self.channels.lock().await;
        let Some(subs) = channels.get(channel) else {
            return;
        };
        for tx in subs.values() {
            let _ = tx.try_send(action.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let registry = BroadcastRegistry::new();
        let mut sub = registry.subscribe("news").await;
        registry.publish("news", Action::Ping { send_time: 1 }).await;
        let received = sub.rx.recv().await.unwrap();
        assert!(matches!(received, Action::Ping { send_time: 1 }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_noop() {
        let registry = BroadcastRegistry::new();
        registry.publish("nobody-listening", Action::Ping { send_time: 1 }).await;
    }

    #[tokio::test]
    async fn unsubscribe_by_id_stops_delivery_without_the_subscription_handle() {
        let registry = BroadcastRegistry::new();
        let sub = registry.subscribe("news").await;
        let (channel, id) = (sub.channel().to_string(), sub.id());
        registry.unsubscribe_by_id(&channel, id).await;
        registry.publish(&channel, Action::Ping { send_time: 1 }).await;
        // No subscribers left; nothing to assert beyond "did not panic".
    }

    #[test]
    fn global_returns_the_same_instance_every_call() {
        assert!(Arc::ptr_eq(&global(), &global()));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let registry = BroadcastRegistry::new();
        let sub = registry.subscribe("news").await;
        registry.unsubscribe(&sub).await;
        registry.publish("news", Action::Ping { send_time: 1 }).await;
        // No subscribers left; nothing to assert beyond "did not panic".
    }
}
