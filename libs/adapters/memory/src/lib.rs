//! # Patchbay Memory Adapter
//!
//! A complete [`BrokerAdapter`] that never leaves the process: channels are
//! rows in a map, publishes fan out synchronously to matching subscriptions,
//! and a journal records everything sent. Retention, ttl, and storage
//! settings are stored and diffed but not enforced; this is a
//! contract-faithful stand-in for a broker, not a broker.
//!
//! Intended for tests and dev-mode hosts that want messaging semantics
//! without running an external broker.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use patchbay_core::adapter::{
    message_handler, AdapterError, BrokerAdapter, EnsureOutcome, MessageHandler, RawMessage,
    Subscription, SubscriptionHandle,
};
use patchbay_core::channel::{ChannelConfig, ChannelSettings};
use patchbay_core::config::BrokerConfig;
use patchbay_core::topic::topic_matches;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type SubscriptionMap = Arc<DashMap<u64, (String, MessageHandler)>>;

/// In-process broker. Cheap to construct; share it behind an `Arc` the same
/// way a real driver's connection handle would be shared.
#[derive(Default)]
pub struct MemoryBroker {
    connected: AtomicBool,
    channels: DashMap<String, ChannelSettings>,
    subscriptions: SubscriptionMap,
    next_subscription: AtomicU64,
    next_inbox: AtomicU64,
    journal: Mutex<Vec<(String, Value)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a broker-side channel object exists.
    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Every publish since construction, in order, replies included.
    pub fn published(&self) -> Vec<(String, Value)> {
        self.journal.lock().clone()
    }

    /// Payloads published to exactly `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Value> {
        self.journal
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Publish with a reply inbox attached and return the first reply, the
    /// way a broker client's request call behaves. `None` when no
    /// subscriber replied.
    pub async fn request(&self, topic: &str, data: &Value) -> Option<Value> {
        let inbox = format!("_INBOX.{}", self.next_inbox.fetch_add(1, Ordering::SeqCst));
        let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&captured);
        let handler = message_handler(move |value, _raw| {
            let slot = Arc::clone(&slot);
            async move {
                *slot.lock() = Some(value);
            }
        });
        let subscription = self.subscribe(&inbox, handler).await.ok()?;

        self.dispatch(topic, data.clone(), Some(inbox)).await;

        let reply = captured.lock().take();
        let _ = subscription.unsubscribe().await;
        reply
    }

    async fn dispatch(&self, topic: &str, payload: Value, reply: Option<String>) {
        // Collect before running anything: handlers routinely subscribe or
        // publish back into this broker, and a held map guard would
        // deadlock on the same shard.
        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .iter()
            .filter(|entry| topic_matches(&entry.value().0, topic))
            .map(|entry| entry.value().1.clone())
            .collect();
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        for handler in handlers {
            let raw = RawMessage {
                topic: topic.to_string(),
                reply: reply.clone(),
                payload: Bytes::from(bytes.clone()),
            };
            handler.as_ref()(payload.clone(), raw).await;
        }
    }

    fn require_connection(&self) -> Result<(), AdapterError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("channels", &self.channels.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[async_trait]
impl BrokerAdapter for MemoryBroker {
    async fn connect(&self, config: &BrokerConfig) -> Result<(), AdapterError> {
        config
            .validate()
            .map_err(|err| AdapterError::connection_failed(err.to_string()))?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(url = %config.url, "memory broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        // A dropped connection takes its subscriptions with it.
        self.subscriptions.clear();
        debug!("memory broker disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_channel(&self, channel: &ChannelConfig) -> Result<EnsureOutcome, AdapterError> {
        self.require_connection()?;
        let settings = channel.settings();
        let existing = self
            .channels
            .get(&channel.name)
            .map(|entry| entry.value().clone());
        match existing {
            None => {
                self.channels.insert(channel.name.clone(), settings);
                debug!(channel = %channel.name, "channel created");
                Ok(EnsureOutcome::CREATED)
            }
            Some(live) if live == settings => Ok(EnsureOutcome::UP_TO_DATE),
            Some(_) => {
                self.channels.insert(channel.name.clone(), settings);
                debug!(channel = %channel.name, "channel updated");
                Ok(EnsureOutcome::UPDATED)
            }
        }
    }

    async fn delete_channel(&self, name: &str) -> Result<bool, AdapterError> {
        self.require_connection()?;
        Ok(self.channels.remove(name).is_some())
    }

    async fn publish(&self, topic: &str, data: &Value) -> Result<(), AdapterError> {
        self.require_connection()?;
        if topic.split('.').any(|token| token == "*" || token == ">") {
            return Err(AdapterError::publish_failed(
                topic,
                "wildcard in publish subject",
            ));
        }
        self.journal.lock().push((topic.to_string(), data.clone()));
        self.dispatch(topic, data.clone(), None).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, AdapterError> {
        self.require_connection()?;
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .insert(id, (pattern.to_string(), handler));
        debug!(pattern, id, "subscription added");
        Ok(Box::new(MemorySubscription {
            id,
            pattern: pattern.to_string(),
            subscriptions: Arc::clone(&self.subscriptions),
        }))
    }
}

struct MemorySubscription {
    id: u64,
    pattern: String,
    subscriptions: SubscriptionMap,
}

impl fmt::Debug for MemorySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySubscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn pattern(&self) -> &str {
        &self.pattern
    }

    async fn unsubscribe(&self) -> Result<(), AdapterError> {
        self.subscriptions.remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_core::channel::ChannelOptions;
    use patchbay_core::registry::ChannelRegistry;
    use serde_json::json;
    use std::time::Duration;

    async fn connected() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.connect(&BrokerConfig::new("mem://test")).await.unwrap();
        broker
    }

    fn channel(name: &str, options: ChannelOptions) -> ChannelConfig {
        ChannelRegistry::new().register(name, options).unwrap()
    }

    #[tokio::test]
    async fn test_connect_validates_config() {
        let broker = MemoryBroker::new();
        let err = broker.connect(&BrokerConfig::new("")).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(!broker.is_connected());

        broker.connect(&BrokerConfig::new("mem://test")).await.unwrap();
        assert!(broker.is_connected());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = MemoryBroker::new();
        let config = channel("ticket-changes", ChannelOptions::new());

        assert!(broker.ensure_channel(&config).await.unwrap_err().is_connection_error());
        assert!(broker.delete_channel("ticket-changes").await.unwrap_err().is_connection_error());
        assert!(broker
            .publish("ticket-changes.org-1.5", &json!({}))
            .await
            .unwrap_err()
            .is_connection_error());
        assert!(broker
            .subscribe("ticket-changes.>", message_handler(|_, _| async {}))
            .await
            .unwrap_err()
            .is_connection_error());
    }

    #[tokio::test]
    async fn test_ensure_channel_diffs_settings() {
        let broker = connected().await;
        let config = channel("ticket-changes", ChannelOptions::new());

        assert_eq!(
            broker.ensure_channel(&config).await.unwrap(),
            EnsureOutcome::CREATED
        );
        assert_eq!(
            broker.ensure_channel(&config).await.unwrap(),
            EnsureOutcome::UP_TO_DATE
        );

        let changed = channel(
            "ticket-changes",
            ChannelOptions::new().with_ttl(Duration::from_secs(60)),
        );
        assert_eq!(
            broker.ensure_channel(&changed).await.unwrap(),
            EnsureOutcome::UPDATED
        );
        assert!(broker.has_channel("ticket-changes"));

        assert!(broker.delete_channel("ticket-changes").await.unwrap());
        assert!(!broker.delete_channel("ticket-changes").await.unwrap());
        assert!(!broker.has_channel("ticket-changes"));
    }

    #[tokio::test]
    async fn test_publish_fans_out_by_pattern() {
        let broker = connected().await;
        let wide = Arc::new(Mutex::new(Vec::new()));
        let narrow = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&wide);
        broker
            .subscribe(
                "ticket-changes.>",
                message_handler(move |value, _| {
                    let sink = Arc::clone(&sink);
                    async move { sink.lock().push(value) }
                }),
            )
            .await
            .unwrap();
        let sink = Arc::clone(&narrow);
        let narrow_sub = broker
            .subscribe(
                "ticket-changes.org-1.*",
                message_handler(move |value, _| {
                    let sink = Arc::clone(&sink);
                    async move { sink.lock().push(value) }
                }),
            )
            .await
            .unwrap();

        broker
            .publish("ticket-changes.org-1.5", &json!({"id": 5}))
            .await
            .unwrap();
        broker
            .publish("ticket-changes.org-2.5", &json!({"id": 6}))
            .await
            .unwrap();

        assert_eq!(wide.lock().len(), 2);
        assert_eq!(narrow.lock().as_slice(), [json!({"id": 5})]);
        assert_eq!(broker.published_to("ticket-changes.org-2.5"), vec![json!({"id": 6})]);

        narrow_sub.unsubscribe().await.unwrap();
        broker
            .publish("ticket-changes.org-1.7", &json!({"id": 7}))
            .await
            .unwrap();
        assert_eq!(narrow.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_subjects() {
        let broker = connected().await;
        for topic in ["ticket-changes.>", "ticket-changes.*.5"] {
            let err = broker.publish(topic, &json!({})).await.unwrap_err();
            assert!(!err.is_connection_error(), "{topic}");
        }
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let broker = Arc::new(connected().await);
        let replier = Arc::clone(&broker);
        broker
            .subscribe(
                "echo-events.>",
                message_handler(move |value, raw| {
                    let replier = Arc::clone(&replier);
                    async move {
                        if let Some(reply) = raw.reply {
                            let _ = replier.publish(&reply, &json!({"echo": value})).await;
                        }
                    }
                }),
            )
            .await
            .unwrap();

        let reply = broker.request("echo-events.org-1.1", &json!(42)).await;
        assert_eq!(reply, Some(json!({"echo": 42})));

        let unanswered = broker.request("silent-events.org-1.1", &json!(1)).await;
        assert_eq!(unanswered, None);
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let broker = connected().await;
        broker
            .subscribe("ticket-changes.>", message_handler(|_, _| async {}))
            .await
            .unwrap();

        broker.disconnect().await.unwrap();
        broker.connect(&BrokerConfig::new("mem://test")).await.unwrap();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        broker
            .subscribe(
                "ticket-changes.>",
                message_handler(move |_, _| {
                    let sink = Arc::clone(&sink);
                    async move { *sink.lock() += 1 }
                }),
            )
            .await
            .unwrap();

        broker
            .publish("ticket-changes.org-1.5", &json!({}))
            .await
            .unwrap();
        // Only the post-reconnect subscription fires.
        assert_eq!(*seen.lock(), 1);
    }
}
