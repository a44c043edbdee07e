//! Shared test doubles for control-plane tests.
//!
//! `RecordingAdapter` journals every driver call and simulates broker-side
//! channel state, so registry/publisher/relay tests can assert on exactly
//! what reached the broker. `StaticDirectory` is a canned host directory.
//! These are complete enough for host applications to use in their own
//! tests, so they live in the public API rather than behind `cfg(test)`.

use crate::adapter::{
    AdapterError, BrokerAdapter, EnsureOutcome, MessageHandler, RawMessage, Subscription,
    SubscriptionHandle,
};
use crate::channel::{ChannelConfig, ChannelSettings};
use crate::config::BrokerConfig;
use crate::directory::{Directory, DirectoryError, DirectoryRecord, PrincipalKind, RequestContext};
use crate::topic::topic_matches;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type SubscriptionMap = Arc<DashMap<u64, (String, MessageHandler)>>;

/// An in-process adapter double. Starts disconnected; tests flip it with
/// [`force_connect`](Self::force_connect) or the `connect` call itself.
#[derive(Default)]
pub struct RecordingAdapter {
    connected: AtomicBool,
    channels: DashMap<String, ChannelSettings>,
    ensure_failures: DashSet<String>,
    ensure_calls: AtomicUsize,
    publish_failure: Mutex<Option<String>>,
    published: Mutex<Vec<(String, Value)>>,
    deleted: Mutex<Vec<String>>,
    subscriptions: SubscriptionMap,
    next_subscription: AtomicU64,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Pre-populate broker-side channel state, as if a previous process had
    /// created the channel.
    pub fn seed_channel(&self, name: impl Into<String>, settings: ChannelSettings) {
        self.channels.insert(name.into(), settings);
    }

    /// Make every `ensure_channel` call for `name` fail.
    pub fn fail_ensure(&self, name: impl Into<String>) {
        self.ensure_failures.insert(name.into());
    }

    /// Make the next `publish` call fail with `reason`. One-shot.
    pub fn fail_next_publish(&self, reason: impl Into<String>) {
        *self.publish_failure.lock() = Some(reason.into());
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    /// Every successful publish, in order.
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }

    /// Payloads published to exactly `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Names passed to successful `delete_channel` calls.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Patterns of the currently live subscriptions.
    pub fn subscription_patterns(&self) -> Vec<String> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    /// Hand a message to every subscription whose pattern matches `topic`.
    pub async fn deliver(&self, topic: &str, payload: Value) {
        self.dispatch(topic, payload, None).await;
    }

    /// Like [`deliver`](Self::deliver), with a reply topic set, as a broker
    /// client's request call would.
    pub async fn deliver_request(&self, topic: &str, payload: Value, reply: &str) {
        self.dispatch(topic, payload, Some(reply.to_string())).await;
    }

    async fn dispatch(&self, topic: &str, payload: Value, reply: Option<String>) {
        // Collect first so no map guard is held while handlers run; a
        // handler may subscribe or publish right back into this adapter.
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
}

impl fmt::Debug for RecordingAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingAdapter")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("channels", &self.channels.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[async_trait]
impl BrokerAdapter for RecordingAdapter {
    async fn connect(&self, _config: &BrokerConfig) -> Result<(), AdapterError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_channel(&self, channel: &ChannelConfig) -> Result<EnsureOutcome, AdapterError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        if self.ensure_failures.contains(&channel.name) {
            return Err(AdapterError::channel_failed(
                &channel.name,
                "injected ensure failure",
            ));
        }
        let settings = channel.settings();
        let existing = self
            .channels
            .get(&channel.name)
            .map(|entry| entry.value().clone());
        match existing {
            None => {
                self.channels.insert(channel.name.clone(), settings);
                Ok(EnsureOutcome::CREATED)
            }
            Some(live) if live == settings => Ok(EnsureOutcome::UP_TO_DATE),
            Some(_) => {
                self.channels.insert(channel.name.clone(), settings);
                Ok(EnsureOutcome::UPDATED)
            }
        }
    }

    async fn delete_channel(&self, name: &str) -> Result<bool, AdapterError> {
        if self.channels.remove(name).is_some() {
            self.deleted.lock().push(name.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn publish(&self, topic: &str, data: &Value) -> Result<(), AdapterError> {
        if let Some(reason) = self.publish_failure.lock().take() {
            return Err(AdapterError::publish_failed(topic, reason));
        }
        self.published.lock().push((topic.to_string(), data.clone()));
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, AdapterError> {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .insert(id, (pattern.to_string(), handler));
        Ok(Box::new(RecordingSubscription {
            id,
            pattern: pattern.to_string(),
            subscriptions: Arc::clone(&self.subscriptions),
        }))
    }
}

struct RecordingSubscription {
    id: u64,
    pattern: String,
    subscriptions: SubscriptionMap,
}

impl fmt::Debug for RecordingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSubscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

#[async_trait]
impl Subscription for RecordingSubscription {
    fn pattern(&self) -> &str {
        &self.pattern
    }

    async fn unsubscribe(&self) -> Result<(), AdapterError> {
        self.subscriptions.remove(&self.id);
        Ok(())
    }
}

/// An adapter whose every operation fails, for exercising degraded paths.
/// Reports itself connected so operations are actually attempted.
#[derive(Debug, Default)]
pub struct FailingAdapter;

impl FailingAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerAdapter for FailingAdapter {
    async fn connect(&self, _config: &BrokerConfig) -> Result<(), AdapterError> {
        Err(AdapterError::connection_failed("injected connect failure"))
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn ensure_channel(&self, channel: &ChannelConfig) -> Result<EnsureOutcome, AdapterError> {
        Err(AdapterError::channel_failed(&channel.name, "injected failure"))
    }

    async fn delete_channel(&self, name: &str) -> Result<bool, AdapterError> {
        Err(AdapterError::channel_failed(name, "injected failure"))
    }

    async fn publish(&self, topic: &str, _data: &Value) -> Result<(), AdapterError> {
        Err(AdapterError::publish_failed(topic, "injected failure"))
    }

    async fn subscribe(
        &self,
        pattern: &str,
        _handler: MessageHandler,
    ) -> Result<SubscriptionHandle, AdapterError> {
        Err(AdapterError::subscribe_failed(pattern, "injected failure"))
    }
}

/// Subscription double that records whether it was closed.
#[derive(Debug)]
pub struct TrackingSubscription {
    pattern: String,
    closed: Arc<AtomicBool>,
}

impl TrackingSubscription {
    /// Returns the boxed handle plus the flag its `unsubscribe` sets.
    pub fn new(pattern: impl Into<String>) -> (SubscriptionHandle, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let handle = Box::new(Self {
            pattern: pattern.into(),
            closed: Arc::clone(&closed),
        });
        (handle, closed)
    }
}

#[async_trait]
impl Subscription for TrackingSubscription {
    fn pattern(&self) -> &str {
        &self.pattern
    }

    async fn unsubscribe(&self) -> Result<(), AdapterError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Canned directory: fixed users and organizations, per-permission
/// organization grants, and one-shot lookup-failure injection.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: DashMap<String, DirectoryRecord>,
    organizations: DashMap<String, DirectoryRecord>,
    grants: DashMap<(String, String), Vec<String>>,
    fail_next: AtomicBool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, id: &str) -> Self {
        self.users.insert(id.to_string(), DirectoryRecord::new(id));
        self
    }

    pub fn with_deleted_user(self, id: &str) -> Self {
        self.users
            .insert(id.to_string(), DirectoryRecord::deleted(id, Utc::now()));
        self
    }

    pub fn with_user_record(self, record: DirectoryRecord) -> Self {
        self.users.insert(record.id.clone(), record);
        self
    }

    pub fn with_organization(self, id: &str) -> Self {
        self.organizations
            .insert(id.to_string(), DirectoryRecord::new(id));
        self
    }

    /// Grant `permission` to `user` within `organization`.
    pub fn with_grant(self, user: &str, permission: &str, organization: &str) -> Self {
        self.grants
            .entry((user.to_string(), permission.to_string()))
            .or_default()
            .push(organization.to_string());
        self
    }

    /// Make the next `get_by_id` call fail. One-shot.
    pub fn fail_next_lookup(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn get_by_id(
        &self,
        _ctx: &RequestContext,
        kind: PrincipalKind,
        id: &str,
    ) -> Result<Option<DirectoryRecord>, DirectoryError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DirectoryError::lookup("injected lookup failure"));
        }
        let records = match kind {
            PrincipalKind::User => &self.users,
            PrincipalKind::Organization => &self.organizations,
        };
        Ok(records.get(id).map(|entry| entry.value().clone()))
    }

    async fn permitted_organizations(
        &self,
        _ctx: &RequestContext,
        user: &DirectoryRecord,
        permissions: &[&str],
    ) -> Result<Vec<String>, DirectoryError> {
        // Intersection across permissions: the user must hold every one.
        let mut result: Option<Vec<String>> = None;
        for permission in permissions {
            let orgs: Vec<String> = self
                .grants
                .get(&(user.id.clone(), permission.to_string()))
                .map(|entry| entry.value().clone())
                .unwrap_or_default();
            result = Some(match result {
                None => orgs,
                Some(acc) => acc.into_iter().filter(|org| orgs.contains(org)).collect(),
            });
        }
        let mut orgs = result.unwrap_or_default();
        orgs.sort();
        orgs.dedup();
        Ok(orgs)
    }
}

/// Directory with user lookups only; the permission resolver keeps its
/// default unwired body.
#[derive(Debug, Default)]
pub struct LookupOnlyDirectory {
    users: DashMap<String, DirectoryRecord>,
}

impl LookupOnlyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, id: &str) -> Self {
        self.users.insert(id.to_string(), DirectoryRecord::new(id));
        self
    }
}

#[async_trait]
impl Directory for LookupOnlyDirectory {
    async fn get_by_id(
        &self,
        _ctx: &RequestContext,
        kind: PrincipalKind,
        id: &str,
    ) -> Result<Option<DirectoryRecord>, DirectoryError> {
        match kind {
            PrincipalKind::User => Ok(self.users.get(id).map(|entry| entry.value().clone())),
            PrincipalKind::Organization => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_permitted_organizations_intersects_permissions() {
        let directory = StaticDirectory::new()
            .with_user("u1")
            .with_grant("u1", "canRead", "org-1")
            .with_grant("u1", "canRead", "org-2")
            .with_grant("u1", "canWrite", "org-2");
        let user = DirectoryRecord::new("u1");

        let both = directory
            .permitted_organizations(&RequestContext::empty(), &user, &["canRead", "canWrite"])
            .await
            .unwrap();
        assert_eq!(both, vec!["org-2".to_string()]);

        let read_only = directory
            .permitted_organizations(&RequestContext::empty(), &user, &["canRead"])
            .await
            .unwrap();
        assert_eq!(read_only, vec!["org-1".to_string(), "org-2".to_string()]);
    }

    #[tokio::test]
    async fn test_deliver_respects_patterns() {
        let adapter = RecordingAdapter::new();
        adapter.force_connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = crate::adapter::message_handler(move |value, raw| {
            let sink = sink.clone();
            async move {
                sink.lock().push((raw.topic, value));
            }
        });
        let sub = adapter.subscribe("ticket-changes.org-1.>", handler).await.unwrap();

        adapter.deliver("ticket-changes.org-1.5", json!({"id": 5})).await;
        adapter.deliver("ticket-changes.org-2.5", json!({"id": 6})).await;
        assert_eq!(
            seen.lock().as_slice(),
            [("ticket-changes.org-1.5".to_string(), json!({"id": 5}))]
        );

        sub.unsubscribe().await.unwrap();
        adapter.deliver("ticket-changes.org-1.6", json!({"id": 7})).await;
        assert_eq!(seen.lock().len(), 1);
    }
}
