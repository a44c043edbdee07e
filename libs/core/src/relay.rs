//! # Subscription Relay
//!
//! ## Purpose
//! Lets untrusted clients consume channel traffic without holding broker
//! credentials. Clients publish requests into the reserved `_MESSAGING`
//! control namespace; the relay gates each request through access control,
//! subscribes on the client's behalf, and forwards matching messages to the
//! client's own inbox topic.
//!
//! ## Request wire format
//! - subscribe: topic `_MESSAGING.subscribe.<channel>.<orgId>[.more]`,
//!   payload `{"userId": "...", "deliverInbox": "..."}`; reply
//!   `{"status":"ok","relayId":"relay-<uuid>"}` or
//!   `{"status":"error","reason":"..."}`.
//! - unsubscribe: topic `_MESSAGING.unsubscribe.<relayId>`, empty payload.
//! - admin: `_MESSAGING.admin.revoke.<userId>` / `.unrevoke.<userId>`.
//!
//! The broker driver is responsible for authenticating the claimed `userId`;
//! by the time a request arrives here it is trusted input from the broker
//! side. Replies go to the request's reply topic when one is set.

use crate::access::{AccessController, DENY_INTERNAL};
use crate::adapter::{message_handler, BrokerAdapter, RawMessage, SubscriptionHandle};
use crate::adapter::AdapterError;
use crate::directory::RequestContext;
use crate::topic::{
    self, ADMIN_PATTERN, RELAY_SUBSCRIBE_PATTERN, RELAY_UNSUBSCRIBE_PATTERN, RESERVED_PREFIX,
};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reply reason for subscribe requests from a revoked user.
pub const REASON_REVOKED: &str = "access revoked";
/// Reply reason for an unsubscribe naming no tracked relay.
pub const REASON_UNKNOWN_RELAY: &str = "Unknown relay";
/// Reply reason for a structurally broken request.
pub const REASON_INVALID_REQUEST: &str = "Invalid request";

/// A parsed control-namespace request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Subscribe {
        channel: String,
        organization_id: String,
        /// Extra tokens narrowing the subscription below the organization.
        rest: Vec<String>,
    },
    Unsubscribe {
        relay_id: String,
    },
    Revoke {
        user_id: String,
    },
    Unrevoke {
        user_id: String,
    },
}

/// Split a reserved-namespace topic into a [`ControlRequest`]. `None` for
/// topics outside the namespace or with too few tokens.
pub fn parse_control_topic(topic: &str) -> Option<ControlRequest> {
    let tokens: Vec<&str> = topic.split('.').collect();
    if tokens.first() != Some(&RESERVED_PREFIX) {
        return None;
    }
    match &tokens[1..] {
        ["subscribe", channel, organization_id, rest @ ..] => Some(ControlRequest::Subscribe {
            channel: channel.to_string(),
            organization_id: organization_id.to_string(),
            rest: rest.iter().map(|token| token.to_string()).collect(),
        }),
        ["unsubscribe", relay_id] => Some(ControlRequest::Unsubscribe {
            relay_id: relay_id.to_string(),
        }),
        ["admin", "revoke", user_id] => Some(ControlRequest::Revoke {
            user_id: user_id.to_string(),
        }),
        ["admin", "unrevoke", user_id] => Some(ControlRequest::Unrevoke {
            user_id: user_id.to_string(),
        }),
        _ => None,
    }
}

/// One client subscription serviced by the relay.
#[derive(Debug, Clone)]
pub struct RelayBinding {
    pub id: String,
    pub channel: String,
    pub user_id: String,
    pub organization_id: String,
    /// The subject the client asked for, `<channel>.<orgId>[.more]`.
    pub topic: String,
    /// Client inbox topic that relayed messages are forwarded to.
    pub deliver_topic: String,
}

impl RelayBinding {
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        topic: impl Into<String>,
        deliver_topic: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("relay-{}", Uuid::new_v4()),
            channel: channel.into(),
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            topic: topic.into(),
            deliver_topic: deliver_topic.into(),
        }
    }
}

#[derive(Debug)]
struct RelayEntry {
    binding: RelayBinding,
    subscription: SubscriptionHandle,
}

/// Bookkeeping for live relays: bindings by relay id, a per-user index for
/// revocation, and the revoked-user set.
///
/// Map guards are never held across awaits; entries are removed from the
/// maps first and their broker subscriptions closed after.
#[derive(Debug, Default)]
pub struct RelayTable {
    relays: DashMap<String, RelayEntry>,
    by_user: DashMap<String, Vec<String>>,
    revoked: DashSet<String>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, binding: RelayBinding, subscription: SubscriptionHandle) {
        self.by_user
            .entry(binding.user_id.clone())
            .or_default()
            .push(binding.id.clone());
        self.relays
            .insert(binding.id.clone(), RelayEntry { binding, subscription });
    }

    /// Tear down one relay. `false` when the id is not tracked.
    pub async fn release(&self, relay_id: &str) -> bool {
        let Some((_, entry)) = self.relays.remove(relay_id) else {
            return false;
        };
        if let Some(mut ids) = self.by_user.get_mut(&entry.binding.user_id) {
            ids.retain(|id| id != relay_id);
        }
        self.by_user
            .remove_if(&entry.binding.user_id, |_, ids| ids.is_empty());
        if let Err(err) = entry.subscription.unsubscribe().await {
            warn!(relay = relay_id, error = %err, "relay unsubscribe failed");
        }
        true
    }

    /// Tear down every relay belonging to `user_id`; returns how many there
    /// were.
    pub async fn release_user(&self, user_id: &str) -> usize {
        let ids = match self.by_user.remove(user_id) {
            Some((_, ids)) => ids,
            None => return 0,
        };
        let mut entries = Vec::new();
        for id in &ids {
            if let Some((_, entry)) = self.relays.remove(id) {
                entries.push(entry);
            }
        }
        let count = entries.len();
        for entry in entries {
            if let Err(err) = entry.subscription.unsubscribe().await {
                warn!(relay = %entry.binding.id, error = %err, "relay unsubscribe failed");
            }
        }
        count
    }

    /// Mark `user_id` revoked and tear down their relays. The mark applies
    /// even when the user has no active relay, so later subscribe requests
    /// are still refused.
    pub async fn revoke_user(&self, user_id: &str) -> usize {
        self.revoked.insert(user_id.to_string());
        self.release_user(user_id).await
    }

    /// Clear a revocation; `false` when the user was not revoked.
    pub fn unrevoke_user(&self, user_id: &str) -> bool {
        self.revoked.remove(user_id).is_some()
    }

    pub fn is_revoked(&self, user_id: &str) -> bool {
        self.revoked.contains(user_id)
    }

    pub fn active_count(&self) -> usize {
        self.relays.len()
    }

    /// Tear down every tracked relay. Revocation marks survive a drain.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.relays.iter().map(|entry| entry.key().clone()).collect();
        let mut entries = Vec::new();
        for id in ids {
            if let Some((_, entry)) = self.relays.remove(&id) {
                entries.push(entry);
            }
        }
        self.by_user.clear();
        let count = entries.len();
        for entry in entries {
            if let Err(err) = entry.subscription.unsubscribe().await {
                warn!(relay = %entry.binding.id, error = %err, "relay unsubscribe failed");
            }
        }
        if count > 0 {
            debug!(released = count, "relay table drained");
        }
    }
}

/// Listens on the reserved control topics of one adapter and services
/// client subscribe/unsubscribe requests plus admin revocations.
#[derive(Debug)]
pub struct RelayService {
    adapter: Arc<dyn BrokerAdapter>,
    access: AccessController,
    table: Arc<RelayTable>,
    control_subs: Mutex<Vec<SubscriptionHandle>>,
    running: AtomicBool,
}

impl RelayService {
    pub fn new(adapter: Arc<dyn BrokerAdapter>, access: AccessController) -> Self {
        Self {
            adapter,
            access,
            table: Arc::new(RelayTable::new()),
            control_subs: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// The live relay table, shared so hosts can revoke users directly.
    pub fn table(&self) -> Arc<RelayTable> {
        Arc::clone(&self.table)
    }

    /// Subscribe to the control patterns. Idempotent; a second call while
    /// running does nothing.
    pub async fn start(&self) -> Result<(), AdapterError> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("relay service already running");
            return Ok(());
        }

        let mut handles: Vec<SubscriptionHandle> = Vec::new();
        for pattern in [
            RELAY_SUBSCRIBE_PATTERN,
            RELAY_UNSUBSCRIBE_PATTERN,
            ADMIN_PATTERN,
        ] {
            let adapter = Arc::clone(&self.adapter);
            let access = self.access.clone();
            let table = Arc::clone(&self.table);
            let handler = message_handler(move |value, raw| {
                handle_control(
                    Arc::clone(&adapter),
                    access.clone(),
                    Arc::clone(&table),
                    value,
                    raw,
                )
            });
            match self.adapter.subscribe(pattern, handler).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in handles {
                        let _ = handle.unsubscribe().await;
                    }
                    self.running.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }

        *self.control_subs.lock() = handles;
        info!("relay service listening on control topics");
        Ok(())
    }

    /// Stop listening and tear down every tracked relay. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles = std::mem::take(&mut *self.control_subs.lock());
        for handle in handles {
            if let Err(err) = handle.unsubscribe().await {
                warn!(pattern = handle.pattern(), error = %err, "control unsubscribe failed");
            }
        }
        self.table.shutdown().await;
        info!("relay service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn handle_control(
    adapter: Arc<dyn BrokerAdapter>,
    access: AccessController,
    table: Arc<RelayTable>,
    payload: Value,
    raw: RawMessage,
) {
    let Some(request) = parse_control_topic(&raw.topic) else {
        warn!(topic = %raw.topic, "unparseable control request");
        return;
    };
    match request {
        ControlRequest::Subscribe {
            channel,
            organization_id,
            rest,
        } => {
            handle_subscribe(
                adapter,
                access,
                table,
                &channel,
                &organization_id,
                &rest,
                payload,
                raw,
            )
            .await;
        }
        ControlRequest::Unsubscribe { relay_id } => {
            if table.release(&relay_id).await {
                debug!(relay = %relay_id, "relay released");
                reply(&adapter, &raw, ok_reply()).await;
            } else {
                debug!(relay = %relay_id, "release for unknown relay");
                reply(&adapter, &raw, error_reply(REASON_UNKNOWN_RELAY)).await;
            }
        }
        ControlRequest::Revoke { user_id } => {
            let released = table.revoke_user(&user_id).await;
            info!(user = %user_id, released, "user access revoked");
            reply(&adapter, &raw, ok_reply()).await;
        }
        ControlRequest::Unrevoke { user_id } => {
            let cleared = table.unrevoke_user(&user_id);
            info!(user = %user_id, cleared, "user access restored");
            reply(&adapter, &raw, ok_reply()).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_subscribe(
    adapter: Arc<dyn BrokerAdapter>,
    access: AccessController,
    table: Arc<RelayTable>,
    channel: &str,
    organization_id: &str,
    rest: &[String],
    payload: Value,
    raw: RawMessage,
) {
    let user_id = payload.get("userId").and_then(Value::as_str);
    let deliver = payload.get("deliverInbox").and_then(Value::as_str);
    let (Some(user_id), Some(deliver)) = (user_id, deliver) else {
        warn!(topic = %raw.topic, "subscribe request without userId or deliverInbox");
        reply(&adapter, &raw, error_reply(REASON_INVALID_REQUEST)).await;
        return;
    };
    if deliver.is_empty() {
        reply(&adapter, &raw, error_reply(REASON_INVALID_REQUEST)).await;
        return;
    }

    let mut subject = format!("{channel}.{organization_id}");
    for token in rest {
        subject.push('.');
        subject.push_str(token);
    }
    // The subject becomes a broker subscription below; wildcard or
    // malformed tokens are rejected before any access check runs.
    if topic::validate_topic(&subject).is_err() {
        debug!(topic = %raw.topic, "subscribe request with malformed subject");
        reply(&adapter, &raw, error_reply(REASON_INVALID_REQUEST)).await;
        return;
    }

    if table.is_revoked(user_id) {
        debug!(user = user_id, "subscribe refused, access revoked");
        reply(&adapter, &raw, error_reply(REASON_REVOKED)).await;
        return;
    }

    let decision = access
        .check_access(&RequestContext::empty(), user_id, organization_id, &subject)
        .await;
    if !decision.allowed {
        reply(
            &adapter,
            &raw,
            error_reply(decision.reason.unwrap_or(DENY_INTERNAL)),
        )
        .await;
        return;
    }

    let pattern = format!("{subject}.>");
    let forward_adapter = Arc::clone(&adapter);
    let deliver_topic = deliver.to_string();
    let forward = message_handler(move |value, message| {
        let adapter = Arc::clone(&forward_adapter);
        let deliver = deliver_topic.clone();
        async move {
            if let Err(err) = adapter.publish(&deliver, &value).await {
                warn!(topic = %message.topic, inbox = %deliver, error = %err, "relay forward failed");
            }
        }
    });
    let subscription = match adapter.subscribe(&pattern, forward).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(pattern = %pattern, error = %err, "relay subscribe failed");
            reply(&adapter, &raw, error_reply(DENY_INTERNAL)).await;
            return;
        }
    };

    let binding = RelayBinding::new(channel, user_id, organization_id, &subject, deliver);
    let relay_id = binding.id.clone();
    table.track(binding, subscription);
    info!(
        relay = %relay_id,
        channel,
        user = user_id,
        organization = organization_id,
        "relay established"
    );
    reply(&adapter, &raw, json!({"status": "ok", "relayId": relay_id})).await;
}

fn ok_reply() -> Value {
    json!({"status": "ok"})
}

fn error_reply(reason: &str) -> Value {
    json!({"status": "error", "reason": reason})
}

async fn reply(adapter: &Arc<dyn BrokerAdapter>, raw: &RawMessage, body: Value) {
    let Some(reply_topic) = raw.reply.as_deref() else {
        return;
    };
    if let Err(err) = adapter.publish(reply_topic, &body).await {
        warn!(topic = reply_topic, error = %err, "control reply failed");
    }
}
