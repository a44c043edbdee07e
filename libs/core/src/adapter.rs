//! The broker driver contract.
//!
//! Everything the control plane needs from a concrete broker fits in
//! [`BrokerAdapter`]; drivers implement it against NATS JetStream, an
//! in-process fake, or anything else with durable subjects. The registry,
//! publisher, and relay only ever see this trait.

use crate::channel::ChannelConfig;
use crate::config::BrokerConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Driver-side failures. These are runtime conditions: callers log and
/// degrade, they do not crash.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("subscribe to '{pattern}' failed: {reason}")]
    SubscribeFailed { pattern: String, reason: String },

    #[error("channel '{channel}' operation failed: {reason}")]
    ChannelFailed { channel: String, reason: String },

    /// The driver cannot perform this operation at all. Drivers must return
    /// this rather than silently succeed, so a partial driver surfaces in
    /// integration tests instead of behaving as a black hole.
    #[error("operation not supported by this driver: {0}")]
    Unsupported(&'static str),
}

impl AdapterError {
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        AdapterError::ConnectionFailed(reason.into())
    }

    pub fn publish_failed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        AdapterError::PublishFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn subscribe_failed(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        AdapterError::SubscribeFailed {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn channel_failed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        AdapterError::ChannelFailed {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error reflects connection state rather than the
    /// operation itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AdapterError::NotConnected | AdapterError::ConnectionFailed(_)
        )
    }
}

/// What `ensure_channel` did to the broker-side object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOutcome {
    pub created: bool,
    pub updated: bool,
}

impl EnsureOutcome {
    pub const CREATED: EnsureOutcome = EnsureOutcome {
        created: true,
        updated: false,
    };
    pub const UPDATED: EnsureOutcome = EnsureOutcome {
        created: false,
        updated: true,
    };
    pub const UP_TO_DATE: EnsureOutcome = EnsureOutcome {
        created: false,
        updated: false,
    };

    pub fn is_up_to_date(self) -> bool {
        !self.created && !self.updated
    }
}

/// Broker-side view of one delivered message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Concrete topic the message arrived on.
    pub topic: String,
    /// Reply topic for request/reply interactions, when the broker carries
    /// one.
    pub reply: Option<String>,
    /// Undecoded payload bytes.
    pub payload: Bytes,
}

/// Callback invoked for each delivered message: the decoded JSON payload
/// plus the raw frame.
pub type MessageHandler = Arc<dyn Fn(Value, RawMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Value, RawMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value, raw| -> BoxFuture<'static, ()> { Box::pin(f(value, raw)) })
}

/// A live subscription handed back by [`BrokerAdapter::subscribe`].
#[async_trait]
pub trait Subscription: Send + Sync + fmt::Debug {
    /// The pattern this subscription was created with.
    fn pattern(&self) -> &str;

    /// Stop delivery. Dropping a handle without calling this leaks the
    /// broker-side subscription until the connection closes.
    async fn unsubscribe(&self) -> Result<(), AdapterError>;
}

pub type SubscriptionHandle = Box<dyn Subscription>;

/// Operations a concrete broker driver must provide.
///
/// The required methods are the whole contract; a driver that does not
/// implement one of them does not compile. The `*_service` hooks are
/// optional broker-specific lifecycles (credential issuing, broker-native
/// relays) and default to doing nothing.
#[async_trait]
pub trait BrokerAdapter: Send + Sync + fmt::Debug {
    async fn connect(&self, config: &BrokerConfig) -> Result<(), AdapterError>;

    async fn disconnect(&self) -> Result<(), AdapterError>;

    /// Live connection state. Must be cheap; it is consulted on every
    /// publish and before reconciliation.
    fn is_connected(&self) -> bool;

    /// Idempotently bring the broker-side object for `channel` in line with
    /// the declaration: create it, update it in place when settings differ,
    /// or leave it alone.
    async fn ensure_channel(&self, channel: &ChannelConfig) -> Result<EnsureOutcome, AdapterError>;

    /// Remove the broker-side object. `Ok(false)` when none existed.
    async fn delete_channel(&self, name: &str) -> Result<bool, AdapterError>;

    /// JSON-encode `data` and send it under `topic`.
    async fn publish(&self, topic: &str, data: &Value) -> Result<(), AdapterError>;

    /// Deliver every message matching `pattern` to `handler` until the
    /// returned handle is unsubscribed.
    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, AdapterError>;

    async fn start_auth_service(&self, config: &BrokerConfig) -> Result<(), AdapterError> {
        let _ = config;
        tracing::debug!("auth service hook not used by this driver");
        Ok(())
    }

    async fn stop_auth_service(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn start_relay_service(&self, config: &BrokerConfig) -> Result<(), AdapterError> {
        let _ = config;
        tracing::debug!("relay service hook not used by this driver");
        Ok(())
    }

    async fn stop_relay_service(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
