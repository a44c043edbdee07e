//! Channel declarations: retention/storage settings and the read-access
//! policy attached to each channel.

use crate::directory::{DirectoryRecord, RequestContext};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default broker-side message retention time.
pub const DEFAULT_CHANNEL_TTL: Duration = Duration::from_secs(3600);
/// Sentinel for "no consumer limit".
pub const UNLIMITED_CONSUMERS: i64 = -1;

/// Where the broker keeps a channel's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Memory,
    File,
}

impl StorageKind {
    pub fn name(self) -> &'static str {
        match self {
            StorageKind::Memory => "memory",
            StorageKind::File => "file",
        }
    }
}

impl Default for StorageKind {
    fn default() -> Self {
        StorageKind::Memory
    }
}

/// Broker retention semantics for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Bounded by size/age limits only.
    Limits,
    /// Messages kept only while a consumer has interest.
    Interest,
    /// Each message delivered to exactly one consumer.
    Workqueue,
}

impl RetentionPolicy {
    pub fn name(self) -> &'static str {
        match self {
            RetentionPolicy::Limits => "limits",
            RetentionPolicy::Interest => "interest",
            RetentionPolicy::Workqueue => "workqueue",
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Interest
    }
}

/// Which messages the broker drops once limits are hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    Old,
    New,
}

impl DiscardPolicy {
    pub fn name(self) -> &'static str {
        match self {
            DiscardPolicy::Old => "old",
            DiscardPolicy::New => "new",
        }
    }
}

impl Default for DiscardPolicy {
    fn default() -> Self {
        DiscardPolicy::Old
    }
}

/// Inputs handed to a `ReadAccess::Predicate` policy.
#[derive(Debug, Clone)]
pub struct PredicateRequest {
    /// The resolved, non-deleted user asking for access.
    pub user: DirectoryRecord,
    /// Opaque host state for the current request.
    pub context: RequestContext,
    pub organization_id: String,
    pub topic: String,
}

/// Async host callback deciding read access for one request.
pub type AccessPredicate = Arc<dyn Fn(PredicateRequest) -> BoxFuture<'static, bool> + Send + Sync>;

/// Read-access policy of a channel. A channel without one is unreadable.
#[derive(Clone)]
pub enum ReadAccess {
    /// Any resolvable, non-deleted user may read.
    Public,
    /// Readable in every organization where the directory grants the named
    /// permission to the user.
    Permission(String),
    /// A host-supplied predicate decides.
    Predicate(AccessPredicate),
}

impl ReadAccess {
    pub fn permission(name: impl Into<String>) -> Self {
        ReadAccess::Permission(name.into())
    }

    /// Wrap an async closure as a predicate policy.
    pub fn predicate<F, Fut>(f: F) -> Self
    where
        F: Fn(PredicateRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        ReadAccess::Predicate(Arc::new(move |request| -> BoxFuture<'static, bool> {
            Box::pin(f(request))
        }))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReadAccess::Public => "public",
            ReadAccess::Permission(_) => "permission",
            ReadAccess::Predicate(_) => "predicate",
        }
    }

    /// The permission name for `Permission` policies, `None` otherwise.
    pub fn permission_name(&self) -> Option<&str> {
        match self {
            ReadAccess::Permission(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Debug for ReadAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadAccess::Public => f.write_str("Public"),
            ReadAccess::Permission(name) => f.debug_tuple("Permission").field(name).finish(),
            ReadAccess::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A normalized channel declaration as stored by the registry. Produced by
/// `ChannelRegistry::register`, never constructed field by field in
/// application code.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    /// Patterns this channel claims; each starts with `name`.
    pub topics: Vec<String>,
    pub ttl: Duration,
    pub storage: StorageKind,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    /// Negative means unlimited.
    pub max_consumers: i64,
    pub description: Option<String>,
    pub read_access: Option<ReadAccess>,
}

impl ChannelConfig {
    /// Broker-reconcilable projection of this declaration. Drivers compare
    /// it against live broker state with plain equality to decide between
    /// create, update, and leave-alone.
    pub fn settings(&self) -> ChannelSettings {
        ChannelSettings {
            topics: self.topics.clone(),
            ttl_secs: self.ttl.as_secs(),
            storage: self.storage,
            retention: self.retention,
            discard: self.discard,
            max_consumers: self.max_consumers,
        }
    }
}

/// The subset of channel fields that exists broker-side. The description and
/// access policy are control-plane concerns and deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub topics: Vec<String>,
    pub ttl_secs: u64,
    pub storage: StorageKind,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    pub max_consumers: i64,
}

/// Declarative options passed to `ChannelRegistry::register`. Unset fields
/// fall back to the documented defaults.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub topics: Option<Vec<String>>,
    pub ttl: Option<Duration>,
    pub storage: Option<StorageKind>,
    pub retention: Option<RetentionPolicy>,
    pub discard: Option<DiscardPolicy>,
    pub max_consumers: Option<i64>,
    pub description: Option<String>,
    pub read_access: Option<ReadAccess>,
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_discard(mut self, discard: DiscardPolicy) -> Self {
        self.discard = Some(discard);
        self
    }

    pub fn with_max_consumers(mut self, max_consumers: i64) -> Self {
        self.max_consumers = Some(max_consumers);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_read_access(mut self, read_access: ReadAccess) -> Self {
        self.read_access = Some(read_access);
        self
    }
}
