//! # Patchbay Core
//!
//! Broker-agnostic messaging control plane: validated channel declarations
//! over a strict topic grammar, declarative broker reconciliation,
//! deny-by-default read access control, best-effort publishing, and the
//! adapter contract a concrete broker driver implements.

pub mod access;
pub mod adapter;
pub mod channel;
pub mod config;
pub mod directory;
pub mod publisher;
pub mod registry;
pub mod relay;
pub mod test_utils;
pub mod topic;

// Re-export the types most hosts touch.
pub use access::{AccessController, AccessDecision, AvailableChannel};
pub use adapter::{
    message_handler, AdapterError, BrokerAdapter, EnsureOutcome, MessageHandler, RawMessage,
    Subscription, SubscriptionHandle,
};
pub use channel::{
    AccessPredicate, ChannelConfig, ChannelOptions, ChannelSettings, DiscardPolicy,
    PredicateRequest, ReadAccess, RetentionPolicy, StorageKind,
};
pub use config::{BrokerConfig, ConfigError, MessagingConfig, PublisherConfig};
pub use directory::{Directory, DirectoryError, DirectoryRecord, PrincipalKind, RequestContext};
pub use publisher::{MessagePublisher, PublisherStats};
pub use registry::{ChannelRegistry, ReconcileReport};
pub use relay::{ControlRequest, RelayBinding, RelayService, RelayTable};
pub use topic::{build_topic, topic_matches, TopicError};
