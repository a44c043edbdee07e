//! # Channel Registry
//!
//! ## Purpose
//! The authoritative, validated catalog of channel declarations, and the
//! driver of broker-side reconciliation. Application code registers every
//! channel once at boot; the rest of the control plane (access control, the
//! publisher, relays) reads from here and never mutates.
//!
//! ## Reconciliation flow
//! ```mermaid
//! graph TB
//!     App[Application boot] -->|register| Registry[ChannelRegistry]
//!     Registry -->|validate| Grammar[topic grammar]
//!     Boot[initialize_all] -->|ensure_channel per channel| Adapter[BrokerAdapter]
//!     Adapter -->|created / updated / up-to-date / failed| Report[ReconcileReport]
//! ```
//!
//! Registration failures are deploy-time errors and return `Err`;
//! reconciliation failures are runtime conditions and are reported in
//! buckets, never raised.

use crate::adapter::BrokerAdapter;
use crate::channel::{ChannelConfig, ChannelOptions, DEFAULT_CHANNEL_TTL, UNLIMITED_CONSUMERS};
use crate::topic::{self, TopicError};
use dashmap::DashMap;
use tracing::{debug, info, warn};

/// Outcome buckets from one reconciliation run. Channel names land in
/// exactly one bucket each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub up_to_date: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Number of channels touched by the run.
    pub fn total(&self) -> usize {
        self.created.len() + self.updated.len() + self.up_to_date.len() + self.failed.len()
    }
}

/// In-memory catalog of channel declarations, keyed by channel name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, ChannelConfig>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a channel declaration, returning the normalized
    /// config. Re-registering a name replaces the prior declaration whole;
    /// there is no merging.
    ///
    /// Errors are deploy-time failures: an invalid name (with every violated
    /// rule listed), an invalid pattern, or a pattern whose first token is
    /// not the channel name.
    pub fn register(
        &self,
        name: &str,
        options: ChannelOptions,
    ) -> Result<ChannelConfig, TopicError> {
        topic::validate_channel_name(name)?;

        let topics = options
            .topics
            .unwrap_or_else(|| vec![format!("{name}.>")]);
        for pattern in &topics {
            topic::validate_topic_pattern(pattern)?;
            if topic::channel_of_topic(pattern) != name {
                return Err(TopicError::foreign_pattern(name, pattern));
            }
        }

        let config = ChannelConfig {
            name: name.to_string(),
            topics,
            ttl: options.ttl.unwrap_or(DEFAULT_CHANNEL_TTL),
            storage: options.storage.unwrap_or_default(),
            retention: options.retention.unwrap_or_default(),
            discard: options.discard.unwrap_or_default(),
            max_consumers: options.max_consumers.unwrap_or(UNLIMITED_CONSUMERS),
            description: options.description,
            read_access: options.read_access,
        };

        debug!(
            channel = %config.name,
            topics = ?config.topics,
            access = config.read_access.as_ref().map(|a| a.kind()).unwrap_or("none"),
            "channel registered"
        );
        self.channels.insert(config.name.clone(), config.clone());
        Ok(config)
    }

    /// Remove a declaration; returns whether one existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.channels.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<ChannelConfig> {
        self.channels.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Every registered channel, sorted by name for deterministic
    /// reconciliation and reporting.
    pub fn get_all(&self) -> Vec<ChannelConfig> {
        let mut all: Vec<ChannelConfig> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Bring every registered channel's broker-side object in line with its
    /// declaration.
    ///
    /// A disconnected adapter yields an all-empty report rather than an
    /// error; startup must not hard-fail on a temporarily absent broker, and
    /// callers treat an empty report as "messaging degraded". One channel's
    /// failure never aborts reconciliation of the rest.
    pub async fn initialize_all(&self, adapter: &dyn BrokerAdapter) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        if !adapter.is_connected() {
            warn!("broker not connected, skipping channel reconciliation");
            return report;
        }

        for channel in self.get_all() {
            let name = channel.name.clone();
            match adapter.ensure_channel(&channel).await {
                Ok(outcome) if outcome.created => {
                    debug!(channel = %name, "channel created on broker");
                    report.created.push(name);
                }
                Ok(outcome) if outcome.updated => {
                    debug!(channel = %name, "channel updated on broker");
                    report.updated.push(name);
                }
                Ok(_) => {
                    debug!(channel = %name, "channel up to date");
                    report.up_to_date.push(name);
                }
                Err(err) => {
                    warn!(channel = %name, error = %err, "channel reconciliation failed");
                    report.failed.push(name);
                }
            }
        }

        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            up_to_date = report.up_to_date.len(),
            failed = report.failed.len(),
            "channel reconciliation complete"
        );
        report
    }

    /// Delete a channel broker-side and drop the local declaration.
    ///
    /// Runtime-condition semantics: returns `false` (never an error) when
    /// the adapter is disconnected, the broker has no such object, or the
    /// driver fails. The local declaration is only dropped after a
    /// confirmed broker-side delete.
    pub async fn delete_channel(&self, adapter: &dyn BrokerAdapter, name: &str) -> bool {
        if !adapter.is_connected() {
            warn!(channel = %name, "broker not connected, channel not deleted");
            return false;
        }
        match adapter.delete_channel(name).await {
            Ok(true) => {
                self.channels.remove(name);
                info!(channel = %name, "channel deleted");
                true
            }
            Ok(false) => {
                debug!(channel = %name, "broker has no such channel");
                false
            }
            Err(err) => {
                warn!(channel = %name, error = %err, "channel delete failed");
                false
            }
        }
    }
}
