//! Best-effort message publishing.
//!
//! The publisher is the write side of the control plane: business code calls
//! [`MessagePublisher::publish`] and moves on. Messaging here is a side
//! channel, so a broker hiccup degrades to "feature inert" and is never
//! allowed to fail the transaction that triggered the publish.

use crate::adapter::BrokerAdapter;
use crate::config::PublisherConfig;
use crate::registry::{ChannelRegistry, ReconcileReport};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counter snapshot for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Messages handed to the adapter successfully.
    pub sent: u64,
    /// Messages the adapter rejected.
    pub failed: u64,
    /// Messages dropped because publishing was disabled or closed.
    pub suppressed: u64,
}

#[derive(Debug, Default)]
struct PublisherState {
    adapter: Option<Arc<dyn BrokerAdapter>>,
    enabled: bool,
}

/// Fire-and-forget fan-out to the active adapter.
///
/// One publisher per process is the expected shape; the host constructs it
/// once and shares it behind an `Arc`. It starts inert and becomes live via
/// [`initialize`](Self::initialize).
#[derive(Debug)]
pub struct MessagePublisher {
    registry: Arc<ChannelRegistry>,
    state: RwLock<PublisherState>,
    sent: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
}

impl MessagePublisher {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            state: RwLock::new(PublisherState::default()),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Bind an adapter and reconcile every registered channel.
    ///
    /// Stays inert (and returns an empty report) when publishing is disabled
    /// by configuration or the adapter is not connected. Per-channel
    /// reconciliation failures land in the report's `failed` bucket and do
    /// not disable publishing; the broker objects that did reconcile keep
    /// working.
    pub async fn initialize(
        &self,
        adapter: Arc<dyn BrokerAdapter>,
        config: &PublisherConfig,
    ) -> ReconcileReport {
        if !config.enabled {
            info!("publishing disabled by configuration");
            return ReconcileReport::default();
        }
        if !adapter.is_connected() {
            warn!("broker not connected, publishing disabled");
            return ReconcileReport::default();
        }

        {
            let mut state = self.state.write();
            state.adapter = Some(adapter.clone());
            state.enabled = true;
        }
        let report = self.registry.initialize_all(adapter.as_ref()).await;
        debug!(channels = report.total(), "publisher initialized");
        report
    }

    /// Send `data` under `topic`, swallowing failures.
    ///
    /// Internally awaited so errors can be counted and logged, but nothing
    /// propagates to the caller.
    pub async fn publish(&self, topic: &str, data: &Value) {
        let adapter = {
            let state = self.state.read();
            if state.enabled {
                state.adapter.clone()
            } else {
                None
            }
        };
        let Some(adapter) = adapter else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(topic, "publishing disabled, message dropped");
            return;
        };

        match adapter.publish(topic, data).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                debug!(topic, "message published");
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(topic, error = %err, "publish failed");
            }
        }
    }

    /// Drop the adapter reference and disable publishing. Idempotent; the
    /// adapter connection itself belongs to the host and is not closed here.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.adapter.take().is_some() || state.enabled {
            state.enabled = false;
            info!("publisher closed");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}
