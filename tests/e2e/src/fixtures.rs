//! A fully wired control plane over the in-memory broker.
//!
//! The stack mirrors how a host application boots messaging: connect the
//! driver, declare channels, wire the directory, initialize the publisher,
//! start the relay. Tests get the whole thing from [`TestStack::start`].

use anyhow::Result;
use patchbay_core::access::AccessController;
use patchbay_core::channel::{ChannelOptions, ReadAccess};
use patchbay_core::config::{BrokerConfig, PublisherConfig};
use patchbay_core::publisher::MessagePublisher;
use patchbay_core::registry::ChannelRegistry;
use patchbay_core::relay::RelayService;
use patchbay_core::test_utils::StaticDirectory;
use patchbay_core::{message_handler, BrokerAdapter, SubscriptionHandle};
use patchbay_memory_adapter::MemoryBroker;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const BROKER_URL: &str = "mem://e2e";

/// Install a subscriber once; later calls are no-ops so every test can call
/// this freely.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The whole control plane wired over one `MemoryBroker`.
///
/// Standard fixture data: channel `ticket-changes` gated by the
/// `canManageTickets` permission, channel `user-notifications` public;
/// user `agent` holds the permission in `org-1`, user `viewer` holds none.
pub struct TestStack {
    pub broker: Arc<MemoryBroker>,
    pub registry: Arc<ChannelRegistry>,
    pub directory: Arc<StaticDirectory>,
    pub access: AccessController,
    pub publisher: Arc<MessagePublisher>,
    pub relay: RelayService,
}

impl TestStack {
    pub async fn start() -> Result<Self> {
        init_tracing();

        let broker = Arc::new(MemoryBroker::new());
        broker.connect(&BrokerConfig::new(BROKER_URL)).await?;

        let registry = Arc::new(ChannelRegistry::new());
        registry.register(
            "ticket-changes",
            ChannelOptions::new().with_read_access(ReadAccess::permission("canManageTickets")),
        )?;
        registry.register(
            "user-notifications",
            ChannelOptions::new().with_read_access(ReadAccess::Public),
        )?;

        let directory = Arc::new(
            StaticDirectory::new()
                .with_user("agent")
                .with_grant("agent", "canManageTickets", "org-1")
                .with_user("viewer"),
        );
        let access = AccessController::new(registry.clone(), directory.clone());

        let publisher = Arc::new(MessagePublisher::new(registry.clone()));
        publisher
            .initialize(broker.clone(), &PublisherConfig::default())
            .await;

        let relay = RelayService::new(broker.clone(), access.clone());
        relay.start().await?;

        info!(url = BROKER_URL, "e2e stack started");
        Ok(Self {
            broker,
            registry,
            directory,
            access,
            publisher,
            relay,
        })
    }

    /// Orderly teardown in the order a host would: relay, publisher,
    /// connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.relay.stop().await;
        self.publisher.close();
        self.broker.disconnect().await?;
        Ok(())
    }
}

/// Subscribe to `pattern` and collect every delivered payload.
pub async fn collector(
    broker: &MemoryBroker,
    pattern: &str,
) -> Result<(SubscriptionHandle, Arc<Mutex<Vec<Value>>>)> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = message_handler(move |value, _raw| {
        let sink = sink.clone();
        async move {
            if let Ok(mut seen) = sink.lock() {
                seen.push(value);
            }
        }
    });
    let handle = broker.subscribe(pattern, handler).await?;
    Ok((handle, seen))
}
