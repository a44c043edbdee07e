//! Control-plane lifecycle over the in-memory broker: boot-time
//! reconciliation, grammar enforcement, access decisions, and fire-and-forget
//! publishing.

use assert_matches::assert_matches;
use patchbay_core::access::{DENY_NO_ACCESS_CONFIG, DENY_PERMISSION};
use patchbay_core::channel::ChannelOptions;
use patchbay_core::directory::RequestContext;
use patchbay_core::topic::{build_topic, TopicError};
use patchbay_core::{BrokerAdapter, Subscription};
use patchbay_e2e_tests::fixtures::{collector, TestStack};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_boot_reconciles_declared_channels() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;
    assert!(stack.publisher.is_enabled());
    assert!(stack.broker.has_channel("ticket-changes"));
    assert!(stack.broker.has_channel("user-notifications"));

    // A second reconciliation finds everything in place.
    let report = stack.registry.initialize_all(stack.broker.as_ref()).await;
    assert_eq!(report.up_to_date.len(), 2);
    assert!(report.created.is_empty());
    assert!(report.failed.is_empty());

    // Changing one declaration shows up as an update.
    stack.registry.register(
        "user-notifications",
        ChannelOptions::new().with_ttl(Duration::from_secs(60)),
    )?;
    let report = stack.registry.initialize_all(stack.broker.as_ref()).await;
    assert_eq!(report.updated, vec!["user-notifications".to_string()]);
    assert_eq!(report.up_to_date, vec!["ticket-changes".to_string()]);

    stack.shutdown().await
}

#[tokio::test]
async fn test_grammar_is_enforced_at_registration() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;

    for name in ["ab", "InvalidName", "no-suffix", "1bad-changes"] {
        assert_matches!(
            stack.registry.register(name, ChannelOptions::new()),
            Err(TopicError::InvalidChannelName { .. }),
            "{name}"
        );
    }

    assert_eq!(
        build_topic("ticket-changes", &["org1", "42"])?,
        "ticket-changes.org1.42"
    );
    assert_matches!(
        build_topic("Bad_Name", &[]),
        Err(TopicError::InvalidChannelName { .. })
    );

    stack.shutdown().await
}

#[tokio::test]
async fn test_read_access_scenario() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;
    let ctx = RequestContext::empty();

    let denied = stack
        .access
        .check_access(&ctx, "viewer", "org-1", "ticket-changes.org-1.5")
        .await;
    assert!(!denied.allowed);
    assert_eq!(denied.reason, Some(DENY_PERMISSION));

    let allowed = stack
        .access
        .check_access(&ctx, "viewer", "org-1", "user-notifications.org-1.user-9")
        .await;
    assert!(allowed.allowed);

    let agent = stack
        .access
        .check_access(&ctx, "agent", "org-1", "ticket-changes.org-1.5")
        .await;
    assert!(agent.allowed);

    // Discovery reflects the same decisions.
    let viewer_channels = stack.access.available_channels(&ctx, "viewer", "org-1").await;
    let names: Vec<&str> = viewer_channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["user-notifications"]);
    let agent_channels = stack.access.available_channels(&ctx, "agent", "org-1").await;
    assert_eq!(agent_channels.len(), 2);

    // A channel declared without any read policy stays unreadable.
    stack.registry.register("audit-events", ChannelOptions::new())?;
    let audit = stack
        .access
        .check_access(&ctx, "agent", "org-1", "audit-events.org-1.1")
        .await;
    assert_eq!(audit.reason, Some(DENY_NO_ACCESS_CONFIG));

    stack.shutdown().await
}

#[tokio::test]
async fn test_publishing_is_fire_and_forget() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;
    let (sub, seen) = collector(stack.broker.as_ref(), "ticket-changes.>").await?;

    let topic = build_topic("ticket-changes", &["org-1", "5"])?;
    stack
        .publisher
        .publish(&topic, &json!({"id": 5, "status": "open"}))
        .await;
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        [json!({"id": 5, "status": "open"})]
    );

    // A broken broker degrades publishing to counted, logged drops.
    stack.broker.disconnect().await?;
    stack.publisher.publish(&topic, &json!({"id": 6})).await;
    let stats = stack.publisher.stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 1);

    stack.publisher.close();
    stack.publisher.publish(&topic, &json!({"id": 7})).await;
    assert_eq!(stack.publisher.stats().suppressed, 1);

    sub.unsubscribe().await?;
    stack.shutdown().await
}

#[tokio::test]
async fn test_channel_delete_roundtrip() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;

    assert!(
        stack
            .registry
            .delete_channel(stack.broker.as_ref(), "user-notifications")
            .await
    );
    assert!(!stack.broker.has_channel("user-notifications"));
    assert!(stack.registry.get("user-notifications").is_none());
    assert!(
        !stack
            .registry
            .delete_channel(stack.broker.as_ref(), "user-notifications")
            .await
    );

    stack.shutdown().await
}
