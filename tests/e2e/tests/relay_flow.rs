//! Relay flows end to end: untrusted clients subscribing through the
//! reserved control topics, message forwarding, and admin revocation.

use patchbay_core::access::{DENY_CHANNEL_NOT_FOUND, DENY_PERMISSION, DENY_USER_NOT_FOUND};
use patchbay_core::relay::{REASON_REVOKED, REASON_UNKNOWN_RELAY};
use patchbay_core::{BrokerAdapter, Subscription};
use patchbay_e2e_tests::fixtures::{collector, TestStack};
use serde_json::{json, Value};

fn subscribe_request(user: &str, inbox: &str) -> Value {
    json!({"userId": user, "deliverInbox": inbox})
}

#[tokio::test]
async fn test_subscribe_forward_unsubscribe() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;
    let (inbox_sub, inbox) = collector(stack.broker.as_ref(), "inbox.agent").await?;

    let reply = stack
        .broker
        .request(
            "_MESSAGING.subscribe.ticket-changes.org-1",
            &subscribe_request("agent", "inbox.agent"),
        )
        .await
        .expect("relay reply");
    assert_eq!(reply["status"], "ok");
    let relay_id = reply["relayId"].as_str().expect("relay id").to_string();
    assert_eq!(stack.relay.table().active_count(), 1);

    stack
        .publisher
        .publish("ticket-changes.org-1.5", &json!({"id": 5}))
        .await;
    assert_eq!(inbox.lock().unwrap().as_slice(), [json!({"id": 5})]);

    let reply = stack
        .broker
        .request(&format!("_MESSAGING.unsubscribe.{relay_id}"), &json!({}))
        .await
        .expect("relay reply");
    assert_eq!(reply, json!({"status": "ok"}));
    assert_eq!(stack.relay.table().active_count(), 0);

    // Nothing more is forwarded once the relay is gone.
    stack
        .publisher
        .publish("ticket-changes.org-1.6", &json!({"id": 6}))
        .await;
    assert_eq!(inbox.lock().unwrap().len(), 1);

    inbox_sub.unsubscribe().await?;
    stack.shutdown().await
}

#[tokio::test]
async fn test_denials_carry_wire_reasons() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;

    let cases = [
        (
            "_MESSAGING.subscribe.ticket-changes.org-1",
            "viewer",
            DENY_PERMISSION,
        ),
        (
            "_MESSAGING.subscribe.user-notifications.org-1",
            "nobody",
            DENY_USER_NOT_FOUND,
        ),
        (
            "_MESSAGING.subscribe.ghost-changes.org-1",
            "agent",
            DENY_CHANNEL_NOT_FOUND,
        ),
    ];
    for (topic, user, reason) in cases {
        let reply = stack
            .broker
            .request(topic, &subscribe_request(user, "inbox.x"))
            .await
            .expect("relay reply");
        assert_eq!(reply, json!({"status": "error", "reason": reason}), "{topic}");
    }
    assert_eq!(stack.relay.table().active_count(), 0);

    let reply = stack
        .broker
        .request("_MESSAGING.unsubscribe.relay-ghost", &json!({}))
        .await
        .expect("relay reply");
    assert_eq!(reply, json!({"status": "error", "reason": REASON_UNKNOWN_RELAY}));

    stack.shutdown().await
}

#[tokio::test]
async fn test_revocation_cuts_delivery() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;
    let (_inbox_sub, inbox) = collector(stack.broker.as_ref(), "inbox.agent").await?;

    let reply = stack
        .broker
        .request(
            "_MESSAGING.subscribe.ticket-changes.org-1",
            &subscribe_request("agent", "inbox.agent"),
        )
        .await
        .expect("relay reply");
    assert_eq!(reply["status"], "ok");
    stack
        .publisher
        .publish("ticket-changes.org-1.5", &json!({"n": 1}))
        .await;
    assert_eq!(inbox.lock().unwrap().len(), 1);

    let reply = stack
        .broker
        .request("_MESSAGING.admin.revoke.agent", &json!({}))
        .await
        .expect("relay reply");
    assert_eq!(reply, json!({"status": "ok"}));
    assert_eq!(stack.relay.table().active_count(), 0);

    // Delivery stops and new subscriptions are refused.
    stack
        .publisher
        .publish("ticket-changes.org-1.6", &json!({"n": 2}))
        .await;
    assert_eq!(inbox.lock().unwrap().len(), 1);
    let refused = stack
        .broker
        .request(
            "_MESSAGING.subscribe.ticket-changes.org-1",
            &subscribe_request("agent", "inbox.agent"),
        )
        .await
        .expect("relay reply");
    assert_eq!(refused, json!({"status": "error", "reason": REASON_REVOKED}));

    // Clearing the mark restores the normal path.
    stack
        .broker
        .request("_MESSAGING.admin.unrevoke.agent", &json!({}))
        .await
        .expect("relay reply");
    let restored = stack
        .broker
        .request(
            "_MESSAGING.subscribe.ticket-changes.org-1",
            &subscribe_request("agent", "inbox.agent"),
        )
        .await
        .expect("relay reply");
    assert_eq!(restored["status"], "ok");

    stack.shutdown().await
}

#[tokio::test]
async fn test_stopping_the_relay_releases_clients() -> anyhow::Result<()> {
    let stack = TestStack::start().await?;
    let reply = stack
        .broker
        .request(
            "_MESSAGING.subscribe.user-notifications.org-9",
            &subscribe_request("viewer", "inbox.viewer"),
        )
        .await
        .expect("relay reply");
    assert_eq!(reply["status"], "ok");
    assert_eq!(stack.relay.table().active_count(), 1);

    stack.relay.stop().await;
    assert_eq!(stack.relay.table().active_count(), 0);

    // Control topics go unanswered once the service is down.
    let unanswered = stack
        .broker
        .request(
            "_MESSAGING.subscribe.user-notifications.org-9",
            &subscribe_request("viewer", "inbox.viewer"),
        )
        .await;
    assert_eq!(unanswered, None);

    stack.publisher.close();
    stack.broker.disconnect().await?;
    Ok(())
}
