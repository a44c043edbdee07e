//! Read-access evaluation for consumer-side subscriptions.
//!
//! Every policy shape funnels through one evaluator so the security-relevant
//! branches live in a single reviewable place. The stance is deny-by-default
//! throughout: an unknown channel, a channel without a policy, an
//! unresolvable user, an unwired permission resolver, or a directory failure
//! all resolve to a structured denial. Callers never see an error from this
//! module, only `AccessDecision`.

use crate::channel::{PredicateRequest, ReadAccess};
use crate::directory::{Directory, DirectoryError, PrincipalKind, RequestContext};
use crate::registry::ChannelRegistry;
use crate::topic;
use std::sync::Arc;
use tracing::{debug, error};

/// Deny reasons carried back to relay clients. These are wire strings;
/// clients match on them verbatim.
pub const DENY_CHANNEL_NOT_FOUND: &str = "Channel not found";
pub const DENY_NO_ACCESS_CONFIG: &str = "No access configuration for channel";
pub const DENY_USER_NOT_FOUND: &str = "User not found or deleted";
pub const DENY_CUSTOM_FUNCTION: &str = "Access denied by custom function";
pub const DENY_PERMISSION: &str = "Permission denied";
pub const DENY_CONFIG_ERROR: &str = "Internal configuration error";
pub const DENY_INTERNAL: &str = "Internal error";
/// Policy shapes form a closed enum, so this reason is no longer produced.
/// Relay clients still match on the string, so it stays exported.
pub const DENY_INVALID_ACCESS_CONFIG: &str = "Invalid access configuration";

/// Outcome of one access check. Allowed decisions echo the principal they
/// were made for; denied decisions carry one of the `DENY_*` reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<&'static str>,
    pub user: Option<String>,
    pub organization: Option<String>,
}

impl AccessDecision {
    pub fn allow(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: None,
            user: Some(user_id.into()),
            organization: Some(organization_id.into()),
        }
    }

    pub fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            user: None,
            organization: None,
        }
    }
}

/// One channel a user may read, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableChannel {
    pub name: String,
    pub topics: Vec<String>,
    /// The permission gating the channel, for `Permission` policies only.
    pub permission: Option<String>,
}

/// Stateless policy evaluator over the registry and the host directory.
#[derive(Debug, Clone)]
pub struct AccessController {
    registry: Arc<ChannelRegistry>,
    directory: Arc<dyn Directory>,
}

impl AccessController {
    pub fn new(registry: Arc<ChannelRegistry>, directory: Arc<dyn Directory>) -> Self {
        Self { registry, directory }
    }

    /// Decide whether `user_id` may read `topic` on behalf of
    /// `organization_id`. Resolves the channel from the topic's first token.
    pub async fn check_access(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        organization_id: &str,
        topic: &str,
    ) -> AccessDecision {
        let channel_name = topic::channel_of_topic(topic);
        let Some(channel) = self.registry.get(channel_name) else {
            debug!(topic, user = user_id, "read denied, channel not found");
            return AccessDecision::deny(DENY_CHANNEL_NOT_FOUND);
        };
        let Some(policy) = channel.read_access.as_ref() else {
            debug!(channel = %channel.name, user = user_id, "read denied, no access policy");
            return AccessDecision::deny(DENY_NO_ACCESS_CONFIG);
        };

        let user = match self.resolve_user(ctx, user_id).await {
            Ok(user) => user,
            Err(reason) => {
                debug!(channel = %channel.name, user = user_id, reason, "read denied");
                return AccessDecision::deny(reason);
            }
        };

        match self
            .evaluate(ctx, &channel.name, policy, &user, organization_id, topic)
            .await
        {
            Ok(()) => {
                debug!(
                    channel = %channel.name,
                    user = user_id,
                    organization = organization_id,
                    "read allowed"
                );
                AccessDecision::allow(user_id, organization_id)
            }
            Err(reason) => {
                debug!(
                    channel = %channel.name,
                    user = user_id,
                    organization = organization_id,
                    reason,
                    "read denied"
                );
                AccessDecision::deny(reason)
            }
        }
    }

    /// Channels `user_id` may read in `organization_id`, for subscription
    /// discovery. The user is resolved once; each channel is then evaluated
    /// independently, so one misbehaving policy cannot hide the rest.
    /// An unresolvable user yields an empty list.
    pub async fn available_channels(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        organization_id: &str,
    ) -> Vec<AvailableChannel> {
        let user = match self.resolve_user(ctx, user_id).await {
            Ok(user) => user,
            Err(reason) => {
                debug!(user = user_id, reason, "channel discovery denied");
                return Vec::new();
            }
        };

        let mut available = Vec::new();
        for channel in self.registry.get_all() {
            let Some(policy) = channel.read_access.as_ref() else {
                continue;
            };
            // Discovery has no concrete topic; predicates see a synthetic
            // `<channel>.<organization>` subject instead.
            let topic = format!("{}.{}", channel.name, organization_id);
            match self
                .evaluate(ctx, &channel.name, policy, &user, organization_id, &topic)
                .await
            {
                Ok(()) => available.push(AvailableChannel {
                    name: channel.name.clone(),
                    topics: channel.topics.clone(),
                    permission: policy.permission_name().map(str::to_string),
                }),
                Err(reason) => {
                    debug!(channel = %channel.name, user = user_id, reason, "channel not available");
                }
            }
        }
        available
    }

    async fn resolve_user(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<crate::directory::DirectoryRecord, &'static str> {
        match self
            .directory
            .get_by_id(ctx, PrincipalKind::User, user_id)
            .await
        {
            Ok(Some(user)) if !user.is_deleted() => Ok(user),
            Ok(_) => Err(DENY_USER_NOT_FOUND),
            Err(err) => {
                error!(user = user_id, error = %err, "directory lookup failed");
                Err(DENY_INTERNAL)
            }
        }
    }

    /// The single evaluator behind both entry points. `Err` carries the
    /// deny reason.
    async fn evaluate(
        &self,
        ctx: &RequestContext,
        channel: &str,
        policy: &ReadAccess,
        user: &crate::directory::DirectoryRecord,
        organization_id: &str,
        topic: &str,
    ) -> Result<(), &'static str> {
        match policy {
            ReadAccess::Public => Ok(()),
            ReadAccess::Predicate(predicate) => {
                let request = PredicateRequest {
                    user: user.clone(),
                    context: ctx.clone(),
                    organization_id: organization_id.to_string(),
                    topic: topic.to_string(),
                };
                if predicate.as_ref()(request).await {
                    Ok(())
                } else {
                    Err(DENY_CUSTOM_FUNCTION)
                }
            }
            ReadAccess::Permission(permission) => {
                match self
                    .directory
                    .permitted_organizations(ctx, user, &[permission.as_str()])
                    .await
                {
                    Ok(organizations) => {
                        if organizations.iter().any(|org| org == organization_id) {
                            Ok(())
                        } else {
                            Err(DENY_PERMISSION)
                        }
                    }
                    Err(DirectoryError::NoPermissionResolver) => {
                        error!(
                            channel,
                            permission = %permission,
                            "permission resolver not wired into the directory"
                        );
                        Err(DENY_CONFIG_ERROR)
                    }
                    Err(err) => {
                        error!(channel, error = %err, "permission lookup failed");
                        Err(DENY_INTERNAL)
                    }
                }
            }
        }
    }
}
