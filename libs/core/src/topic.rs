//! Channel name and topic grammar.
//!
//! Every string that travels through the control plane is validated or
//! constructed here: channel names, topic patterns, concrete topics, and the
//! reserved `_MESSAGING` control namespace. Centralizing the grammar keeps the
//! registry, access control, and broker drivers from growing divergent ad-hoc
//! string formatting.
//!
//! Wildcard semantics follow broker subject-matching conventions: `*` matches
//! exactly one token, `>` matches one or more trailing tokens and may only
//! appear as the final token of a pattern.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Minimum channel name length, inclusive.
pub const CHANNEL_NAME_MIN_LEN: usize = 3;
/// Maximum channel name length, inclusive.
pub const CHANNEL_NAME_MAX_LEN: usize = 50;
/// Required channel name suffixes, one per channel kind.
pub const CHANNEL_SUFFIXES: [&str; 3] = ["-changes", "-events", "-notifications"];

/// First token of every reserved control topic. The leading underscore sits
/// outside the channel name grammar, so registered channels can never collide
/// with the control namespace.
pub const RESERVED_PREFIX: &str = "_MESSAGING";

/// Pattern a relay service subscribes to in order to observe every client
/// subscribe request.
pub const RELAY_SUBSCRIBE_PATTERN: &str = "_MESSAGING.subscribe.>";
/// Pattern a relay service subscribes to in order to observe every client
/// unsubscribe request.
pub const RELAY_UNSUBSCRIBE_PATTERN: &str = "_MESSAGING.unsubscribe.>";
/// Pattern covering the administrative revoke/unrevoke control topics.
pub const ADMIN_PATTERN: &str = "_MESSAGING.admin.>";

/// Matches exactly one token in a subscription pattern.
pub const TOKEN_WILDCARD: &str = "*";
/// Matches one or more trailing tokens; only valid as the final token.
pub const TAIL_WILDCARD: &str = ">";

static CHANNEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]+)*$").expect("channel name regex"));
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("token regex"));

/// Grammar violations. These are deploy-time errors: they surface from
/// `register` and the topic builders and are meant to fail startup or CI,
/// not to be handled at runtime.
#[derive(Debug, Error)]
pub enum TopicError {
    /// The name broke one or more naming rules; every violated rule is listed.
    #[error("invalid channel name '{name}': {}", .violations.join("; "))]
    InvalidChannelName {
        name: String,
        violations: Vec<String>,
    },

    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid topic token '{token}': {reason}")]
    InvalidToken { token: String, reason: String },

    /// A pattern was declared on a channel it does not belong to.
    #[error("pattern '{pattern}' does not belong to channel '{channel}': the first token of every pattern must equal the channel name")]
    ForeignPattern { channel: String, pattern: String },
}

impl TopicError {
    pub fn invalid_pattern(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        TopicError::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_token(token: impl Into<String>, reason: impl Into<String>) -> Self {
        TopicError::InvalidToken {
            token: token.into(),
            reason: reason.into(),
        }
    }

    pub fn foreign_pattern(channel: impl Into<String>, pattern: impl Into<String>) -> Self {
        TopicError::ForeignPattern {
            channel: channel.into(),
            pattern: pattern.into(),
        }
    }
}

/// Validate a channel name against the full naming grammar.
///
/// A failing name yields a single error naming every violated rule, so a
/// misdeclared channel is fixed in one round trip instead of rule by rule.
pub fn validate_channel_name(name: &str) -> Result<(), TopicError> {
    let mut violations = Vec::new();

    if name.len() < CHANNEL_NAME_MIN_LEN || name.len() > CHANNEL_NAME_MAX_LEN {
        violations.push(format!(
            "length must be between {} and {} characters, got {}",
            CHANNEL_NAME_MIN_LEN,
            CHANNEL_NAME_MAX_LEN,
            name.len()
        ));
    }
    if !CHANNEL_NAME_RE.is_match(name) {
        violations.push(
            "must be hyphen-separated groups of lowercase letters and digits, starting with a letter"
                .to_string(),
        );
    }
    if !CHANNEL_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        violations.push(format!(
            "must end with one of: {}",
            CHANNEL_SUFFIXES.join(", ")
        ));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(TopicError::InvalidChannelName {
            name: name.to_string(),
            violations,
        })
    }
}

/// Validate a subscription pattern: dot-separated tokens of lowercase
/// letters, digits, and hyphens, where a token may also be `*`, and `>` may
/// only terminate the pattern.
pub fn validate_topic_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::invalid_pattern(pattern, "pattern is empty"));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (index, token) in tokens.iter().enumerate() {
        let is_last = index + 1 == tokens.len();
        if *token == TAIL_WILDCARD {
            if !is_last {
                return Err(TopicError::invalid_pattern(
                    pattern,
                    "'>' may only appear as the final token",
                ));
            }
        } else if *token != TOKEN_WILDCARD && !TOKEN_RE.is_match(token) {
            return Err(TopicError::invalid_pattern(
                pattern,
                format!(
                    "token '{}' must be hyphen-separated lowercase letters and digits",
                    token
                ),
            ));
        }
    }
    Ok(())
}

/// Validate a concrete topic: same token grammar as a pattern, but wildcards
/// are not allowed anywhere.
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::invalid_pattern(topic, "topic is empty"));
    }
    for token in topic.split('.') {
        if token == TAIL_WILDCARD || token == TOKEN_WILDCARD {
            return Err(TopicError::invalid_pattern(
                topic,
                "a published topic must not contain wildcards",
            ));
        }
        if !TOKEN_RE.is_match(token) {
            return Err(TopicError::invalid_pattern(
                topic,
                format!(
                    "token '{}' must be hyphen-separated lowercase letters and digits",
                    token
                ),
            ));
        }
    }
    Ok(())
}

/// Build a concrete topic under a channel: the channel name followed by the
/// given tokens, dot-joined. Fails if the channel name or the assembled topic
/// breaks the grammar.
pub fn build_topic(channel_name: &str, tokens: &[&str]) -> Result<String, TopicError> {
    validate_channel_name(channel_name)?;
    let mut topic = String::from(channel_name);
    for token in tokens {
        topic.push('.');
        topic.push_str(token);
    }
    validate_topic(&topic)?;
    Ok(topic)
}

/// The token before the first dot, which names the owning channel for any
/// topic inside a registered channel's namespace.
pub fn channel_of_topic(topic: &str) -> &str {
    match topic.split_once('.') {
        Some((head, _)) => head,
        None => topic,
    }
}

/// Whether a concrete topic is matched by a subscription pattern.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let topic_tokens: Vec<&str> = topic.split('.').collect();

    for (index, pattern_token) in pattern_tokens.iter().enumerate() {
        match *pattern_token {
            ">" => return topic_tokens.len() > index,
            "*" => {
                if index >= topic_tokens.len() {
                    return false;
                }
            }
            literal => {
                if topic_tokens.get(index).copied() != Some(literal) {
                    return false;
                }
            }
        }
    }
    pattern_tokens.len() == topic_tokens.len()
}

fn validate_control_token(token: &str, what: &str) -> Result<(), TopicError> {
    if !TOKEN_RE.is_match(token) {
        return Err(TopicError::invalid_token(
            token,
            format!(
                "{} must be hyphen-separated lowercase letters and digits",
                what
            ),
        ));
    }
    Ok(())
}

/// Control topic a client publishes to request a relayed subscription within
/// an organization. The relay derives the requested topic from everything
/// after the `subscribe` segment, so callers may append further tokens to
/// narrow the request.
pub fn relay_subscribe_topic(
    channel_name: &str,
    organization_id: &str,
) -> Result<String, TopicError> {
    validate_channel_name(channel_name)?;
    validate_control_token(organization_id, "organization id")?;
    Ok(format!(
        "{}.subscribe.{}.{}",
        RESERVED_PREFIX, channel_name, organization_id
    ))
}

/// Control topic a client publishes to tear down a relayed subscription.
pub fn relay_unsubscribe_topic(relay_id: &str) -> Result<String, TopicError> {
    validate_control_token(relay_id, "relay id")?;
    Ok(format!("{}.unsubscribe.{}", RESERVED_PREFIX, relay_id))
}

/// Administrative control topic that revokes a user's relayed subscriptions.
pub fn admin_revoke_topic(user_id: &str) -> Result<String, TopicError> {
    validate_control_token(user_id, "user id")?;
    Ok(format!("{}.admin.revoke.{}", RESERVED_PREFIX, user_id))
}

/// Administrative control topic that restores a previously revoked user.
pub fn admin_unrevoke_topic(user_id: &str) -> Result<String, TopicError> {
    validate_control_token(user_id, "user id")?;
    Ok(format!("{}.admin.unrevoke.{}", RESERVED_PREFIX, user_id))
}
