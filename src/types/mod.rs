// src/types/mod.rs - Normalized inbound event types shared by every feature

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event kinds the relay transport forwards to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Ordinary channel message
    Message,
    /// Message that explicitly mentions the bot
    AppMention,
    /// A user (re)joined a channel
    #[serde(alias = "member_joined")]
    MemberJoinedChannel,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::AppMention => "app_mention",
            EventKind::MemberJoinedChannel => "member_joined_channel",
        }
    }
}

/// Core event envelope that flows through the dispatcher into feature queues.
///
/// `message_id` is the platform-assigned timestamp/id and doubles as the
/// deduplication key together with the user and channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(alias = "user")]
    pub user_id: String,
    #[serde(alias = "channel")]
    pub channel_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(alias = "ts")]
    pub message_id: String,
}

/// Reasons an inbound payload is rejected before it reaches any processor
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event is missing required field '{0}'")]
    MissingField(&'static str),
}

impl Event {
    pub fn new(
        kind: EventKind,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            text: text.into(),
            message_id: message_id.into(),
        }
    }

    /// Parse and validate one JSON payload from the relay transport
    pub fn from_json(payload: &str) -> Result<Self, EventError> {
        let event: Event = serde_json::from_str(payload)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EventError> {
        if self.user_id.trim().is_empty() {
            return Err(EventError::MissingField("user_id"));
        }
        if self.channel_id.trim().is_empty() {
            return Err(EventError::MissingField("channel_id"));
        }
        if self.message_id.trim().is_empty() {
            return Err(EventError::MissingField("message_id"));
        }
        Ok(())
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            message_id: self.message_id.clone(),
        }
    }
}

/// (user, channel, message-id) tuple used to suppress repeated deliveries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub user_id: String,
    pub channel_id: String,
    pub message_id: String,
}

/// Subset of a user profile the features care about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub is_bot: bool,
}

impl UserProfile {
    /// Name to address the user by in replies
    pub fn preferred_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(display) if !display.is_empty() => display,
            _ => &self.name,
        }
    }
}

/// Format a platform mention for a user id
pub fn mention(user_id: &str) -> String {
    format!("<@{}>", user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay_payload() {
        let event = Event::from_json(
            r#"{"kind":"app_mention","user":"U1","channel":"C1","text":"hi","ts":"1700000000.000100"}"#,
        )
        .unwrap();

        assert_eq!(event.kind, EventKind::AppMention);
        assert_eq!(event.user_id, "U1");
        assert_eq!(event.channel_id, "C1");
        assert_eq!(event.message_id, "1700000000.000100");
    }

    #[test]
    fn test_member_joined_without_text() {
        let event = Event::from_json(
            r#"{"kind":"member_joined_channel","user_id":"U1","channel_id":"C1","message_id":"1"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::MemberJoinedChannel);
        assert!(event.text.is_empty());
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(matches!(Event::from_json("not json"), Err(EventError::Malformed(_))));
        assert!(matches!(
            Event::from_json(r#"{"kind":"reaction_added","user":"U1","channel":"C1","ts":"1"}"#),
            Err(EventError::Malformed(_))
        ));
        assert!(matches!(
            Event::from_json(r#"{"kind":"message","user":"","channel":"C1","ts":"1"}"#),
            Err(EventError::MissingField("user_id"))
        ));
    }

    #[test]
    fn test_preferred_name() {
        let mut profile = UserProfile {
            id: "U1".to_string(),
            name: "alice".to_string(),
            display_name: Some(String::new()),
            is_bot: false,
        };
        assert_eq!(profile.preferred_name(), "alice");
        profile.display_name = Some("Alice A.".to_string());
        assert_eq!(profile.preferred_name(), "Alice A.");
    }
}
