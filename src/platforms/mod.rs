use anyhow::Result;
use async_trait::async_trait;

use crate::types::UserProfile;

pub mod slack;

/// Outbound capabilities every messaging platform client must provide.
///
/// Features only talk to the platform through this trait so tests can
/// substitute a recording client.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Post a text message to a channel
    async fn post_message(&self, channel: &str, text: &str) -> Result<()>;

    /// Add a reaction to the message identified by `message_id`
    async fn add_reaction(&self, channel: &str, message_id: &str, reaction: &str) -> Result<()>;

    /// Remove a user from a channel
    async fn kick_user(&self, channel: &str, user: &str) -> Result<()>;

    /// Invite a user (back) into a channel
    async fn invite_user(&self, channel: &str, user: &str) -> Result<()>;

    /// Look up a user's profile
    async fn user_profile(&self, user: &str) -> Result<UserProfile>;

    /// Platform identifier (e.g. "slack")
    fn platform_name(&self) -> &str;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// One recorded outbound call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Post { channel: String, text: String },
        React { channel: String, message_id: String, reaction: String },
        Kick { channel: String, user: String },
        Invite { channel: String, user: String },
    }

    /// Platform client that records every call instead of hitting the network
    #[derive(Default)]
    pub struct RecordingPlatform {
        calls: Mutex<Vec<Call>>,
        pub fail_invites: bool,
        pub fail_posts: bool,
        pub fail_reactions: bool,
    }

    impl RecordingPlatform {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_invites() -> Self {
            Self {
                fail_invites: true,
                ..Self::default()
            }
        }

        pub fn failing_posts() -> Self {
            Self {
                fail_posts: true,
                ..Self::default()
            }
        }

        pub fn failing_reactions() -> Self {
            Self {
                fail_reactions: true,
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn posts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Post { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PlatformClient for RecordingPlatform {
        async fn post_message(&self, channel: &str, text: &str) -> Result<()> {
            self.record(Call::Post { channel: channel.to_string(), text: text.to_string() });
            if self.fail_posts {
                return Err(anyhow::anyhow!("channel_not_found"));
            }
            Ok(())
        }

        async fn add_reaction(&self, channel: &str, message_id: &str, reaction: &str) -> Result<()> {
            self.record(Call::React {
                channel: channel.to_string(),
                message_id: message_id.to_string(),
                reaction: reaction.to_string(),
            });
            if self.fail_reactions {
                return Err(anyhow::anyhow!("invalid_name"));
            }
            Ok(())
        }

        async fn kick_user(&self, channel: &str, user: &str) -> Result<()> {
            self.record(Call::Kick { channel: channel.to_string(), user: user.to_string() });
            Ok(())
        }

        async fn invite_user(&self, channel: &str, user: &str) -> Result<()> {
            self.record(Call::Invite { channel: channel.to_string(), user: user.to_string() });
            if self.fail_invites {
                return Err(anyhow::anyhow!("invite rejected"));
            }
            Ok(())
        }

        async fn user_profile(&self, user: &str) -> Result<UserProfile> {
            Ok(UserProfile {
                id: user.to_string(),
                name: user.to_lowercase(),
                display_name: None,
                is_bot: false,
            })
        }

        fn platform_name(&self) -> &str {
            "recording"
        }
    }
}
