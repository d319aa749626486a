use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::PlatformSettings;
use crate::platforms::PlatformClient;
use crate::types::UserProfile;

const DEFAULT_API_BASE: &str = "https://slack.com/api";

/// Configuration for the Slack Web API client
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl SlackConfig {
    /// Build from the platform section of the effective configuration
    pub fn from_settings(settings: &PlatformSettings) -> Result<Self> {
        let bot_token = settings
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .context("platform.bot_token is not configured")?;

        if !bot_token.starts_with("xoxb-") {
            warn!("Slack bot token does not look like a bot token (expected 'xoxb-' prefix)");
        }

        Ok(Self {
            bot_token,
            api_base: settings
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout: Duration::from_secs(10),
        })
    }
}

/// Slack Web API implementation of [`PlatformClient`]
pub struct SlackClient {
    config: SlackConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    name: String,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    profile: Option<ApiProfile>,
}

#[derive(Debug, Deserialize)]
struct ApiProfile {
    #[serde(default)]
    display_name: Option<String>,
}

impl SlackClient {
    pub fn new(config: SlackConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build Slack HTTP client")?;
        Ok(Self { config, http })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), method)
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<ApiResponse> {
        let request = self.http.post(self.url(method)).json(&body);
        self.execute(method, request).await
    }

    /// Read methods take form/query parameters instead of a JSON body
    async fn query(&self, method: &str, params: &[(&str, &str)]) -> Result<ApiResponse> {
        let request = self.http.get(self.url(method)).query(params);
        self.execute(method, request).await
    }

    async fn execute(&self, method: &str, request: reqwest::RequestBuilder) -> Result<ApiResponse> {
        debug!("Slack API call {}", method);
        let response: ApiResponse = request
            .bearer_auth(&self.config.bot_token)
            .send()
            .await
            .with_context(|| format!("Slack {} request failed", method))?
            .error_for_status()
            .with_context(|| format!("Slack {} returned HTTP error", method))?
            .json()
            .await
            .with_context(|| format!("Slack {} returned unreadable body", method))?;

        if !response.ok {
            return Err(anyhow::anyhow!(
                "Slack {} failed: {}",
                method,
                response.error.as_deref().unwrap_or("unknown_error")
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl PlatformClient for SlackClient {
    async fn post_message(&self, channel: &str, text: &str) -> Result<()> {
        self.call("chat.postMessage", json!({ "channel": channel, "text": text }))
            .await
            .map(|_| ())
    }

    async fn add_reaction(&self, channel: &str, message_id: &str, reaction: &str) -> Result<()> {
        let name = reaction.trim_matches(':');
        self.call(
            "reactions.add",
            json!({ "channel": channel, "timestamp": message_id, "name": name }),
        )
        .await
        .map(|_| ())
    }

    async fn kick_user(&self, channel: &str, user: &str) -> Result<()> {
        self.call("conversations.kick", json!({ "channel": channel, "user": user }))
            .await
            .map(|_| ())
    }

    async fn invite_user(&self, channel: &str, user: &str) -> Result<()> {
        match self
            .call("conversations.invite", json!({ "channel": channel, "users": user }))
            .await
        {
            Ok(_) => Ok(()),
            // Already back in the channel counts as a successful reinvite
            Err(e) if e.to_string().contains("already_in_channel") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn user_profile(&self, user: &str) -> Result<UserProfile> {
        let response = self.query("users.info", &[("user", user)]).await?;
        let api_user = response
            .user
            .with_context(|| format!("Slack users.info returned no user for {}", user))?;

        Ok(UserProfile {
            id: api_user.id,
            name: api_user.name,
            display_name: api_user.profile.and_then(|p| p.display_name),
            is_bot: api_user.is_bot,
        })
    }

    fn platform_name(&self) -> &str {
        "slack"
    }
}
