//! OpenAI-compatible chat completions client
//!
//! Works against any endpoint that speaks the `/chat/completions` protocol.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use super::{CompletionRequest, LlmClient, Role};
use crate::config::LlmSettings;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiClient {
    http: Client,
    settings: RwLock<LlmSettings>,
}

impl OpenAiClient {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let http = Client::builder()
            .build()
            .context("Failed to build LLM HTTP client")?;
        Ok(Self {
            http,
            settings: RwLock::new(settings),
        })
    }

    /// Pick up model / endpoint / key changes from a new snapshot
    pub fn update_settings(&self, settings: &LlmSettings) {
        let mut current = self.settings.write().unwrap_or_else(|p| p.into_inner());
        if *current != *settings {
            debug!("LLM settings updated (model {})", settings.model);
            *current = settings.clone();
        }
    }

    fn current_settings(&self) -> LlmSettings {
        self.settings.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Turn a completion request into chat messages: system prompt, prior
/// context, then the new user message.
fn build_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);

    messages.push(ChatMessage {
        role: "system",
        content: format!(
            "{}\n\nYou are speaking as the persona \"{}\". Messages from people are prefixed with their name.",
            request.system_prompt.trim(),
            request.persona
        ),
    });

    for entry in &request.history {
        let content = match entry.role {
            Role::User if !entry.author.is_empty() => format!("{}: {}", entry.author, entry.content),
            _ => entry.content.clone(),
        };
        messages.push(ChatMessage {
            role: entry.role.as_str(),
            content,
        });
    }

    messages.push(ChatMessage {
        role: Role::User.as_str(),
        content: format!("{}: {}", request.user_name, request.user_message),
    });

    messages
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let settings = self.current_settings();
        let api_key = settings
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .context("llm.api_key is not configured")?;

        let url = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: settings.model.clone(),
            messages: build_messages(&request),
        };

        debug!("Requesting completion from {} as {}", settings.model, request.persona);
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .timeout(settings.timeout)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            return Err(anyhow::anyhow!("LLM returned HTTP {}: {}", status, detail));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .context("LLM response contained no text")
    }
}
