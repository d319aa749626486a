// src/llm/mod.rs - Completion client capability used by the conversational feature

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod openai;

pub use openai::OpenAiClient;

/// Who produced a context message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One prior message of the channel conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: Role,
    /// Display name of the author, empty for the assistant
    pub author: String,
    pub content: String,
}

/// Everything needed to ask the model for the next reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub persona: String,
    pub system_prompt: String,
    pub history: Vec<ContextMessage>,
    pub user_name: String,
    pub user_message: String,
}

/// Narrow completion capability; prompt templating lives behind it
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}
