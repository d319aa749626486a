//! # Banterbot
//!
//! An event-driven chat assistant. Every inbound platform event is fanned
//! out to independent feature processors, each with its own bounded queue:
//!
//! - **Scripted responses**: pattern → canned reply and reactions
//! - **Conversation**: LLM replies in a persona that sticks to each user
//! - **Moderation**: `!roulette` bans with timed, persisted reinvites
//!
//! Configuration merges operator overrides over a watched YAML file over
//! defaults, and hot-reloads without a restart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use banterbot::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigManager::new(ConfigOverrides::from_env(), Some("config/bot.yaml".into())).await;
//!     let snapshot = config.get_config();
//!
//!     let platform = Arc::new(SlackClient::new(SlackConfig::from_settings(&snapshot.platform)?)?);
//!     let llm = Arc::new(OpenAiClient::new(snapshot.llm.clone())?);
//!
//!     let bot = ChatBot::new(&config, platform, llm, Arc::new(ThreadRandom::new()))?;
//!     bot.start();
//!     bot.dispatch(&Event::from_json(r#"{"kind":"message","user":"U1","channel":"C1","text":"hello","ts":"1"}"#)?);
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod llm;
pub mod platforms;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::dispatcher::{DispatchReport, Dispatcher};
    pub use crate::bot::random::{RandomSource, ThreadRandom};
    pub use crate::bot::ChatBot;
    pub use crate::config::{ConfigManager, ConfigOverrides, ConfigSnapshot};
    pub use crate::llm::{LlmClient, OpenAiClient};
    pub use crate::platforms::{
        slack::{SlackClient, SlackConfig},
        PlatformClient,
    };
    pub use crate::types::{Event, EventKind};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
