// src/config/mod.rs - Layered configuration: operator overrides > watched file > defaults

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

pub mod manager;
pub mod watcher;

pub use manager::{ConfigManager, ReloadOptions, Subscription};

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PERSONA_NAME: &str = "default";
pub const DEFAULT_PERSONA_PROMPT: &str =
    "You are a friendly, concise assistant hanging out in a team chat. Keep replies short.";
pub const DEFAULT_STICKY_DURATION_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_CONTEXT_MESSAGES: usize = 20;
pub const DEFAULT_MAX_CONTEXT_AGE_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 2000;
pub const DEFAULT_AMBIENT_DROP_RATE: f64 = 0.9;
pub const DEFAULT_TRIGGER_PATTERN: &str = r"(?i)^!roulette\b";
pub const DEFAULT_SURVIVAL_CHANCE: f64 = 5.0 / 6.0;
pub const DEFAULT_BAN_DURATION_SECS: u64 = 5 * 60;
pub const DEFAULT_KICK_DELAY_MS: u64 = 500;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_RETENTION_HOURS: u64 = 24;
/// Upper bound for every duration knob (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

const ENV_PREFIX: &str = "BANTERBOT_";

/// Errors raised while loading or validating the file layer
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// =================================================================
// LAYERS
// =================================================================

/// Token bucket knobs as they appear in a layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitLayer {
    pub burst: Option<u32>,
    pub refill_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformLayer {
    pub bot_token: Option<String>,
    pub bot_user_id: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmLayer {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedLayer {
    pub rate_limit: RateLimitLayer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationLayer {
    pub sticky_duration_secs: Option<u64>,
    pub max_context_messages: Option<usize>,
    pub max_context_age_secs: Option<u64>,
    pub max_context_tokens: Option<usize>,
    pub ambient_drop_rate: Option<f64>,
    pub rate_limit: RateLimitLayer,
    pub mention_rate_limit: RateLimitLayer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationLayer {
    pub trigger_pattern: Option<String>,
    pub survival_chance: Option<f64>,
    pub ban_duration_secs: Option<u64>,
    pub exempt_users: Option<Vec<String>>,
    pub kick_delay_ms: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub retention_hours: Option<u64>,
    pub rate_limit: RateLimitLayer,
}

/// One scripted trigger → response rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedRule {
    pub pattern: String,
    /// Treat `pattern` as a case-insensitive regex instead of an exact match
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub response: Option<String>,
    /// Random alternatives; one is picked per hit
    #[serde(default)]
    pub responses: Vec<String>,
    #[serde(default)]
    pub reactions: Vec<String>,
}

impl ScriptedRule {
    /// All response texts this rule can produce
    pub fn alternatives(&self) -> Vec<&str> {
        let mut all: Vec<&str> = self.responses.iter().map(String::as_str).collect();
        if let Some(single) = self.response.as_deref() {
            all.insert(0, single);
        }
        all
    }
}

/// A partial configuration. Both the watched file and operator overrides are
/// expressed as layers; a `None` field means "not set at this layer".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub log_level: Option<String>,
    pub environment: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub queue_capacity: Option<usize>,
    pub platform: PlatformLayer,
    pub llm: LlmLayer,
    pub scripted_responses: Option<Vec<ScriptedRule>>,
    pub scripted: ScriptedLayer,
    pub personas: Option<BTreeMap<String, String>>,
    pub default_persona: Option<String>,
    pub conversation: ConversationLayer,
    pub moderation: ModerationLayer,
}

/// Operator-set values; they win over everything else
pub type ConfigOverrides = ConfigLayer;

impl ConfigLayer {
    /// Parse a layer from file contents. `.json` is parsed as JSON, anything else as YAML.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer: ConfigLayer = if is_json {
            serde_json::from_str(content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        layer.validate()?;
        Ok(layer)
    }

    /// Read, parse and validate a layer from disk
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Reject layers that would produce an unusable snapshot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".to_string()));
        }

        if let Some(rules) = &self.scripted_responses {
            for rule in rules {
                if rule.pattern.trim().is_empty() {
                    return Err(ConfigError::Invalid("scripted response pattern cannot be empty".to_string()));
                }
                if rule.regex {
                    if let Err(e) = regex::Regex::new(&rule.pattern) {
                        return Err(ConfigError::Invalid(format!(
                            "scripted response regex '{}' does not compile: {}",
                            rule.pattern, e
                        )));
                    }
                }
                if rule.alternatives().is_empty() && rule.reactions.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "scripted response '{}' has neither a response nor a reaction",
                        rule.pattern
                    )));
                }
            }
        }

        if let Some(pattern) = &self.moderation.trigger_pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::Invalid(format!(
                    "moderation trigger '{}' does not compile: {}",
                    pattern, e
                )));
            }
        }

        check_probability("moderation.survival_chance", self.moderation.survival_chance)?;
        check_probability("conversation.ambient_drop_rate", self.conversation.ambient_drop_rate)?;

        for (name, secs) in [
            ("llm.timeout_secs", self.llm.timeout_secs),
            ("conversation.sticky_duration_secs", self.conversation.sticky_duration_secs),
            ("conversation.max_context_age_secs", self.conversation.max_context_age_secs),
            ("moderation.ban_duration_secs", self.moderation.ban_duration_secs),
            ("moderation.kick_delay_ms", self.moderation.kick_delay_ms.map(|ms| ms / 1000)),
            ("moderation.sweep_interval_secs", self.moderation.sweep_interval_secs),
            ("moderation.retention_hours", self.moderation.retention_hours.map(|h| h.saturating_mul(3600))),
            ("scripted.rate_limit.refill_secs", self.scripted.rate_limit.refill_secs),
            ("conversation.rate_limit.refill_secs", self.conversation.rate_limit.refill_secs),
            ("conversation.mention_rate_limit.refill_secs", self.conversation.mention_rate_limit.refill_secs),
            ("moderation.rate_limit.refill_secs", self.moderation.rate_limit.refill_secs),
        ] {
            check_duration(name, secs)?;
        }

        for (name, limit) in [
            ("scripted.rate_limit", &self.scripted.rate_limit),
            ("conversation.rate_limit", &self.conversation.rate_limit),
            ("conversation.mention_rate_limit", &self.conversation.mention_rate_limit),
            ("moderation.rate_limit", &self.moderation.rate_limit),
        ] {
            if limit.burst == Some(0) {
                return Err(ConfigError::Invalid(format!("{}.burst must be at least 1", name)));
            }
        }

        Ok(())
    }

    /// Build an override layer from `BANTERBOT_*` environment variables
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build an override layer from an explicit set of variables
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut layer = Self::default();

        for (key, value) in vars {
            let key = key.as_ref();
            let value: String = value.into();
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match name {
                "LOG_LEVEL" => layer.log_level = Some(value),
                "ENVIRONMENT" => layer.environment = Some(value),
                "DATA_DIR" => layer.data_dir = Some(PathBuf::from(value)),
                "QUEUE_CAPACITY" => layer.queue_capacity = parse_var(key, &value),
                "BOT_TOKEN" => layer.platform.bot_token = Some(value),
                "BOT_USER_ID" => layer.platform.bot_user_id = Some(value),
                "API_BASE" => layer.platform.api_base = Some(value),
                "LLM_API_KEY" => layer.llm.api_key = Some(value),
                "LLM_MODEL" => layer.llm.model = Some(value),
                "LLM_BASE_URL" => layer.llm.base_url = Some(value),
                "DEFAULT_PERSONA" => layer.default_persona = Some(value),
                "STICKY_DURATION_SECS" => layer.conversation.sticky_duration_secs = parse_var(key, &value),
                "AMBIENT_DROP_RATE" => layer.conversation.ambient_drop_rate = parse_var(key, &value),
                "BAN_DURATION_SECS" => layer.moderation.ban_duration_secs = parse_var(key, &value),
                "SURVIVAL_CHANCE" => layer.moderation.survival_chance = parse_var(key, &value),
                "EXEMPT_USERS" => {
                    layer.moderation.exempt_users = Some(
                        value
                            .split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect(),
                    )
                }
                _ => {}
            }
        }

        layer
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring unparseable override {}={}", key, value);
            None
        }
    }
}

fn check_duration(name: &str, secs: Option<u64>) -> Result<(), ConfigError> {
    match secs {
        Some(secs) if secs > MAX_DURATION_SECS => Err(ConfigError::Invalid(format!(
            "{} is too large ({}s exceeds {}s)",
            name, secs, MAX_DURATION_SECS
        ))),
        _ => Ok(()),
    }
}

fn check_probability(name: &str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(p) if !(0.0..=1.0).contains(&p) => Err(ConfigError::Invalid(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, p
        ))),
        _ => Ok(()),
    }
}

// =================================================================
// SNAPSHOT
// =================================================================

/// Resolved token bucket settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub burst: u32,
    pub refill: Duration,
}

impl RateLimitSettings {
    fn resolve(over: &RateLimitLayer, file: &RateLimitLayer, burst: u32, refill_secs: u64) -> Self {
        Self {
            burst: pick(over.burst, file.burst, burst),
            refill: Duration::from_secs(pick(over.refill_secs, file.refill_secs, refill_secs)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSettings {
    pub bot_token: Option<String>,
    pub bot_user_id: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedSettings {
    pub rules: Vec<ScriptedRule>,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSettings {
    pub sticky_duration: Duration,
    pub max_context_messages: usize,
    pub max_context_age: Duration,
    pub max_context_tokens: usize,
    /// Fraction of ambient (non-mention) messages dropped before any other work
    pub ambient_drop_rate: f64,
    pub rate_limit: RateLimitSettings,
    pub mention_rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModerationSettings {
    pub trigger_pattern: String,
    pub survival_chance: f64,
    pub ban_duration: Duration,
    pub exempt_users: Vec<String>,
    pub kick_delay: Duration,
    pub sweep_interval: Duration,
    pub retention: Duration,
    pub rate_limit: RateLimitSettings,
}

/// Fully-resolved, immutable configuration in effect at one point in time.
///
/// Never mutated after construction; a change produces a new snapshot that
/// replaces the old one.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub log_level: String,
    pub environment: String,
    pub data_dir: PathBuf,
    pub queue_capacity: usize,
    pub platform: PlatformSettings,
    pub llm: LlmSettings,
    pub scripted: ScriptedSettings,
    pub personas: BTreeMap<String, String>,
    pub default_persona: String,
    pub conversation: ConversationSettings,
    pub moderation: ModerationSettings,
}

/// `override ?? file ?? default`
fn pick<T: Clone>(over: Option<T>, file: Option<T>, default: T) -> T {
    over.or(file).unwrap_or(default)
}

fn pick_opt<T: Clone>(over: &Option<T>, file: &Option<T>) -> Option<T> {
    over.clone().or_else(|| file.clone())
}

impl ConfigSnapshot {
    /// Merge the override layer and the file layer over hard-coded defaults
    pub fn build(overrides: &ConfigOverrides, file: &ConfigLayer) -> Self {
        let (o, f) = (overrides, file);

        Self {
            log_level: pick(o.log_level.clone(), f.log_level.clone(), DEFAULT_LOG_LEVEL.to_string()),
            environment: pick(o.environment.clone(), f.environment.clone(), DEFAULT_ENVIRONMENT.to_string()),
            data_dir: pick(o.data_dir.clone(), f.data_dir.clone(), PathBuf::from(DEFAULT_DATA_DIR)),
            queue_capacity: pick(o.queue_capacity, f.queue_capacity, DEFAULT_QUEUE_CAPACITY),
            platform: PlatformSettings {
                bot_token: pick_opt(&o.platform.bot_token, &f.platform.bot_token),
                bot_user_id: pick_opt(&o.platform.bot_user_id, &f.platform.bot_user_id),
                api_base: pick_opt(&o.platform.api_base, &f.platform.api_base),
            },
            llm: LlmSettings {
                api_key: pick_opt(&o.llm.api_key, &f.llm.api_key),
                model: pick(o.llm.model.clone(), f.llm.model.clone(), DEFAULT_LLM_MODEL.to_string()),
                base_url: pick(o.llm.base_url.clone(), f.llm.base_url.clone(), DEFAULT_LLM_BASE_URL.to_string()),
                timeout: Duration::from_secs(pick(o.llm.timeout_secs, f.llm.timeout_secs, DEFAULT_LLM_TIMEOUT_SECS)),
            },
            scripted: ScriptedSettings {
                rules: pick(o.scripted_responses.clone(), f.scripted_responses.clone(), Vec::new()),
                rate_limit: RateLimitSettings::resolve(&o.scripted.rate_limit, &f.scripted.rate_limit, 5, 10),
            },
            personas: pick(o.personas.clone(), f.personas.clone(), BTreeMap::new()),
            default_persona: pick(
                o.default_persona.clone(),
                f.default_persona.clone(),
                DEFAULT_PERSONA_NAME.to_string(),
            ),
            conversation: ConversationSettings {
                sticky_duration: Duration::from_secs(pick(
                    o.conversation.sticky_duration_secs,
                    f.conversation.sticky_duration_secs,
                    DEFAULT_STICKY_DURATION_SECS,
                )),
                max_context_messages: pick(
                    o.conversation.max_context_messages,
                    f.conversation.max_context_messages,
                    DEFAULT_MAX_CONTEXT_MESSAGES,
                ),
                max_context_age: Duration::from_secs(pick(
                    o.conversation.max_context_age_secs,
                    f.conversation.max_context_age_secs,
                    DEFAULT_MAX_CONTEXT_AGE_SECS,
                )),
                max_context_tokens: pick(
                    o.conversation.max_context_tokens,
                    f.conversation.max_context_tokens,
                    DEFAULT_MAX_CONTEXT_TOKENS,
                ),
                ambient_drop_rate: pick(
                    o.conversation.ambient_drop_rate,
                    f.conversation.ambient_drop_rate,
                    DEFAULT_AMBIENT_DROP_RATE,
                ),
                rate_limit: RateLimitSettings::resolve(&o.conversation.rate_limit, &f.conversation.rate_limit, 3, 30),
                mention_rate_limit: RateLimitSettings::resolve(
                    &o.conversation.mention_rate_limit,
                    &f.conversation.mention_rate_limit,
                    5,
                    5,
                ),
            },
            moderation: ModerationSettings {
                trigger_pattern: pick(
                    o.moderation.trigger_pattern.clone(),
                    f.moderation.trigger_pattern.clone(),
                    DEFAULT_TRIGGER_PATTERN.to_string(),
                ),
                survival_chance: pick(o.moderation.survival_chance, f.moderation.survival_chance, DEFAULT_SURVIVAL_CHANCE),
                ban_duration: Duration::from_secs(pick(
                    o.moderation.ban_duration_secs,
                    f.moderation.ban_duration_secs,
                    DEFAULT_BAN_DURATION_SECS,
                )),
                exempt_users: pick(o.moderation.exempt_users.clone(), f.moderation.exempt_users.clone(), Vec::new()),
                kick_delay: Duration::from_millis(pick(o.moderation.kick_delay_ms, f.moderation.kick_delay_ms, DEFAULT_KICK_DELAY_MS)),
                sweep_interval: Duration::from_secs(
                    pick(o.moderation.sweep_interval_secs, f.moderation.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS).max(1),
                ),
                retention: Duration::from_secs(
                    pick(o.moderation.retention_hours, f.moderation.retention_hours, DEFAULT_RETENTION_HOURS).saturating_mul(3600),
                ),
                rate_limit: RateLimitSettings::resolve(&o.moderation.rate_limit, &f.moderation.rate_limit, 3, 20),
            },
        }
    }

    /// Names of the configured personas, falling back to the default persona
    pub fn persona_names(&self) -> Vec<String> {
        if self.personas.is_empty() {
            vec![self.default_persona.clone()]
        } else {
            self.personas.keys().cloned().collect()
        }
    }

    /// System prompt text for a persona
    pub fn persona_prompt(&self, name: &str) -> &str {
        self.personas
            .get(name)
            .or_else(|| self.personas.get(&self.default_persona))
            .map(String::as_str)
            .unwrap_or(DEFAULT_PERSONA_PROMPT)
    }

    /// Where the ban registry snapshot lives
    pub fn ban_registry_path(&self) -> PathBuf {
        self.data_dir.join("bans.json")
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::build(&ConfigLayer::default(), &ConfigLayer::default())
    }
}
