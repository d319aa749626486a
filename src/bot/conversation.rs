// src/bot/conversation.rs - LLM persona conversations with sticky persona assignment

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::bot::processor::Feature;
use crate::bot::random::{pick, RandomSource};
use crate::bot::rate_limit::Lane;
use crate::config::{ConfigSnapshot, ConversationSettings, RateLimitSettings};
use crate::llm::{CompletionRequest, ContextMessage, LlmClient, Role};
use crate::platforms::PlatformClient;
use crate::types::{mention, Event, EventKind};

// =================================================================
// PERSONA ASSIGNMENT
// =================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaAssignment {
    pub persona: String,
    pub assigned_at: Instant,
}

/// Sticky user → persona table.
///
/// An assignment is reused until `sticky` has elapsed since it was made,
/// then a fresh persona is drawn uniformly from the configured set.
#[derive(Default)]
pub struct PersonaAssigner {
    table: Mutex<HashMap<String, PersonaAssignment>>,
}

impl PersonaAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PersonaAssignment>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persona for `user_id` at `now`, drawing a new one when missing or expired.
    /// An empty `personas` set resolves to `fallback`.
    pub fn resolve(
        &self,
        user_id: &str,
        now: Instant,
        sticky: Duration,
        personas: &[String],
        fallback: &str,
        random: &dyn RandomSource,
    ) -> String {
        let mut table = self.lock();

        if let Some(current) = table.get(user_id) {
            if now.saturating_duration_since(current.assigned_at) < sticky {
                return current.persona.clone();
            }
            debug!("Persona {} for {} expired", current.persona, user_id);
        }

        // Sweep stale assignments on insert
        table.retain(|_, a| now.saturating_duration_since(a.assigned_at) < sticky);

        let persona = pick(random, personas)
            .cloned()
            .unwrap_or_else(|| fallback.to_string());
        table.insert(
            user_id.to_string(),
            PersonaAssignment {
                persona: persona.clone(),
                assigned_at: now,
            },
        );
        persona
    }

    pub fn current(&self, user_id: &str) -> Option<PersonaAssignment> {
        self.lock().get(user_id).cloned()
    }

    /// Drop assignments that can no longer be reused
    pub fn prune(&self, now: Instant, sticky: Duration) -> usize {
        let mut table = self.lock();
        let before = table.len();
        table.retain(|_, a| now.saturating_duration_since(a.assigned_at) < sticky);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =================================================================
// CONTEXT STORE
// =================================================================

/// Bounds applied to each channel's remembered conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub max_messages: usize,
    pub max_age: Duration,
    pub max_tokens: usize,
}

impl From<&ConversationSettings> for ContextLimits {
    fn from(settings: &ConversationSettings) -> Self {
        Self {
            max_messages: settings.max_context_messages,
            max_age: settings.max_context_age,
            max_tokens: settings.max_context_tokens,
        }
    }
}

/// Rough token estimate: four characters per token
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: ContextMessage,
    at: Instant,
    tokens: usize,
}

/// Recent messages per channel, bounded by count, age and token budget
#[derive(Default)]
pub struct ContextStore {
    channels: HashMap<String, VecDeque<StoredMessage>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel_id: &str, message: ContextMessage, now: Instant, limits: ContextLimits) {
        let tokens = approx_tokens(&message.content);
        let entries = self.channels.entry(channel_id.to_string()).or_default();
        entries.push_back(StoredMessage { message, at: now, tokens });
        Self::trim(entries, now, limits);
    }

    /// Messages still within bounds, oldest first
    pub fn history(&mut self, channel_id: &str, now: Instant, limits: ContextLimits) -> Vec<ContextMessage> {
        let Some(entries) = self.channels.get_mut(channel_id) else {
            return Vec::new();
        };
        Self::trim(entries, now, limits);
        let history = entries.iter().map(|e| e.message.clone()).collect();
        if entries.is_empty() {
            self.channels.remove(channel_id);
        }
        history
    }

    fn trim(entries: &mut VecDeque<StoredMessage>, now: Instant, limits: ContextLimits) {
        while entries
            .front()
            .map(|e| now.saturating_duration_since(e.at) >= limits.max_age)
            .unwrap_or(false)
        {
            entries.pop_front();
        }

        while entries.len() > limits.max_messages {
            entries.pop_front();
        }

        let mut total: usize = entries.iter().map(|e| e.tokens).sum();
        while total > limits.max_tokens {
            match entries.pop_front() {
                Some(dropped) => total -= dropped.tokens,
                None => break,
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// =================================================================
// FEATURE
// =================================================================

/// Replies to mentions (and a sampled share of ambient chatter) through the
/// LLM, speaking as a persona that sticks to each user for a while.
pub struct ConversationFeature {
    platform: Arc<dyn PlatformClient>,
    llm: Arc<dyn LlmClient>,
    random: Arc<dyn RandomSource>,
    personas: Arc<PersonaAssigner>,
    context: ContextStore,
    config: Arc<ConfigSnapshot>,
}

impl ConversationFeature {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        llm: Arc<dyn LlmClient>,
        random: Arc<dyn RandomSource>,
        personas: Arc<PersonaAssigner>,
    ) -> Self {
        Self {
            platform,
            llm,
            random,
            personas,
            context: ContextStore::new(),
            config: Arc::new(ConfigSnapshot::default()),
        }
    }

    fn bot_mention(&self) -> Option<String> {
        self.config.platform.bot_user_id.as_deref().map(mention)
    }

    fn is_own_message(&self, event: &Event) -> bool {
        self.config.platform.bot_user_id.as_deref() == Some(event.user_id.as_str())
    }

    fn is_mention(&self, event: &Event) -> bool {
        event.kind == EventKind::AppMention
            || self
                .bot_mention()
                .map(|m| event.text.contains(&m))
                .unwrap_or(false)
    }

    /// Message text with the bot's own mention removed
    fn strip_mention(&self, text: &str) -> String {
        let stripped = match self.bot_mention() {
            Some(m) => text.replace(&m, " "),
            None => text.to_string(),
        };
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn limits(&self) -> ContextLimits {
        ContextLimits::from(&self.config.conversation)
    }

    async fn display_name(&self, user_id: &str) -> String {
        match self.platform.user_profile(user_id).await {
            Ok(profile) => profile.preferred_name().to_string(),
            Err(e) => {
                warn!("User lookup for {} failed: {:#}", user_id, e);
                user_id.to_string()
            }
        }
    }
}

#[async_trait]
impl Feature for ConversationFeature {
    fn name(&self) -> &'static str {
        "conversation"
    }

    fn reconfigure(&mut self, config: &ConfigSnapshot) {
        self.config = Arc::new(config.clone());
    }

    fn rate_limits(&self, config: &ConfigSnapshot) -> (RateLimitSettings, Option<RateLimitSettings>) {
        (config.conversation.rate_limit, Some(config.conversation.mention_rate_limit))
    }

    fn triage(&mut self, event: &Event) -> Option<Lane> {
        if event.kind == EventKind::MemberJoinedChannel || self.is_own_message(event) {
            return None;
        }
        if event.text.trim().is_empty() {
            return None;
        }

        if self.is_mention(event) {
            return Some(Lane::Direct);
        }

        if self.random.bool(self.config.conversation.ambient_drop_rate) {
            // Not answered, but still part of the channel's context
            let limits = self.limits();
            self.context.push(
                &event.channel_id,
                ContextMessage {
                    role: Role::User,
                    author: event.user_id.clone(),
                    content: event.text.clone(),
                },
                Instant::now(),
                limits,
            );
            return None;
        }
        Some(Lane::Ordinary)
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        let now = Instant::now();
        let config = self.config.clone();
        let limits = self.limits();

        let persona = self.personas.resolve(
            &event.user_id,
            now,
            config.conversation.sticky_duration,
            &config.persona_names(),
            &config.default_persona,
            self.random.as_ref(),
        );

        let user_name = self.display_name(&event.user_id).await;
        let user_message = self.strip_mention(&event.text);
        let history = self.context.history(&event.channel_id, now, limits);

        let request = CompletionRequest {
            persona: persona.clone(),
            system_prompt: config.persona_prompt(&persona).to_string(),
            history,
            user_name: user_name.clone(),
            user_message: user_message.clone(),
        };

        let reply = self
            .llm
            .complete(request)
            .await
            .with_context(|| format!("Completion as {} failed", persona))?;

        self.platform
            .post_message(&event.channel_id, &reply)
            .await
            .context("Failed to post conversation reply")?;

        self.context.push(
            &event.channel_id,
            ContextMessage {
                role: Role::User,
                author: user_name,
                content: user_message,
            },
            now,
            limits,
        );
        self.context.push(
            &event.channel_id,
            ContextMessage {
                role: Role::Assistant,
                author: String::new(),
                content: reply,
            },
            now,
            limits,
        );

        Ok(())
    }

    fn shutdown(&mut self) {
        let pruned = self
            .personas
            .prune(Instant::now(), self.config.conversation.sticky_duration);
        debug!("Pruned {} persona assignments on shutdown", pruned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::random::testing::ScriptedRandom;
    use crate::config::{ConfigLayer, ConversationLayer, PlatformLayer};
    use crate::llm::testing::CannedLlm;
    use crate::platforms::testing::RecordingPlatform;
    use std::collections::BTreeMap;

    const STICKY: Duration = Duration::from_secs(60);

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn user_msg(content: &str) -> ContextMessage {
        ContextMessage {
            role: Role::User,
            author: "u".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_persona_sticky_until_duration_elapses() {
        let assigner = PersonaAssigner::new();
        let random = ScriptedRandom::new([0.0, 0.99]);
        let personas = names(&["butler", "pirate"]);
        let t0 = Instant::now();

        assert_eq!(assigner.resolve("U1", t0, STICKY, &personas, "default", &random), "butler");
        assert_eq!(
            assigner.resolve("U1", t0 + Duration::from_secs(59), STICKY, &personas, "default", &random),
            "butler"
        );

        let later = t0 + STICKY;
        assert_eq!(assigner.resolve("U1", later, STICKY, &personas, "default", &random), "pirate");
        assert_eq!(assigner.current("U1").unwrap().assigned_at, later);
    }

    #[test]
    fn test_empty_persona_set_uses_fallback() {
        let assigner = PersonaAssigner::new();
        let random = ScriptedRandom::constant(0.5);
        assert_eq!(assigner.resolve("U1", Instant::now(), STICKY, &[], "default", &random), "default");
    }

    #[test]
    fn test_prune_drops_expired_assignments() {
        let assigner = PersonaAssigner::new();
        let random = ScriptedRandom::constant(0.0);
        let t0 = Instant::now();
        assigner.resolve("U1", t0, STICKY, &names(&["a"]), "d", &random);
        assigner.resolve("U2", t0 + Duration::from_secs(30), STICKY, &names(&["a"]), "d", &random);

        assert_eq!(assigner.prune(t0 + STICKY, STICKY), 1);
        assert_eq!(assigner.len(), 1);
    }

    #[test]
    fn test_new_assignment_sweeps_expired_users() {
        let assigner = PersonaAssigner::new();
        let random = ScriptedRandom::constant(0.0);
        let personas = names(&["a"]);
        let t0 = Instant::now();

        for user in ["U1", "U2", "U3"] {
            assigner.resolve(user, t0, STICKY, &personas, "d", &random);
        }
        assert_eq!(assigner.len(), 3);

        assigner.resolve("U4", t0 + STICKY, STICKY, &personas, "d", &random);
        assert_eq!(assigner.len(), 1);
        assert!(assigner.current("U1").is_none());
        assert!(assigner.current("U4").is_some());
    }

    #[test]
    fn test_context_bounded_by_count_age_and_tokens() {
        let mut store = ContextStore::new();
        let t0 = Instant::now();
        let limits = ContextLimits {
            max_messages: 3,
            max_age: Duration::from_secs(100),
            max_tokens: 1000,
        };

        for i in 0..5 {
            store.push("C1", user_msg(&format!("m{}", i)), t0 + Duration::from_secs(i * 10), limits);
        }
        let contents: Vec<String> = store
            .history("C1", t0 + Duration::from_secs(40), limits)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        // m2 (t=20) and m3 (t=30) are past max_age at t=130
        let aged = store.history("C1", t0 + Duration::from_secs(130), limits);
        assert_eq!(aged.len(), 1);
        assert!(store.history("C1", t0 + Duration::from_secs(500), limits).is_empty());
        assert_eq!(store.channel_count(), 0);

        let tight = ContextLimits { max_tokens: 5, ..limits };
        store.push("C2", user_msg("aaaaaaaaaaaaaaaa"), t0, tight);
        store.push("C2", user_msg("bbbbbbbb"), t0, tight);
        let kept = store.history("C2", t0, tight);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "bbbbbbbb");
    }

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }

    fn config(drop_rate: f64) -> ConfigSnapshot {
        let mut personas = BTreeMap::new();
        personas.insert("pirate".to_string(), "Talk like a pirate.".to_string());
        let layer = ConfigLayer {
            personas: Some(personas),
            platform: PlatformLayer {
                bot_user_id: Some("UBOT".to_string()),
                ..Default::default()
            },
            conversation: ConversationLayer {
                ambient_drop_rate: Some(drop_rate),
                ..Default::default()
            },
            ..Default::default()
        };
        ConfigSnapshot::build(&ConfigLayer::default(), &layer)
    }

    fn conversation(
        platform: Arc<RecordingPlatform>,
        llm: Arc<CannedLlm>,
        random: ScriptedRandom,
        drop_rate: f64,
    ) -> ConversationFeature {
        let mut feature = ConversationFeature::new(platform, llm, Arc::new(random), Arc::new(PersonaAssigner::new()));
        feature.reconfigure(&config(drop_rate));
        feature
    }

    #[tokio::test]
    async fn test_mention_reply_uses_persona_and_context() {
        let platform = Arc::new(RecordingPlatform::new());
        let llm = Arc::new(CannedLlm::new("arr"));
        let mut feature = conversation(platform.clone(), llm.clone(), ScriptedRandom::constant(0.0), 1.0);

        let first = Event::new(EventKind::Message, "U1", "C1", "<@UBOT>  where is the  gold?", "1");
        assert_eq!(feature.triage(&first), Some(Lane::Direct));
        feature.handle(first).await.unwrap();

        let second = Event::new(EventKind::AppMention, "U1", "C1", "and the map?", "2");
        assert_eq!(feature.triage(&second), Some(Lane::Direct));
        feature.handle(second).await.unwrap();

        assert_eq!(platform.posts(), vec!["[pirate] arr".to_string(), "[pirate] arr".to_string()]);

        let requests = llm.requests();
        assert_eq!(requests[0].user_message, "where is the gold?");
        assert_eq!(requests[0].system_prompt, "Talk like a pirate.");
        assert_eq!(requests[0].user_name, "u1");
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[1].history.len(), 2);
        assert_eq!(requests[1].history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_ambient_messages_sampled() {
        let platform = Arc::new(RecordingPlatform::new());
        let llm = Arc::new(CannedLlm::new("hi"));

        let mut always_drop = conversation(platform.clone(), llm.clone(), ScriptedRandom::constant(0.5), 1.0);
        assert_eq!(always_drop.triage(&Event::new(EventKind::Message, "U1", "C1", "chatter", "1")), None);

        let mut never_drop = conversation(platform, llm, ScriptedRandom::constant(0.5), 0.0);
        assert_eq!(
            never_drop.triage(&Event::new(EventKind::Message, "U1", "C1", "chatter", "2")),
            Some(Lane::Ordinary)
        );
    }

    #[tokio::test]
    async fn test_dropped_ambient_message_becomes_context() {
        let platform = Arc::new(RecordingPlatform::new());
        let llm = Arc::new(CannedLlm::new("ok"));
        let mut feature = conversation(platform, llm.clone(), ScriptedRandom::constant(0.5), 1.0);

        assert!(feature.triage(&Event::new(EventKind::Message, "U2", "C1", "lunch?", "1")).is_none());
        let mention = Event::new(EventKind::AppMention, "U1", "C1", "thoughts?", "2");
        feature.triage(&mention);
        feature.handle(mention).await.unwrap();

        let history = &llm.requests()[0].history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "lunch?");
    }

    #[tokio::test]
    async fn test_never_answers_itself_or_joins() {
        let platform = Arc::new(RecordingPlatform::new());
        let llm = Arc::new(CannedLlm::new("x"));
        let mut feature = conversation(platform, llm, ScriptedRandom::constant(0.9), 0.0);

        assert!(feature.triage(&Event::new(EventKind::AppMention, "UBOT", "C1", "<@UBOT> hi", "1")).is_none());
        assert!(feature.triage(&Event::new(EventKind::MemberJoinedChannel, "U1", "C1", "", "2")).is_none());
    }

    #[tokio::test]
    async fn test_llm_failure_posts_nothing() {
        let platform = Arc::new(RecordingPlatform::new());
        let llm = Arc::new(CannedLlm::failing());
        let mut feature = conversation(platform.clone(), llm, ScriptedRandom::constant(0.0), 0.0);

        let event = Event::new(EventKind::AppMention, "U1", "C1", "hi", "1");
        assert!(feature.handle(event).await.is_err());
        assert!(platform.posts().is_empty());
    }
}
