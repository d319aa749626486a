// src/bot/scripted.rs - Pattern → canned response feature

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use regex::{Regex, RegexBuilder};
use std::sync::Arc;

use crate::bot::processor::Feature;
use crate::bot::random::{pick, RandomSource};
use crate::bot::rate_limit::Lane;
use crate::config::{ConfigSnapshot, RateLimitSettings, ScriptedRule};
use crate::platforms::PlatformClient;
use crate::types::{mention, Event, EventKind};

enum Matcher {
    /// Whole message, trimmed, case-insensitive
    Exact(String),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Matcher::Exact(expected) => text.trim().to_lowercase() == *expected,
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

struct CompiledRule {
    pattern: String,
    matcher: Matcher,
    responses: Vec<String>,
    reactions: Vec<String>,
}

impl CompiledRule {
    fn compile(rule: &ScriptedRule) -> Result<Self> {
        let matcher = if rule.regex {
            let re = RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Invalid scripted pattern '{}'", rule.pattern))?;
            Matcher::Regex(re)
        } else {
            Matcher::Exact(rule.pattern.trim().to_lowercase())
        };

        Ok(Self {
            pattern: rule.pattern.clone(),
            matcher,
            responses: rule.alternatives().into_iter().map(str::to_string).collect(),
            reactions: rule.reactions.clone(),
        })
    }
}

/// Replies to messages matching configured patterns. Only the first
/// matching rule fires for a message.
pub struct ScriptedFeature {
    platform: Arc<dyn PlatformClient>,
    random: Arc<dyn RandomSource>,
    rules: Vec<CompiledRule>,
    bot_user_id: Option<String>,
}

impl ScriptedFeature {
    pub fn new(platform: Arc<dyn PlatformClient>, random: Arc<dyn RandomSource>) -> Self {
        Self {
            platform,
            random,
            rules: Vec::new(),
            bot_user_id: None,
        }
    }

    fn first_match(&self, text: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| rule.matcher.matches(text))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[async_trait]
impl Feature for ScriptedFeature {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn reconfigure(&mut self, config: &ConfigSnapshot) {
        self.bot_user_id = config.platform.bot_user_id.clone();
        self.rules = config
            .scripted
            .rules
            .iter()
            .filter_map(|rule| match CompiledRule::compile(rule) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("Skipping scripted rule: {:#}", e);
                    None
                }
            })
            .collect();
        info!("Loaded {} scripted responses", self.rules.len());
    }

    fn rate_limits(&self, config: &ConfigSnapshot) -> (RateLimitSettings, Option<RateLimitSettings>) {
        (config.scripted.rate_limit, None)
    }

    fn triage(&mut self, event: &Event) -> Option<Lane> {
        if event.kind == EventKind::MemberJoinedChannel {
            return None;
        }
        if self.bot_user_id.as_deref() == Some(event.user_id.as_str()) {
            return None;
        }
        self.first_match(&event.text).map(|_| Lane::Ordinary)
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        let Some(rule) = self.first_match(&event.text) else {
            return Ok(());
        };
        debug!("Scripted rule '{}' matched message {}", rule.pattern, event.message_id);

        for reaction in &rule.reactions {
            if let Err(e) = self
                .platform
                .add_reaction(&event.channel_id, &event.message_id, reaction)
                .await
            {
                warn!(
                    "Failed to add reaction '{}' on {}: {:#}",
                    reaction,
                    self.platform.platform_name(),
                    e
                );
            }
        }

        if let Some(template) = pick(self.random.as_ref(), &rule.responses) {
            let text = template.replace("{user}", &mention(&event.user_id));
            self.platform
                .post_message(&event.channel_id, &text)
                .await
                .context("Failed to post scripted response")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::processor::FeatureProcessor;
    use crate::bot::random::testing::ScriptedRandom;
    use crate::config::ConfigLayer;
    use crate::platforms::testing::{Call, RecordingPlatform};
    use std::time::Duration;

    fn rule(pattern: &str, regex: bool, responses: &[&str], reactions: &[&str]) -> ScriptedRule {
        ScriptedRule {
            pattern: pattern.to_string(),
            regex,
            response: None,
            responses: responses.iter().map(|s| s.to_string()).collect(),
            reactions: reactions.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn snapshot(rules: Vec<ScriptedRule>) -> ConfigSnapshot {
        let layer = ConfigLayer {
            scripted_responses: Some(rules),
            ..Default::default()
        };
        ConfigSnapshot::build(&ConfigLayer::default(), &layer)
    }

    fn feature(platform: Arc<RecordingPlatform>, rules: Vec<ScriptedRule>) -> ScriptedFeature {
        let mut feature = ScriptedFeature::new(platform, Arc::new(ScriptedRandom::constant(0.0)));
        feature.reconfigure(&snapshot(rules));
        feature
    }

    fn message(text: &str, id: &str) -> Event {
        Event::new(EventKind::Message, "U1", "C1", text, id)
    }

    #[tokio::test]
    async fn test_exact_match_is_case_insensitive_and_first_wins() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = feature(
            platform.clone(),
            vec![
                rule("hello", false, &["Hi {user}!"], &[]),
                rule("hel+o", true, &["second rule"], &[]),
            ],
        );

        let event = message("Hello", "1");
        assert_eq!(feature.triage(&event), Some(Lane::Ordinary));
        feature.handle(event).await.unwrap();

        assert_eq!(platform.posts(), vec!["Hi <@U1>!".to_string()]);
    }

    #[tokio::test]
    async fn test_exact_match_needs_whole_message() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = feature(platform.clone(), vec![rule("hello", false, &["hi"], &[])]);

        assert!(feature.triage(&message("  HELLO \n", "1")).is_some());
        assert!(feature.triage(&message("hello there", "2")).is_none());
    }

    #[tokio::test]
    async fn test_regex_rule_with_reactions_and_alternatives() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = ScriptedFeature::new(platform.clone(), Arc::new(ScriptedRandom::new([0.9])));
        feature.reconfigure(&snapshot(vec![rule(r"\bship\s*it\b", true, &["one", "two"], &["ship"])]));

        let event = message("ok SHIP IT now", "7");
        assert!(feature.triage(&event).is_some());
        feature.handle(event).await.unwrap();

        assert_eq!(
            platform.calls(),
            vec![
                Call::React {
                    channel: "C1".to_string(),
                    message_id: "7".to_string(),
                    reaction: "ship".to_string(),
                },
                Call::Post {
                    channel: "C1".to_string(),
                    text: "two".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_reaction_still_replies() {
        let platform = Arc::new(RecordingPlatform::failing_reactions());
        let mut feature = ScriptedFeature::new(platform.clone(), Arc::new(ScriptedRandom::constant(0.0)));
        feature.reconfigure(&snapshot(vec![rule("hello", false, &["hi {user}"], &["wave", "tada"])]));

        feature.handle(message("hello", "8")).await.unwrap();

        assert_eq!(platform.count(|c| matches!(c, Call::React { .. })), 2);
        assert_eq!(platform.posts(), vec!["hi <@U1>".to_string()]);
    }

    #[tokio::test]
    async fn test_ignores_joins_and_own_messages() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = ScriptedFeature::new(platform, Arc::new(ScriptedRandom::constant(0.0)));
        let layer = ConfigLayer {
            scripted_responses: Some(vec![rule("hello", false, &["hi"], &[])]),
            platform: crate::config::PlatformLayer {
                bot_user_id: Some("UBOT".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        feature.reconfigure(&ConfigSnapshot::build(&ConfigLayer::default(), &layer));

        assert!(feature
            .triage(&Event::new(EventKind::MemberJoinedChannel, "U1", "C1", "hello", "1"))
            .is_none());
        assert!(feature.triage(&Event::new(EventKind::Message, "UBOT", "C1", "hello", "2")).is_none());
    }

    #[tokio::test]
    async fn test_invalid_override_rule_skipped() {
        let platform = Arc::new(RecordingPlatform::new());
        let feature = feature(
            platform,
            vec![rule("(broken", true, &["x"], &[]), rule("ok", false, &["y"], &[])],
        );
        assert_eq!(feature.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_one_reply_through_processor_for_duplicate_delivery() {
        let platform = Arc::new(RecordingPlatform::new());
        let config = Arc::new(snapshot(vec![rule("hello", false, &["hi"], &[])]));
        let processor = FeatureProcessor::new(
            Box::new(ScriptedFeature::new(platform.clone(), Arc::new(ScriptedRandom::constant(0.0)))),
            config,
        );
        processor.start();

        processor.push_event(message("Hello", "1"));
        processor.push_event(message("Hello", "1"));
        processor.push_event(message("unrelated", "2"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(platform.posts().len(), 1);
        processor.stop();
        processor.join().await;
    }
}
