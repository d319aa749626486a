// src/bot/moderation.rs - Roulette moderation: probabilistic bans with timed reinvites

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bot::ban_registry::{BanOutcome, BanRegistry};
use crate::bot::processor::Feature;
use crate::bot::random::RandomSource;
use crate::bot::rate_limit::Lane;
use crate::bot::scheduler::DelayedTasks;
use crate::config::{ConfigSnapshot, ModerationSettings, RateLimitSettings, DEFAULT_TRIGGER_PATTERN};
use crate::platforms::PlatformClient;
use crate::types::{mention, Event, EventKind};

/// Human-readable "4m 30s" style duration
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs().max(1);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if seconds > 0 {
        parts.push(format!("{}s", seconds));
    }
    parts.join(" ")
}

/// Counts from one ban/reinvite sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reinvited: usize,
    pub failed: usize,
    pub collected: usize,
}

/// Reinvite every expired ban once, then garbage-collect old reinvited records.
///
/// Claimed records stay claimed even when the reinvite call fails.
pub async fn sweep(
    registry: &BanRegistry,
    platform: &dyn PlatformClient,
    now: DateTime<Utc>,
    retention: Duration,
) -> SweepReport {
    let mut report = SweepReport::default();

    for record in registry.claim_expired(now) {
        match platform.invite_user(&record.channel_id, &record.user_id).await {
            Ok(()) => {
                info!("Reinvited {} to {}", record.user_id, record.channel_id);
                report.reinvited += 1;
            }
            Err(e) => {
                error!(
                    "Failed to reinvite {} to {}: {:#}",
                    record.user_id, record.channel_id, e
                );
                report.failed += 1;
            }
        }
    }

    report.collected = registry.collect_garbage(now, retention);
    report
}

async fn sweep_loop(
    registry: Arc<BanRegistry>,
    platform: Arc<dyn PlatformClient>,
    mut stop: watch::Receiver<bool>,
    config: watch::Receiver<Arc<ConfigSnapshot>>,
) {
    if *stop.borrow_and_update() {
        return;
    }

    loop {
        let interval = config.borrow().moderation.sweep_interval;
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {
                let retention = config.borrow().moderation.retention;
                let report = sweep(&registry, platform.as_ref(), Utc::now(), retention).await;
                if report != SweepReport::default() {
                    debug!("Ban sweep: {:?}", report);
                }
            }
        }
    }
    debug!("Ban sweep loop stopped");
}

/// `!roulette`-style moderation. A trigger rolls against the survival
/// chance; losers are banned for a while and kicked after a short delay.
pub struct ModerationFeature {
    platform: Arc<dyn PlatformClient>,
    random: Arc<dyn RandomSource>,
    registry: Arc<BanRegistry>,
    scheduler: Arc<DelayedTasks>,
    trigger: Regex,
    settings: ModerationSettings,
    bot_user_id: Option<String>,
}

impl ModerationFeature {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        random: Arc<dyn RandomSource>,
        registry: Arc<BanRegistry>,
        scheduler: Arc<DelayedTasks>,
    ) -> Result<Self> {
        let defaults = ConfigSnapshot::default();
        Ok(Self {
            platform,
            random,
            registry,
            scheduler,
            trigger: Regex::new(DEFAULT_TRIGGER_PATTERN).context("Default moderation trigger is invalid")?,
            settings: defaults.moderation,
            bot_user_id: None,
        })
    }

    pub fn registry(&self) -> &Arc<BanRegistry> {
        &self.registry
    }

    fn is_exempt(&self, user_id: &str) -> bool {
        self.settings.exempt_users.iter().any(|u| u == user_id)
    }

    async fn enforce_rejoin(&self, event: &Event) -> Result<()> {
        let Some(remaining) = self
            .registry
            .remaining(&event.user_id, &event.channel_id, Utc::now())
        else {
            return Ok(());
        };

        info!(
            "{} rejoined {} while banned, kicking again",
            event.user_id, event.channel_id
        );
        let kicked = self.platform.kick_user(&event.channel_id, &event.user_id).await;

        self.platform
            .post_message(
                &event.channel_id,
                &format!(
                    "Nice try {}. You're still banned for another {}.",
                    mention(&event.user_id),
                    format_duration(remaining)
                ),
            )
            .await
            .context("Failed to post rejoin notice")?;

        kicked.context("Failed to re-kick banned user")
    }

    async fn play(&self, event: &Event) -> Result<()> {
        let who = mention(&event.user_id);

        if self.is_exempt(&event.user_id) {
            return self
                .platform
                .post_message(&event.channel_id, &format!("{} spins the cylinder... but the house always wins. You're exempt.", who))
                .await
                .context("Failed to post exemption notice");
        }

        if self.random.bool(self.settings.survival_chance) {
            return self
                .platform
                .post_message(&event.channel_id, &format!("*click* {} lives to chat another day.", who))
                .await
                .context("Failed to post survival message");
        }

        let outcome = self.registry.ban(
            &event.user_id,
            &event.channel_id,
            Utc::now(),
            self.settings.ban_duration,
        );
        let record = match outcome {
            BanOutcome::Created(record) => record,
            BanOutcome::AlreadyBanned(record) => {
                debug!("{} already banned until {}", record.user_id, record.reinvite_at);
                return Ok(());
            }
        };

        // The record exists before the kick goes out, and the kick does not
        // depend on the announcement getting through
        let platform = self.platform.clone();
        let scheduled = self.scheduler.schedule(self.settings.kick_delay, async move {
            if let Err(e) = platform.kick_user(&record.channel_id, &record.user_id).await {
                error!(
                    "Failed to kick {} from {}: {:#}",
                    record.user_id, record.channel_id, e
                );
            }
        });
        if !scheduled {
            warn!("Kick for {} not scheduled, moderation is shutting down", event.user_id);
        }

        self.platform
            .post_message(
                &event.channel_id,
                &format!(
                    "*BANG* {} is out for {}.",
                    who,
                    format_duration(self.settings.ban_duration)
                ),
            )
            .await
            .context("Failed to post ban announcement")?;

        Ok(())
    }
}

#[async_trait]
impl Feature for ModerationFeature {
    fn name(&self) -> &'static str {
        "moderation"
    }

    fn reconfigure(&mut self, config: &ConfigSnapshot) {
        match Regex::new(&config.moderation.trigger_pattern) {
            Ok(trigger) => self.trigger = trigger,
            Err(e) => warn!(
                "Keeping previous moderation trigger, '{}' is invalid: {}",
                config.moderation.trigger_pattern, e
            ),
        }
        self.settings = config.moderation.clone();
        self.bot_user_id = config.platform.bot_user_id.clone();
    }

    fn rate_limits(&self, config: &ConfigSnapshot) -> (RateLimitSettings, Option<RateLimitSettings>) {
        (config.moderation.rate_limit, None)
    }

    fn triage(&mut self, event: &Event) -> Option<Lane> {
        if self.bot_user_id.as_deref() == Some(event.user_id.as_str()) {
            return None;
        }

        match event.kind {
            EventKind::MemberJoinedChannel => self
                .registry
                .is_banned(&event.user_id, &event.channel_id, Utc::now())
                .then_some(Lane::Unlimited),
            EventKind::Message | EventKind::AppMention => {
                self.trigger.is_match(&event.text).then_some(Lane::Ordinary)
            }
        }
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        match event.kind {
            EventKind::MemberJoinedChannel => self.enforce_rejoin(&event).await,
            EventKind::Message | EventKind::AppMention => self.play(&event).await,
        }
    }

    fn spawn_background(
        &self,
        stop: watch::Receiver<bool>,
        config: watch::Receiver<Arc<ConfigSnapshot>>,
    ) -> Option<JoinHandle<()>> {
        Some(tokio::spawn(sweep_loop(
            self.registry.clone(),
            self.platform.clone(),
            stop,
            config,
        )))
    }

    fn shutdown(&mut self) {
        let pending = self.scheduler.pending();
        if pending > 0 {
            info!("Cancelling {} pending kicks", pending);
        }
        self.scheduler.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::processor::FeatureProcessor;
    use crate::bot::random::testing::ScriptedRandom;
    use crate::config::{ConfigLayer, ModerationLayer, PlatformLayer};
    use crate::platforms::testing::{Call, RecordingPlatform};
    use chrono::Duration as ChronoDuration;

    fn snapshot(survival: f64, exempt: &[&str]) -> ConfigSnapshot {
        let layer = ConfigLayer {
            platform: PlatformLayer {
                bot_user_id: Some("UBOT".to_string()),
                ..Default::default()
            },
            moderation: ModerationLayer {
                survival_chance: Some(survival),
                exempt_users: Some(exempt.iter().map(|s| s.to_string()).collect()),
                kick_delay_ms: Some(20),
                ban_duration_secs: Some(300),
                sweep_interval_secs: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        ConfigSnapshot::build(&ConfigLayer::default(), &layer)
    }

    fn moderation(platform: Arc<RecordingPlatform>, roll: f64, config: &ConfigSnapshot) -> ModerationFeature {
        let mut feature = ModerationFeature::new(
            platform,
            Arc::new(ScriptedRandom::constant(roll)),
            Arc::new(BanRegistry::in_memory()),
            Arc::new(DelayedTasks::new()),
        )
        .unwrap();
        feature.reconfigure(config);
        feature
    }

    fn roulette(user: &str) -> Event {
        Event::new(EventKind::Message, user, "C1", "!roulette", "1")
    }

    fn kicks(platform: &RecordingPlatform) -> usize {
        platform.count(|c| matches!(c, Call::Kick { .. }))
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(format_duration(Duration::from_millis(10)), "1s");
    }

    #[test]
    fn test_triage() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = moderation(platform, 0.0, &snapshot(0.5, &[]));

        assert_eq!(feature.triage(&roulette("U1")), Some(Lane::Ordinary));
        assert_eq!(feature.triage(&roulette("UBOT")), None);
        assert_eq!(feature.triage(&Event::new(EventKind::Message, "U1", "C1", "say !roulette", "2")), None);

        let join = Event::new(EventKind::MemberJoinedChannel, "U1", "C1", "", "3");
        assert_eq!(feature.triage(&join), None);
        feature.registry().ban("U1", "C1", Utc::now(), Duration::from_secs(60));
        assert_eq!(feature.triage(&join), Some(Lane::Unlimited));
    }

    #[tokio::test]
    async fn test_survivor_is_not_banned() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = moderation(platform.clone(), 0.1, &snapshot(0.5, &[]));

        feature.handle(roulette("U1")).await.unwrap();
        assert!(feature.registry().is_empty());
        assert!(platform.posts()[0].starts_with("*click*"));
    }

    #[tokio::test]
    async fn test_kick_goes_out_when_announcement_fails() {
        let platform = Arc::new(RecordingPlatform::failing_posts());
        let mut feature = moderation(platform.clone(), 0.99, &snapshot(0.5, &[]));

        assert!(feature.handle(roulette("U1")).await.is_err());
        assert!(feature.registry().is_banned("U1", "C1", Utc::now()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(kicks(&platform), 1);
    }

    #[tokio::test]
    async fn test_loser_banned_then_kicked_after_delay() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = moderation(platform.clone(), 0.9, &snapshot(0.5, &[]));

        feature.handle(roulette("U1")).await.unwrap();
        assert!(feature.registry().is_banned("U1", "C1", Utc::now()));
        assert!(platform.posts()[0].contains("is out for 5m"));
        assert_eq!(kicks(&platform), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(kicks(&platform), 1);

        // Second loss while banned changes nothing
        feature.handle(roulette("U1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(kicks(&platform), 1);
        assert_eq!(platform.posts().len(), 1);
    }

    #[tokio::test]
    async fn test_exempt_user_never_banned() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = moderation(platform.clone(), 0.99, &snapshot(0.0, &["UADMIN"]));

        feature.handle(roulette("UADMIN")).await.unwrap();
        assert!(feature.registry().is_empty());
        assert!(platform.posts()[0].contains("exempt"));
    }

    #[tokio::test]
    async fn test_rejoin_while_banned_kicks_immediately() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut feature = moderation(platform.clone(), 0.0, &snapshot(0.5, &[]));
        let before = feature
            .registry()
            .ban("U1", "C1", Utc::now(), Duration::from_secs(120))
            .record()
            .reinvite_at;

        feature
            .handle(Event::new(EventKind::MemberJoinedChannel, "U1", "C1", "", "9"))
            .await
            .unwrap();

        assert_eq!(kicks(&platform), 1);
        assert!(platform.posts()[0].contains("still banned"));
        assert_eq!(feature.registry().get("U1", "C1").unwrap().reinvite_at, before);
    }

    #[tokio::test]
    async fn test_sweep_reinvites_once_and_collects() {
        let registry = BanRegistry::in_memory();
        let platform = RecordingPlatform::new();
        let t0 = Utc::now();
        registry.ban("U1", "C1", t0, Duration::from_secs(300));
        let retention = Duration::from_secs(3600);

        let early = sweep(&registry, &platform, t0 + ChronoDuration::seconds(100), retention).await;
        assert_eq!(early, SweepReport::default());

        for offset in [300, 310, 320] {
            sweep(&registry, &platform, t0 + ChronoDuration::seconds(offset), retention).await;
        }
        assert_eq!(platform.count(|c| matches!(c, Call::Invite { .. })), 1);

        let late = sweep(&registry, &platform, t0 + ChronoDuration::seconds(300 + 3601), retention).await;
        assert_eq!(late.collected, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_reinvite_not_retried() {
        let registry = BanRegistry::in_memory();
        let platform = RecordingPlatform::failing_invites();
        let t0 = Utc::now();
        registry.ban("U1", "C1", t0, Duration::from_secs(1));

        let first = sweep(&registry, &platform, t0 + ChronoDuration::seconds(2), Duration::from_secs(3600)).await;
        assert_eq!(first.failed, 1);
        sweep(&registry, &platform, t0 + ChronoDuration::seconds(3), Duration::from_secs(3600)).await;
        assert_eq!(platform.count(|c| matches!(c, Call::Invite { .. })), 1);
    }

    #[tokio::test]
    async fn test_background_sweep_runs_with_processor() {
        let platform = Arc::new(RecordingPlatform::new());
        let registry = Arc::new(BanRegistry::in_memory());
        registry.ban("U1", "C1", Utc::now() - ChronoDuration::seconds(600), Duration::from_secs(300));

        let config = Arc::new(snapshot(0.5, &[]));
        let feature = ModerationFeature::new(
            platform.clone(),
            Arc::new(ScriptedRandom::constant(0.0)),
            registry.clone(),
            Arc::new(DelayedTasks::new()),
        )
        .unwrap();
        let processor = FeatureProcessor::new(Box::new(feature), config);
        processor.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(platform.count(|c| matches!(c, Call::Invite { .. })), 1);
        assert!(registry.get("U1", "C1").unwrap().reinvited);

        processor.stop();
        tokio::time::timeout(Duration::from_secs(2), processor.join()).await.unwrap();
    }
}
