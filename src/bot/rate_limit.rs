// src/bot/rate_limit.rs - Token buckets and duplicate suppression for feature pipelines
//
// Both helpers are owned by a single consumer loop, so they take `&mut self`
// and an explicit `now` instead of locking or reading the clock themselves.

use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RateLimitSettings;
use crate::types::DedupKey;

/// Trailing window during which a repeated (user, channel, message-id) is ignored
pub const DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Which bucket an event is charged against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Ambient triggers
    Ordinary,
    /// Explicit mentions / direct replies
    Direct,
    /// Never rate limited (e.g. enforcement on rejoin)
    Unlimited,
}

/// Classic token bucket: holds up to `burst` tokens, regains one every `refill`
#[derive(Debug, Clone)]
pub struct TokenBucket {
    burst: u32,
    refill: Duration,
    tokens: u32,
    last_refill: Option<Instant>,
}

impl TokenBucket {
    pub fn new(settings: RateLimitSettings) -> Self {
        let burst = settings.burst.max(1);
        Self {
            burst,
            refill: settings.refill,
            tokens: burst,
            last_refill: None,
        }
    }

    /// Take one token if available
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill_to(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill_to(now);
        self.tokens
    }

    /// Adopt new limits, keeping already-spent tokens spent
    pub fn reconfigure(&mut self, settings: RateLimitSettings) {
        self.burst = settings.burst.max(1);
        self.refill = settings.refill;
        self.tokens = self.tokens.min(self.burst);
    }

    fn refill_to(&mut self, now: Instant) {
        let Some(last) = self.last_refill else {
            self.last_refill = Some(now);
            return;
        };

        if self.tokens >= self.burst {
            self.last_refill = Some(now);
            return;
        }

        if self.refill.is_zero() {
            self.tokens = self.burst;
            self.last_refill = Some(now);
            return;
        }

        let elapsed = now.saturating_duration_since(last);
        let earned = (elapsed.as_nanos() / self.refill.as_nanos()) as u64;
        if earned == 0 {
            return;
        }

        let missing = u64::from(self.burst - self.tokens);
        if earned >= missing {
            self.tokens = self.burst;
            self.last_refill = Some(now);
        } else {
            self.tokens += earned as u32;
            // Carry the partial interval forward
            self.last_refill = Some(last + self.refill * earned as u32);
        }
    }
}

/// The buckets a feature charges its events against
#[derive(Debug, Clone)]
pub struct RateLimits {
    ordinary: TokenBucket,
    direct: Option<TokenBucket>,
}

impl RateLimits {
    pub fn new(ordinary: RateLimitSettings, direct: Option<RateLimitSettings>) -> Self {
        Self {
            ordinary: TokenBucket::new(ordinary),
            direct: direct.map(TokenBucket::new),
        }
    }

    /// Charge one event; `false` means it must be dropped.
    ///
    /// Features without a direct bucket charge direct events to the ordinary one.
    pub fn check(&mut self, lane: Lane, now: Instant) -> bool {
        match lane {
            Lane::Unlimited => true,
            Lane::Direct => match self.direct.as_mut() {
                Some(bucket) => bucket.try_acquire(now),
                None => self.ordinary.try_acquire(now),
            },
            Lane::Ordinary => self.ordinary.try_acquire(now),
        }
    }

    pub fn reconfigure(&mut self, ordinary: RateLimitSettings, direct: Option<RateLimitSettings>) {
        self.ordinary.reconfigure(ordinary);
        match (self.direct.as_mut(), direct) {
            (Some(bucket), Some(settings)) => bucket.reconfigure(settings),
            (_, settings) => self.direct = settings.map(TokenBucket::new),
        }
    }
}

/// Suppresses repeated deliveries of the same message within a trailing window.
///
/// Expired entries are swept on insert, so memory stays bounded without a timer.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    seen: HashMap<DedupKey, Instant>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Record `key` and report whether it is new within the window
    pub fn first_seen(&mut self, key: DedupKey, now: Instant) -> bool {
        let window = self.window;
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
        let swept = before - self.seen.len();
        if swept > 0 {
            debug!("Dedup swept {} expired entries", swept);
        }

        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
