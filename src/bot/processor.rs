// src/bot/processor.rs - Shared skeleton for feature processors: queue, consumer loop, lifecycle

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bot::queue::{EventQueue, PushOutcome};
use crate::bot::rate_limit::{Deduplicator, Lane, RateLimits};
use crate::config::{ConfigSnapshot, RateLimitSettings};
use crate::types::Event;

/// Feature-specific behavior plugged into a [`FeatureProcessor`].
///
/// All methods except `spawn_background` run on the processor's consumer
/// loop, which owns the feature exclusively.
#[async_trait]
pub trait Feature: Send + 'static {
    fn name(&self) -> &'static str;

    /// Adopt a new configuration snapshot
    fn reconfigure(&mut self, config: &ConfigSnapshot);

    /// Ordinary bucket and optional direct-reply bucket for this feature
    fn rate_limits(&self, config: &ConfigSnapshot) -> (RateLimitSettings, Option<RateLimitSettings>);

    /// Decide whether the event is a trigger for this feature and which
    /// bucket it is charged to. `None` ignores the event.
    fn triage(&mut self, event: &Event) -> Option<Lane>;

    /// Feature logic and external calls for one accepted event
    async fn handle(&mut self, event: Event) -> Result<()>;

    /// Extra long-lived loop tied to the processor lifetime
    fn spawn_background(
        &self,
        _stop: watch::Receiver<bool>,
        _config: watch::Receiver<Arc<ConfigSnapshot>>,
    ) -> Option<JoinHandle<()>> {
        None
    }

    /// Called once when the consumer loop exits
    fn shutdown(&mut self) {}
}

/// Anything the dispatcher can hand events to
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;
    fn push_event(&self, event: Event) -> PushOutcome;
}

struct Idle {
    feature: Box<dyn Feature>,
    rx: mpsc::Receiver<Event>,
}

/// Bounded queue plus a dedicated consumer loop for one feature.
///
/// Per event the loop runs dedup → triage → rate limit → feature logic,
/// in order and without interleaving other events of this feature.
pub struct FeatureProcessor {
    name: &'static str,
    queue: EventQueue,
    config_tx: watch::Sender<Arc<ConfigSnapshot>>,
    stop_tx: watch::Sender<bool>,
    idle: Mutex<Option<Idle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FeatureProcessor {
    pub fn new(feature: Box<dyn Feature>, config: Arc<ConfigSnapshot>) -> Self {
        let name = feature.name();
        let (queue, rx) = EventQueue::bounded(name, config.queue_capacity);
        let (config_tx, _) = watch::channel(config);
        let (stop_tx, _) = watch::channel(false);

        Self {
            name,
            queue,
            config_tx,
            stop_tx,
            idle: Mutex::new(Some(Idle { feature, rx })),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Open the queue and launch the consumer loop (and any background loop).
    ///
    /// A processor runs at most once; starting it again, or after `stop`, is a no-op.
    pub fn start(&self) {
        if *self.stop_tx.borrow() {
            warn!("[{}] cannot start a stopped processor", self.name);
            return;
        }
        let Some(Idle { feature, rx }) = lock(&self.idle).take() else {
            debug!("[{}] already started", self.name);
            return;
        };

        let mut tasks = lock(&self.tasks);
        if let Some(handle) = feature.spawn_background(self.stop_tx.subscribe(), self.config_tx.subscribe()) {
            tasks.push(handle);
        }

        tasks.push(tokio::spawn(consume(
            feature,
            rx,
            self.stop_tx.subscribe(),
            self.config_tx.subscribe(),
        )));

        self.queue.open();
        info!("[{}] processor started", self.name);
    }

    /// Close the queue and signal every loop to exit. Idempotent, never blocks.
    pub fn stop(&self) {
        self.queue.close();
        if !self.stop_tx.send_replace(true) {
            info!("[{}] processor stopping", self.name);
        }
    }

    /// Wait for the processor's loops to exit
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("[{}] task ended abnormally: {}", self.name, e);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.queue.is_open()
    }

    /// Swap in a new configuration snapshot; the consumer loop picks it up
    /// before its next event.
    pub fn apply_config(&self, config: Arc<ConfigSnapshot>) {
        self.config_tx.send_replace(config);
    }

    pub fn push_event(&self, event: Event) -> PushOutcome {
        self.queue.push(event)
    }

    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }
}

impl EventSink for FeatureProcessor {
    fn name(&self) -> &str {
        self.name
    }

    fn push_event(&self, event: Event) -> PushOutcome {
        FeatureProcessor::push_event(self, event)
    }
}

impl Drop for FeatureProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn consume(
    mut feature: Box<dyn Feature>,
    mut rx: mpsc::Receiver<Event>,
    mut stop: watch::Receiver<bool>,
    mut config: watch::Receiver<Arc<ConfigSnapshot>>,
) {
    let name = feature.name();
    let snapshot = config.borrow_and_update().clone();
    feature.reconfigure(&snapshot);
    let (ordinary, direct) = feature.rate_limits(&snapshot);
    let mut limits = RateLimits::new(ordinary, direct);
    let mut dedup = Deduplicator::default();

    // Stop only ever moves false -> true, so any change means exit
    let mut stopping = *stop.borrow_and_update();

    while !stopping {
        tokio::select! {
            biased;

            _ = stop.changed() => stopping = true,

            changed = config.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = config.borrow_and_update().clone();
                feature.reconfigure(&snapshot);
                let (ordinary, direct) = feature.rate_limits(&snapshot);
                limits.reconfigure(ordinary, direct);
                debug!("[{}] applied new configuration", name);
            }

            event = rx.recv() => {
                let Some(event) = event else { break };
                process(feature.as_mut(), &mut dedup, &mut limits, event).await;
            }
        }
    }

    feature.shutdown();
    info!("[{}] processor stopped", name);
}

async fn process(feature: &mut dyn Feature, dedup: &mut Deduplicator, limits: &mut RateLimits, event: Event) {
    let name = feature.name();
    let now = Instant::now();

    if !dedup.first_seen(event.dedup_key(), now) {
        debug!("[{}] duplicate delivery of {} ignored", name, event.message_id);
        return;
    }

    let Some(lane) = feature.triage(&event) else {
        return;
    };

    if !limits.check(lane, now) {
        debug!("[{}] rate limited {} in {}", name, event.user_id, event.channel_id);
        return;
    }

    let (user, channel) = (event.user_id.clone(), event.channel_id.clone());
    if let Err(e) = feature.handle(event).await {
        error!("[{}] failed handling event from {} in {}: {:#}", name, user, channel, e);
    }
}
