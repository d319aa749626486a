// src/config/manager.rs - Hot-reloading owner of the effective configuration

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::watcher::{ChangeSource, ChangeTick};
use super::{ConfigError, ConfigLayer, ConfigOverrides, ConfigSnapshot};

/// Failures in a row before a broken file is reported at error level
const ESCALATE_AFTER_FAILURES: u32 = 3;

type Callback = Arc<dyn Fn(Arc<ConfigSnapshot>) + Send + Sync>;

/// Timing knobs for file change handling
#[derive(Debug, Clone, Copy)]
pub struct ReloadOptions {
    /// How long to wait after a change tick for writes to settle
    pub settle_delay: Duration,
    /// Metadata poll period backing up filesystem notifications
    pub poll_interval: Duration,
}

impl Default for ReloadOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(250),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Owns the current [`ConfigSnapshot`] and republishes it when the
/// override layer or the watched file changes.
///
/// Readers never block: `get_config` clones an `Arc` out of a watch channel.
pub struct ConfigManager {
    path: Option<PathBuf>,
    overrides: Mutex<ConfigOverrides>,
    file_layer: Mutex<ConfigLayer>,
    current: watch::Sender<Arc<ConfigSnapshot>>,
    subscribers: Mutex<HashMap<u64, Callback>>,
    next_subscriber: AtomicU64,
    consecutive_failures: AtomicU32,
    options: ReloadOptions,
    stop_tx: watch::Sender<bool>,
    source: Mutex<Option<ChangeSource>>,
    reload_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle returned by [`ConfigManager::subscribe`].
///
/// Dropping the handle leaves the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    manager: Weak<ConfigManager>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(manager) = self.manager.upgrade() {
            lock(&manager.subscribers).remove(&self.id);
            debug!("Config subscriber {} removed", self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConfigManager {
    /// Create a manager with default reload timing
    pub async fn new(overrides: ConfigOverrides, path: Option<PathBuf>) -> Arc<Self> {
        Self::with_options(overrides, path, ReloadOptions::default()).await
    }

    /// Create a manager, load the file layer and start watching it.
    ///
    /// A missing or unreadable file at startup is not fatal; the manager
    /// starts from overrides and defaults and picks the file up once it
    /// becomes valid.
    pub async fn with_options(overrides: ConfigOverrides, path: Option<PathBuf>, options: ReloadOptions) -> Arc<Self> {
        let file_layer = match &path {
            Some(p) => Self::initial_layer(p).await,
            None => ConfigLayer::default(),
        };

        let snapshot = Arc::new(ConfigSnapshot::build(&overrides, &file_layer));
        let (current, _) = watch::channel(snapshot);
        let (stop_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            path,
            overrides: Mutex::new(overrides),
            file_layer: Mutex::new(file_layer),
            current,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            consecutive_failures: AtomicU32::new(0),
            options,
            stop_tx,
            source: Mutex::new(None),
            reload_task: Mutex::new(None),
        });

        if let Some(path) = manager.path.clone() {
            manager.start_watching(&path);
        }

        manager
    }

    async fn initial_layer(path: &Path) -> ConfigLayer {
        match ConfigLayer::load(path).await {
            Ok(layer) => {
                info!("Loaded configuration from {}", path.display());
                layer
            }
            Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration file at {}, using defaults", path.display());
                ConfigLayer::default()
            }
            Err(e) => {
                warn!("Ignoring configuration file at startup: {}", e);
                ConfigLayer::default()
            }
        }
    }

    fn start_watching(self: &Arc<Self>, path: &Path) {
        let (tick_tx, tick_rx) = mpsc::channel(16);
        let source = ChangeSource::spawn(path, self.options.poll_interval, tick_tx, self.stop_tx.subscribe());
        *lock(&self.source) = Some(source);

        let task = tokio::spawn(Self::reload_loop(
            Arc::downgrade(self),
            tick_rx,
            self.stop_tx.subscribe(),
            self.options.settle_delay,
        ));
        *lock(&self.reload_task) = Some(task);
    }

    async fn reload_loop(
        manager: Weak<Self>,
        mut ticks: mpsc::Receiver<ChangeTick>,
        mut stop: watch::Receiver<bool>,
        settle_delay: Duration,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                tick = ticks.recv() => {
                    let Some(tick) = tick else { break };
                    debug!("Configuration change tick ({:?})", tick);
                }
            }

            // Let a burst of writes finish, then coalesce the ticks it produced
            tokio::time::sleep(settle_delay).await;
            while ticks.try_recv().is_ok() {}

            if *stop.borrow() {
                break;
            }

            let Some(manager) = manager.upgrade() else { break };
            // Failures are logged inside reload
            let _ = manager.reload().await;
        }
        debug!("Configuration reload loop stopped");
    }

    /// Current effective configuration; never blocks
    pub fn get_config(&self) -> Arc<ConfigSnapshot> {
        self.current.borrow().clone()
    }

    /// Watch channel carrying every published snapshot
    pub fn watch(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.current.subscribe()
    }

    /// Register a callback invoked with each new snapshot.
    ///
    /// Callbacks run on their own task and a panicking callback does not
    /// affect the others.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(Arc<ConfigSnapshot>) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).insert(id, Arc::new(callback));
        Subscription {
            id,
            manager: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Replace the operator override layer and republish
    pub fn set_overrides(&self, overrides: ConfigOverrides) {
        *lock(&self.overrides) = overrides;
        self.rebuild_and_publish();
    }

    /// Re-read the watched file now.
    ///
    /// On failure the previous snapshot stays in effect.
    pub async fn reload(&self) -> Result<Arc<ConfigSnapshot>, ConfigError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.get_config());
        };

        match ConfigLayer::load(path).await {
            Ok(layer) => {
                let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if previous > 0 {
                    info!("Configuration file {} is valid again after {} failed reloads", path.display(), previous);
                }
                *lock(&self.file_layer) = layer;
                Ok(self.rebuild_and_publish())
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= ESCALATE_AFTER_FAILURES {
                    error!("Configuration reload failed {} times in a row: {}", failures, e);
                } else {
                    warn!("Configuration reload failed, keeping previous configuration: {}", e);
                }
                Err(e)
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Build from the current layers and publish if anything changed.
    ///
    /// Building happens under the channel's write lock, so concurrent callers
    /// publish in the order they read the layers and the last one always
    /// reflects the newest layers.
    fn rebuild_and_publish(&self) -> Arc<ConfigSnapshot> {
        let mut published = None;
        self.current.send_if_modified(|current| {
            let snapshot = {
                let overrides = lock(&self.overrides);
                let file_layer = lock(&self.file_layer);
                ConfigSnapshot::build(&overrides, &file_layer)
            };
            if **current == snapshot {
                return false;
            }
            *current = Arc::new(snapshot);
            published = Some(current.clone());
            true
        });

        let Some(snapshot) = published else {
            debug!("Configuration unchanged, nothing to publish");
            return self.get_config();
        };

        log::set_max_level(snapshot.log_level_filter());
        info!("Published new configuration snapshot");
        self.notify_subscribers(&snapshot);
        snapshot
    }

    fn notify_subscribers(&self, snapshot: &Arc<ConfigSnapshot>) {
        let callbacks: Vec<(u64, Callback)> = lock(&self.subscribers)
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        let handle = tokio::runtime::Handle::try_current().ok();
        for (id, callback) in callbacks {
            let snapshot = snapshot.clone();
            let latest = self.current.subscribe();
            let run = move |snapshot: Arc<ConfigSnapshot>| {
                if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                    error!("Config subscriber {} panicked", id);
                }
            };
            match &handle {
                Some(handle) => {
                    // Spawned callbacks may run out of order; hand each the newest snapshot
                    handle.spawn(async move {
                        let newest = latest.borrow().clone();
                        run(newest)
                    });
                }
                None => run(snapshot),
            }
        }
    }

    /// Stop watching the file. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        lock(&self.source).take();
        if let Some(task) = lock(&self.reload_task).take() {
            task.abort();
        }
    }
}

impl Drop for ConfigManager {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}
