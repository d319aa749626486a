// src/config/watcher.rs - Change detection for the watched configuration file

use log::{debug, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Where a change notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTick {
    Notified,
    Polled,
}

/// Last-seen state of the file used by the poll fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

async fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(Fingerprint {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

/// Emits a tick whenever the configuration file may have changed.
///
/// Filesystem notifications are the primary source; a periodic metadata
/// poll backs them up on filesystems where notify is unreliable. Ticks are
/// hints only and the consumer is expected to debounce them.
pub struct ChangeSource {
    _watcher: Option<RecommendedWatcher>,
    poll_task: JoinHandle<()>,
}

impl ChangeSource {
    pub fn spawn(
        path: &Path,
        poll_interval: Duration,
        ticks: mpsc::Sender<ChangeTick>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let watcher = match Self::start_notify(path, ticks.clone()) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(
                    "File notifications unavailable for {} ({}), relying on polling",
                    path.display(),
                    e
                );
                None
            }
        };

        let poll_task = tokio::spawn(Self::poll_loop(path.to_path_buf(), poll_interval, ticks, stop));

        info!("Watching configuration file {}", path.display());
        Self {
            _watcher: watcher,
            poll_task,
        }
    }

    fn start_notify(path: &Path, ticks: mpsc::Sender<ChangeTick>) -> notify::Result<RecommendedWatcher> {
        let file_name = path.file_name().map(|n| n.to_os_string());
        // Editors often replace the file via rename, so watch the directory
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    debug!("File watch error: {}", e);
                    return;
                }
            };

            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }

            let relevant = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| Some(n.to_os_string()) == file_name).unwrap_or(false));

            if relevant {
                // A full channel already has a pending tick
                let _ = ticks.try_send(ChangeTick::Notified);
            }
        })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    async fn poll_loop(
        path: PathBuf,
        interval: Duration,
        ticks: mpsc::Sender<ChangeTick>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut last = fingerprint(&path).await;
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = timer.tick() => {
                    let current = fingerprint(&path).await;
                    if current != last {
                        debug!("Poll detected change to {}", path.display());
                        last = current;
                        if ticks.send(ChangeTick::Polled).await.is_err() {
                            break;
                        }
                    }
                }
            }

            if *stop.borrow() {
                break;
            }
        }
    }
}

impl Drop for ChangeSource {
    fn drop(&mut self) {
        self.poll_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_detects_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.yaml");
        std::fs::write(&path, "log_level: info\n").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _source = ChangeSource::spawn(&path, Duration::from_millis(50), tx, stop_rx);

        tokio::time::sleep(Duration::from_millis(120)).await;
        std::fs::write(&path, "log_level: debug # changed\n").unwrap();

        let tick = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(tick.is_some());
    }

    #[tokio::test]
    async fn test_stop_ends_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.yaml");

        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let source = ChangeSource::spawn(&path, Duration::from_millis(20), tx, stop_rx);

        stop_tx.send(true).unwrap();
        drop(source);

        // Every sender is gone once the poll task and watcher are torn down
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }
}
