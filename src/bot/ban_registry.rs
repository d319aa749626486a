// src/bot/ban_registry.rs - Durable ban / reinvite bookkeeping for the moderation feature

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// One (user, channel) ban
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub user_id: String,
    pub channel_id: String,
    pub kicked_at: DateTime<Utc>,
    pub reinvite_at: DateTime<Utc>,
    pub reinvited: bool,
}

impl BanRecord {
    pub fn key(&self) -> String {
        record_key(&self.user_id, &self.channel_id)
    }

    /// Still serving the ban at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.reinvited && now < self.reinvite_at
    }

    /// Ban elapsed but the reinvite has not been issued
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.reinvited && now >= self.reinvite_at
    }
}

fn record_key(user_id: &str, channel_id: &str) -> String {
    format!("{}:{}", user_id, channel_id)
}

/// Longest span a ban or retention window is stretched to
const MAX_SPAN: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration.min(MAX_SPAN)).unwrap_or_else(|_| ChronoDuration::days(100 * 365))
}

/// Result of [`BanRegistry::ban`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanOutcome {
    Created(BanRecord),
    /// The user was already serving a ban; the existing record is untouched
    AlreadyBanned(BanRecord),
}

impl BanOutcome {
    pub fn record(&self) -> &BanRecord {
        match self {
            BanOutcome::Created(r) | BanOutcome::AlreadyBanned(r) => r,
        }
    }
}

/// Map of (user, channel) bans guarded by one mutex and mirrored to a JSON file.
///
/// Memory is authoritative. Every mutation rewrites the whole file; a failed
/// write is logged and the in-memory change stands.
pub struct BanRegistry {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, BanRecord>>,
}

impl BanRegistry {
    /// Registry that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the registry from `path`. A missing or corrupt file yields an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match Self::read_file(&path) {
            Ok(records) => {
                if !records.is_empty() {
                    info!("Loaded {} ban records from {}", records.len(), path.display());
                }
                records
            }
            Err(e) => {
                warn!("Starting with an empty ban registry: {:#}", e);
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            records: Mutex::new(records),
        }
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, BanRecord>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read ban registry {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw)
            .with_context(|| format!("Ban registry {} is corrupt", path.display()))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, BanRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ban `user_id` in `channel_id` for `duration` starting at `now`
    pub fn ban(&self, user_id: &str, channel_id: &str, now: DateTime<Utc>, duration: Duration) -> BanOutcome {
        let key = record_key(user_id, channel_id);
        let mut records = self.lock();

        if let Some(existing) = records.get(&key) {
            if existing.is_active(now) {
                return BanOutcome::AlreadyBanned(existing.clone());
            }
        }

        let record = BanRecord {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            kicked_at: now,
            reinvite_at: now
                .checked_add_signed(to_chrono(duration))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            reinvited: false,
        };
        records.insert(key, record.clone());
        self.persist(&records);

        info!(
            "Banned {} from {} until {}",
            user_id,
            channel_id,
            record.reinvite_at.to_rfc3339()
        );
        BanOutcome::Created(record)
    }

    pub fn is_banned(&self, user_id: &str, channel_id: &str, now: DateTime<Utc>) -> bool {
        self.lock()
            .get(&record_key(user_id, channel_id))
            .map(|r| r.is_active(now))
            .unwrap_or(false)
    }

    /// Time left on an active ban
    pub fn remaining(&self, user_id: &str, channel_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.lock()
            .get(&record_key(user_id, channel_id))
            .filter(|r| r.is_active(now))
            .and_then(|r| (r.reinvite_at - now).to_std().ok())
    }

    pub fn get(&self, user_id: &str, channel_id: &str) -> Option<BanRecord> {
        self.lock().get(&record_key(user_id, channel_id)).cloned()
    }

    /// Mark every due record reinvited and return them.
    ///
    /// A record is handed out at most once; the caller owns issuing the reinvite.
    pub fn claim_expired(&self, now: DateTime<Utc>) -> Vec<BanRecord> {
        let mut records = self.lock();
        let mut claimed = Vec::new();

        for record in records.values_mut() {
            if record.is_due(now) {
                record.reinvited = true;
                claimed.push(record.clone());
            }
        }

        if !claimed.is_empty() {
            debug!("Claimed {} expired bans", claimed.len());
            self.persist(&records);
        }
        claimed
    }

    /// Drop reinvited records whose `reinvite_at` is older than `retention`
    pub fn collect_garbage(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        // A retention reaching before the representable range keeps everything
        let Some(cutoff) = now.checked_sub_signed(to_chrono(retention)) else {
            return 0;
        };
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, r| !(r.reinvited && r.reinvite_at < cutoff));
        let removed = before - records.len();

        if removed > 0 {
            debug!("Garbage collected {} ban records", removed);
            self.persist(&records);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn records(&self) -> Vec<BanRecord> {
        self.lock().values().cloned().collect()
    }

    fn persist(&self, records: &BTreeMap<String, BanRecord>) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(e) = write_atomic(path, records) {
            error!("Failed to persist ban registry: {:#}", e);
        }
    }
}

/// Serialize → write temp file → fsync → rename over the target
fn write_atomic(path: &Path, records: &BTreeMap<String, BanRecord>) -> Result<()> {
    let json = serde_json::to_vec_pretty(records).context("Failed to serialize ban records")?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("bans.json");
    let tmp_path = parent.join(format!(".{}.tmp", file_name));

    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(&json)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        anyhow::anyhow!("Failed to move ban registry into place at {}: {}", path.display(), e)
    })
}
