//! Attack record store.
//!
//! Thread-safe, file-persisted document store keyed by IP. One process-wide
//! mutex guards all reads and writes (linearizable, single writer at a
//! time); a dirty flag skips redundant saves; persistence is an atomic
//! temp-file + rename of the whole JSON document.
//!
//! The engine only observes bans/unbans from logs and records them; it
//! never decides to ban.

mod record;
mod scoring;

pub use record::{
    AnalysisInfo, AttackRecord, AttemptStats, BanHistoryEntry, BanState, BlacklistEntry, Document,
    GeoInfo, GeoPatch, GlobalStats, IpStatus, LogPosition, Metadata, RecordPatch, UnbanStats,
    WhitelistEntry, MAX_RETAINED_TIMESTAMPS, SCHEMA_VERSION,
};
pub use scoring::{danger_score, AnalysisOutcome, PatternSummary};

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

struct StoreInner {
    doc: Document,
    dirty: bool,
}

/// Thread-safe persistent store of per-IP threat profiles.
pub struct AttackStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl AttackStore {
    /// Open the store at `path`, loading the persisted document if present.
    ///
    /// A missing file starts a fresh document (persisted on first save). A
    /// corrupt file is discarded and replaced with a fresh document - an
    /// explicit, logged data-loss tradeoff rather than a crash.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let (doc, dirty) = if path.exists() {
            match Self::load_document(&path) {
                Ok(doc) => {
                    debug!(path = %path.display(), ips = doc.ips.len(), "Loaded attack store");
                    (doc, false)
                }
                Err(e) => {
                    error!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load attack store, starting from an empty document"
                    );
                    (Document::empty(Utc::now()), false)
                }
            }
        } else {
            info!(path = %path.display(), "Creating new attack store");
            (Document::empty(Utc::now()), true)
        };

        Self {
            path,
            inner: Mutex::new(StoreInner { doc, dirty }),
        }
    }

    fn load_document(path: &Path) -> Result<Document, StoreError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist the document. No-op unless a mutation set the dirty flag.
    ///
    /// Writes the whole document to `<path>.tmp` and atomically renames it
    /// over the target. Serialized with every other store operation by the
    /// store lock.
    pub fn save(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.dirty {
            debug!("Attack store unchanged, skipping save");
            return Ok(());
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        inner.doc.last_updated = Utc::now();
        let json = serde_json::to_string_pretty(&inner.doc)?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;

        inner.dirty = false;
        debug!(path = %self.path.display(), "Saved attack store");
        Ok(())
    }

    // ------------------------------------------------------------------
    // IP CRUD
    // ------------------------------------------------------------------

    /// Get one record, or `None` for an IP never seen.
    pub fn get_ip(&self, ip: &str) -> Option<AttackRecord> {
        self.inner.lock().doc.ips.get(ip).cloned()
    }

    /// Merge a partial update into a record, creating it if absent.
    pub fn upsert_ip(&self, ip: &str, patch: RecordPatch) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = Self::ensure_record(&mut inner, ip, now);
        patch.apply_to(record);
        record.last_updated = now.timestamp();
        inner.dirty = true;
    }

    fn ensure_record<'a>(
        inner: &'a mut StoreInner,
        ip: &str,
        now: DateTime<Utc>,
    ) -> &'a mut AttackRecord {
        if !inner.doc.ips.contains_key(ip) {
            inner.doc.ips.insert(ip.to_string(), AttackRecord::new(now));
            inner.doc.stats.total_ips += 1;
        }
        inner.doc.ips.get_mut(ip).expect("record just ensured")
    }

    // ------------------------------------------------------------------
    // Event recording
    // ------------------------------------------------------------------

    /// Record a failed authentication attempt. A `None` timestamp (e.g. an
    /// unparseable log timestamp) falls back to now.
    pub fn record_attempt(&self, ip: &str, jail: &str, timestamp: Option<DateTime<Utc>>) {
        let now = Utc::now();
        let at = timestamp.unwrap_or(now);
        let mut inner = self.inner.lock();
        let record = Self::ensure_record(&mut inner, ip, at);
        record.note_attempt(jail, at);
        record.last_updated = now.timestamp();
        inner.doc.stats.total_attempts += 1;
        inner.dirty = true;
    }

    /// Record a ban event. Always appends a history entry and marks the
    /// ban active.
    pub fn record_ban(
        &self,
        ip: &str,
        jail: &str,
        duration: u64,
        trigger_count: u64,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let now = Utc::now();
        let at = timestamp.unwrap_or(now);
        let mut inner = self.inner.lock();
        let record = Self::ensure_record(&mut inner, ip, at);
        record.note_ban(jail, duration, trigger_count, at);
        record.last_updated = now.timestamp();
        inner.doc.stats.total_bans += 1;
        inner.doc.stats.active_bans += 1;
        inner.dirty = true;
    }

    /// Record an unban event. A no-op for an unknown IP (nothing to clear);
    /// only clears ban state when `jail` matches the current ban's jail.
    pub fn record_unban(&self, ip: &str, jail: &str, timestamp: Option<DateTime<Utc>>) {
        let now = Utc::now();
        let at = timestamp.unwrap_or(now);
        let mut inner = self.inner.lock();
        let Some(record) = inner.doc.ips.get_mut(ip) else {
            return;
        };

        let cleared = record.note_unban(jail, at);
        record.last_updated = now.timestamp();
        if cleared {
            inner.doc.stats.active_bans = inner.doc.stats.active_bans.saturating_sub(1);
        }
        inner.dirty = true;
    }

    /// Set geolocation data, lazily creating the record. `fetched_at` is
    /// stamped with the current time.
    pub fn set_geo(&self, ip: &str, mut geo: GeoInfo) {
        let now = Utc::now();
        geo.fetched_at = Some(now);
        let mut inner = self.inner.lock();
        let record = Self::ensure_record(&mut inner, ip, now);
        record.geo = geo;
        record.last_updated = now.timestamp();
        inner.dirty = true;
    }

    /// Set the operator comment for an IP, lazily creating the record.
    pub fn set_user_comment(&self, ip: &str, comment: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let record = Self::ensure_record(&mut inner, ip, now);
        record.user_comment = Some(comment.to_string());
        record.last_updated = now.timestamp();
        inner.dirty = true;
    }

    // ------------------------------------------------------------------
    // Whitelist / blacklist
    // ------------------------------------------------------------------

    /// Add an IP to the whitelist. First write wins; re-adding is a no-op.
    pub fn add_to_whitelist(&self, ip: &str, reason: &str, added_by: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if inner.doc.whitelist.iter().any(|e| e.ip == ip) {
            return;
        }
        inner.doc.whitelist.push(WhitelistEntry {
            ip: ip.to_string(),
            added: now,
            reason: reason.to_string(),
            added_by: added_by.to_string(),
        });
        if let Some(record) = inner.doc.ips.get_mut(ip) {
            record.status = IpStatus::Whitelisted;
            record.last_updated = now.timestamp();
        }
        inner.dirty = true;
    }

    /// Add an IP to the blacklist. First write wins; re-adding is a no-op.
    pub fn add_to_blacklist(
        &self,
        ip: &str,
        reason: &str,
        added_by: &str,
        expires: Option<DateTime<Utc>>,
    ) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if inner.doc.blacklist.iter().any(|e| e.ip == ip) {
            return;
        }
        inner.doc.blacklist.push(BlacklistEntry {
            ip: ip.to_string(),
            added: now,
            reason: reason.to_string(),
            added_by: added_by.to_string(),
            expires,
        });
        if let Some(record) = inner.doc.ips.get_mut(ip) {
            record.status = IpStatus::Blacklisted;
            record.last_updated = now.timestamp();
        }
        inner.dirty = true;
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.inner.lock().doc.whitelist.iter().any(|e| e.ip == ip)
    }

    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.inner.lock().doc.blacklist.iter().any(|e| e.ip == ip)
    }

    pub fn whitelist(&self) -> Vec<WhitelistEntry> {
        self.inner.lock().doc.whitelist.clone()
    }

    pub fn blacklist(&self) -> Vec<BlacklistEntry> {
        self.inner.lock().doc.blacklist.clone()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// All records, keyed by IP.
    pub fn get_all_ips(&self) -> BTreeMap<String, AttackRecord> {
        self.inner.lock().doc.ips.clone()
    }

    /// IPs with an open ban.
    pub fn get_active_bans(&self) -> Vec<(String, AttackRecord)> {
        self.inner
            .lock()
            .doc
            .ips
            .iter()
            .filter(|(_, record)| record.bans.active)
            .map(|(ip, record)| (ip.clone(), record.clone()))
            .collect()
    }

    /// Records sorted by danger score, highest first.
    pub fn get_top_threats(&self, limit: usize) -> Vec<(String, AttackRecord)> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .doc
            .ips
            .iter()
            .map(|(ip, record)| (ip.clone(), record.clone()))
            .collect();
        entries.sort_by(|a, b| b.1.danger_score.cmp(&a.1.danger_score));
        entries.truncate(limit);
        entries
    }

    /// Records sorted by `last_seen`, most recent first.
    pub fn get_recent_activity(&self, limit: usize) -> Vec<(String, AttackRecord)> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .doc
            .ips
            .iter()
            .map(|(ip, record)| (ip.clone(), record.clone()))
            .collect();
        entries.sort_by(|a, b| b.1.last_seen.cmp(&a.1.last_seen));
        entries.truncate(limit);
        entries
    }

    /// Current aggregate counters (a derived cache; see
    /// [`AttackStore::recalculate_stats`]).
    pub fn get_stats(&self) -> GlobalStats {
        self.inner.lock().doc.stats.clone()
    }

    // ------------------------------------------------------------------
    // Log position cursors (ingestion)
    // ------------------------------------------------------------------

    /// Saved cursor for one log file.
    pub fn log_position(&self, log_file: &str) -> Option<LogPosition> {
        self.inner
            .lock()
            .doc
            .metadata
            .log_positions
            .get(log_file)
            .cloned()
    }

    /// Persist the cursor for one log file.
    pub fn set_log_position(&self, log_file: &str, position: u64, inode: u64, last_line: Option<String>) {
        let mut inner = self.inner.lock();
        inner.doc.metadata.log_positions.insert(
            log_file.to_string(),
            LogPosition {
                position,
                inode,
                last_line,
            },
        );
        inner.dirty = true;
    }

    /// Drop all cursors, forcing the next ingestion pass to re-read
    /// everything.
    pub fn reset_log_positions(&self) {
        let mut inner = self.inner.lock();
        inner.doc.metadata.log_positions.clear();
        inner.dirty = true;
    }

    /// Stamp the time of the last full backfill.
    pub fn mark_full_sync(&self) {
        let mut inner = self.inner.lock();
        inner.doc.metadata.last_full_sync = Some(Utc::now());
        inner.dirty = true;
    }

    // Used by scoring.rs, which lives in this module tree.
    pub(crate) fn with_inner_mut<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner.doc);
        inner.dirty = true;
        result
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.doc)
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> AttackStore {
        AttackStore::open(dir.path().join("attacks.db.json"))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_unknown_ip_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.get_ip("203.0.113.7").is_none());
    }

    #[test]
    fn test_attempt_totals_match_by_jail_sum() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for _ in 0..7 {
            store.record_attempt("203.0.113.7", "sshd", None);
        }
        for _ in 0..3 {
            store.record_attempt("203.0.113.7", "recidive", None);
        }

        let record = store.get_ip("203.0.113.7").unwrap();
        assert_eq!(record.attempts.total, 10);
        let summed: u64 = record.attempts.by_jail.values().sum();
        assert_eq!(summed, 10);
        assert_eq!(store.get_stats().total_attempts, 10);
        assert_eq!(store.get_stats().total_ips, 1);
    }

    #[test]
    fn test_ban_unban_cycle() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.record_ban("203.0.113.7", "sshd", 600, 5, Some(at(1000)));

        let record = store.get_ip("203.0.113.7").unwrap();
        assert!(record.bans.active);
        assert_eq!(record.status, IpStatus::ActiveBan);
        assert_eq!(store.get_stats().active_bans, 1);

        store.record_unban("203.0.113.7", "sshd", Some(at(2000)));
        let record = store.get_ip("203.0.113.7").unwrap();
        assert!(!record.bans.active);
        assert!(record.bans.current_jail.is_none());
        assert_eq!(record.status, IpStatus::Unbanned);
        assert_eq!(record.bans.history.last().unwrap().end, Some(at(2000)));
        assert_eq!(store.get_stats().active_bans, 0);
    }

    #[test]
    fn test_unban_different_jail_keeps_ban_open() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.record_ban("203.0.113.7", "sshd", 600, 0, None);
        store.record_unban("203.0.113.7", "recidive", None);

        let record = store.get_ip("203.0.113.7").unwrap();
        assert!(record.bans.active);
        assert_eq!(record.unbans.total, 1);
        assert_eq!(store.get_stats().active_bans, 1);
    }

    #[test]
    fn test_unban_unknown_ip_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.record_unban("203.0.113.7", "sshd", None);
        assert!(store.get_ip("203.0.113.7").is_none());
        assert_eq!(store.get_stats().total_ips, 0);
    }

    #[test]
    fn test_whitelist_dedup_and_status() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.record_attempt("203.0.113.7", "sshd", None);
        store.add_to_whitelist("203.0.113.7", "office", "admin");
        store.add_to_whitelist("203.0.113.7", "duplicate", "admin");

        assert_eq!(store.whitelist().len(), 1);
        assert_eq!(store.whitelist()[0].reason, "office");
        assert!(store.is_whitelisted("203.0.113.7"));
        assert_eq!(store.get_ip("203.0.113.7").unwrap().status, IpStatus::Whitelisted);
    }

    #[test]
    fn test_blacklist_membership() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.add_to_blacklist("198.51.100.4", "repeat offender", "admin", None);
        assert!(store.is_blacklisted("198.51.100.4"));
        assert!(!store.is_blacklisted("198.51.100.5"));
    }

    #[test]
    fn test_top_threats_ordering() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for (ip, score) in [("10.0.0.1", 30), ("10.0.0.2", 80), ("10.0.0.3", 50)] {
            store.upsert_ip(
                ip,
                RecordPatch {
                    danger_score: Some(score),
                    ..Default::default()
                },
            );
        }

        let top = store.get_top_threats(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].1.danger_score, 80);
        assert_eq!(top[1].1.danger_score, 50);
    }

    #[test]
    fn test_save_skipped_when_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attacks.db.json");
        let store = AttackStore::open(&path);

        // New store is dirty; first save writes the empty document.
        store.save().unwrap();
        assert!(path.exists());

        // Clean store: deleting the file and saving again must not recreate it.
        std::fs::remove_file(&path).unwrap();
        store.save().unwrap();
        assert!(!path.exists());

        // Any mutation dirties the store again.
        store.record_attempt("203.0.113.7", "sshd", None);
        assert!(store.is_dirty());
        store.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attacks.db.json");
        {
            let store = AttackStore::open(&path);
            store.record_ban("203.0.113.7", "sshd", 600, 3, Some(at(1000)));
            store.record_attempt("203.0.113.7", "sshd", Some(at(900)));
            store.save().unwrap();
        }

        let store = AttackStore::open(&path);
        let record = store.get_ip("203.0.113.7").unwrap();
        assert!(record.bans.active);
        assert_eq!(record.attempts.total, 1);
        assert_eq!(store.get_stats().total_bans, 1);
    }

    #[test]
    fn test_corrupt_document_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("attacks.db.json");
        std::fs::write(&path, "{not valid json").unwrap();

        let store = AttackStore::open(&path);
        assert_eq!(store.get_stats().total_ips, 0);
        assert!(store.get_all_ips().is_empty());
    }

    #[test]
    fn test_log_position_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.log_position("/var/log/fail2ban.log").is_none());
        store.set_log_position("/var/log/fail2ban.log", 42, 7, Some("last".into()));

        let pos = store.log_position("/var/log/fail2ban.log").unwrap();
        assert_eq!(pos.position, 42);
        assert_eq!(pos.inode, 7);

        store.reset_log_positions();
        assert!(store.log_position("/var/log/fail2ban.log").is_none());
    }

    #[test]
    fn test_concurrent_attempts_on_distinct_ips() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&dir));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    store.record_attempt(&format!("10.1.0.{i}"), "sshd", None);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get_stats().total_ips, 32);
        let all = store.get_all_ips();
        assert_eq!(all.len(), 32);
        assert!(all.values().all(|r| r.attempts.total == 1));
    }
}
