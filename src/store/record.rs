//! Persisted document schema for the attack record store.
//!
//! The whole store is a single versioned JSON document (schema `"2.0"`):
//! global stats, ingestion cursors, whitelist/blacklist, and one
//! [`AttackRecord`] per IP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted document schema version.
pub const SCHEMA_VERSION: &str = "2.0";

/// How many raw attempt timestamps are retained per record for pattern
/// analysis.
pub const MAX_RETAINED_TIMESTAMPS: usize = 100;

/// Lifecycle status of a tracked IP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStatus {
    #[default]
    Watching,
    ActiveBan,
    Unbanned,
    Whitelisted,
    Blacklisted,
}

/// Geolocation data, unresolved until an external lookup fills it in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub org: Option<String>,
    pub asn: Option<String>,
    pub city: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Failed-attempt counters for one IP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptStats {
    pub total: u64,
    pub by_jail: BTreeMap<String, u64>,
    pub by_day: BTreeMap<String, u64>,
    pub first_attempt: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Most recent raw attempt timestamps (capped at
    /// [`MAX_RETAINED_TIMESTAMPS`]), feeding per-record interval analysis.
    pub timestamps: Vec<DateTime<Utc>>,
}

/// One closed or open ban in a record's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanHistoryEntry {
    pub jail: String,
    pub start: DateTime<Utc>,
    /// Set by the matching unban; `None` while the ban is open.
    pub end: Option<DateTime<Utc>>,
    /// Ban duration in seconds (bantime heuristic when not authoritative).
    pub duration: u64,
    /// Attempts that triggered the ban, when known.
    pub trigger_count: u64,
}

/// Ban state for one IP. `active == true` iff `current_jail` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BanState {
    pub total: u64,
    pub active: bool,
    pub current_jail: Option<String>,
    pub current_ban_start: Option<DateTime<Utc>>,
    pub current_ban_duration: Option<u64>,
    /// Append-only; only the newest entry's `end` is ever mutated.
    pub history: Vec<BanHistoryEntry>,
}

/// Unban counters for one IP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnbanStats {
    pub total: u64,
    pub last: Option<DateTime<Utc>>,
}

/// Derived interval statistics and threat flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisInfo {
    /// Mean inter-attempt interval in seconds.
    pub avg_interval: Option<f64>,
    pub min_interval: Option<f64>,
    pub max_interval: Option<f64>,
    /// Slow-pattern detected: mean interval exceeds findtime.
    pub evasion_detected: bool,
    /// Evasion detected, not currently banned, active within 24h.
    pub evasion_active: bool,
    /// Was ever banned.
    pub threat_detected: bool,
    pub priority: u8,
    pub last_analysis: Option<DateTime<Utc>>,
}

impl Default for AnalysisInfo {
    fn default() -> Self {
        Self {
            avg_interval: None,
            min_interval: None,
            max_interval: None,
            evasion_detected: false,
            evasion_active: false,
            threat_detected: false,
            priority: 3,
            last_analysis: None,
        }
    }
}

/// Full threat profile for one IP. Map key in the document is the IP string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackRecord {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Unix seconds of the last mutation, for staleness checks.
    pub last_updated: i64,
    pub geo: GeoInfo,
    pub attempts: AttemptStats,
    pub bans: BanState,
    pub unbans: UnbanStats,
    pub status: IpStatus,
    /// Derived 0-100 risk score, recomputed on demand.
    pub danger_score: u8,
    pub tags: Vec<String>,
    pub analysis: AnalysisInfo,
    pub user_comment: Option<String>,
    pub notes: Vec<String>,
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl Default for AttackRecord {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl AttackRecord {
    /// Fresh record for an IP first seen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            last_updated: now.timestamp(),
            geo: GeoInfo::default(),
            attempts: AttemptStats::default(),
            bans: BanState::default(),
            unbans: UnbanStats::default(),
            status: IpStatus::Watching,
            danger_score: 0,
            tags: Vec::new(),
            analysis: AnalysisInfo::default(),
            user_comment: None,
            notes: Vec::new(),
            custom: serde_json::Map::new(),
        }
    }

    /// Record a failed attempt in `jail` at time `at`.
    pub fn note_attempt(&mut self, jail: &str, at: DateTime<Utc>) {
        self.last_seen = at;
        self.attempts.total += 1;
        *self.attempts.by_jail.entry(jail.to_string()).or_insert(0) += 1;
        *self
            .attempts
            .by_day
            .entry(at.format("%Y-%m-%d").to_string())
            .or_insert(0) += 1;

        if self.attempts.first_attempt.is_none() {
            self.attempts.first_attempt = Some(at);
        }
        self.attempts.last_attempt = Some(at);

        self.attempts.timestamps.push(at);
        let len = self.attempts.timestamps.len();
        if len > MAX_RETAINED_TIMESTAMPS {
            self.attempts.timestamps.drain(..len - MAX_RETAINED_TIMESTAMPS);
        }
    }

    /// Open a new ban in `jail`. Always appends a history entry.
    pub fn note_ban(&mut self, jail: &str, duration: u64, trigger_count: u64, at: DateTime<Utc>) {
        self.last_seen = at;
        self.bans.total += 1;
        self.bans.active = true;
        self.bans.current_jail = Some(jail.to_string());
        self.bans.current_ban_start = Some(at);
        self.bans.current_ban_duration = Some(duration);
        self.status = IpStatus::ActiveBan;
        self.bans.history.push(BanHistoryEntry {
            jail: jail.to_string(),
            start: at,
            end: None,
            duration,
            trigger_count,
        });
    }

    /// Record an unban from `jail` at `at`. Only clears the active ban if
    /// `jail` matches the current one; returns whether it did.
    pub fn note_unban(&mut self, jail: &str, at: DateTime<Utc>) -> bool {
        self.unbans.total += 1;
        self.unbans.last = Some(at);

        if self.bans.current_jail.as_deref() != Some(jail) {
            return false;
        }

        self.bans.active = false;
        self.bans.current_jail = None;
        self.bans.current_ban_start = None;
        self.bans.current_ban_duration = None;
        self.status = IpStatus::Unbanned;
        if let Some(entry) = self.bans.history.last_mut() {
            entry.end = Some(at);
        }
        true
    }
}

/// Partial update for [`GeoInfo`]; `Some` fields overwrite, `None` fields
/// leave the existing value alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeoPatch {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub org: Option<String>,
    pub asn: Option<String>,
    pub city: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl GeoPatch {
    fn apply_to(self, geo: &mut GeoInfo) {
        if let Some(v) = self.country {
            geo.country = Some(v);
        }
        if let Some(v) = self.country_code {
            geo.country_code = Some(v);
        }
        if let Some(v) = self.org {
            geo.org = Some(v);
        }
        if let Some(v) = self.asn {
            geo.asn = Some(v);
        }
        if let Some(v) = self.city {
            geo.city = Some(v);
        }
        if let Some(v) = self.fetched_at {
            geo.fetched_at = Some(v);
        }
    }
}

/// Partial update for an [`AttackRecord`].
///
/// Explicit per-field merge of the known nested structures instead of a
/// dynamic recursive dict merge, so the schema stays statically checkable.
/// Unset fields never clobber existing data; `custom` entries merge by key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecordPatch {
    pub geo: Option<GeoPatch>,
    pub status: Option<IpStatus>,
    pub danger_score: Option<u8>,
    pub tags: Option<Vec<String>>,
    pub user_comment: Option<String>,
    pub notes: Option<Vec<String>>,
    pub custom: Option<serde_json::Map<String, serde_json::Value>>,
}

impl RecordPatch {
    pub fn apply_to(self, record: &mut AttackRecord) {
        if let Some(geo) = self.geo {
            geo.apply_to(&mut record.geo);
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(score) = self.danger_score {
            record.danger_score = score;
        }
        if let Some(tags) = self.tags {
            record.tags = tags;
        }
        if let Some(comment) = self.user_comment {
            record.user_comment = Some(comment);
        }
        if let Some(notes) = self.notes {
            record.notes = notes;
        }
        if let Some(custom) = self.custom {
            for (key, value) in custom {
                record.custom.insert(key, value);
            }
        }
    }
}

/// Whitelist entry, unique by IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub ip: String,
    pub added: DateTime<Utc>,
    pub reason: String,
    pub added_by: String,
}

/// Blacklist entry, unique by IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub ip: String,
    pub added: DateTime<Utc>,
    pub reason: String,
    pub added_by: String,
    pub expires: Option<DateTime<Utc>>,
}

/// Ingestion cursor for one log file; only the current (non-rotated) log
/// keeps one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogPosition {
    /// Lines already processed.
    pub position: u64,
    pub inode: u64,
    pub last_line: Option<String>,
}

/// Derived aggregate counters; a cache, not a source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalStats {
    pub total_ips: u64,
    pub total_attempts: u64,
    pub total_bans: u64,
    pub active_bans: u64,
    pub top_country: Option<String>,
    pub top_org: Option<String>,
}

/// Non-record bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub log_positions: BTreeMap<String, LogPosition>,
    pub last_full_sync: Option<DateTime<Utc>>,
}

/// The whole persisted store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub stats: GlobalStats,
    pub metadata: Metadata,
    pub whitelist: Vec<WhitelistEntry>,
    pub blacklist: Vec<BlacklistEntry>,
    pub ips: BTreeMap<String, AttackRecord>,
}

impl Default for Document {
    fn default() -> Self {
        Self::empty(Utc::now())
    }
}

impl Document {
    /// Empty document created at `now`.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            created_at: now,
            last_updated: now,
            stats: GlobalStats::default(),
            metadata: Metadata::default(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            ips: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_attempt_bookkeeping() {
        let mut record = AttackRecord::new(at(0));
        record.note_attempt("sshd", at(100));
        record.note_attempt("sshd", at(200));
        record.note_attempt("recidive", at(300));

        assert_eq!(record.attempts.total, 3);
        assert_eq!(record.attempts.by_jail["sshd"], 2);
        assert_eq!(record.attempts.by_jail["recidive"], 1);
        assert_eq!(record.attempts.first_attempt, Some(at(100)));
        assert_eq!(record.attempts.last_attempt, Some(at(300)));
        assert_eq!(record.attempts.timestamps.len(), 3);
        let summed: u64 = record.attempts.by_jail.values().sum();
        assert_eq!(record.attempts.total, summed);
    }

    #[test]
    fn test_timestamp_ring_is_capped() {
        let mut record = AttackRecord::new(at(0));
        for i in 0..150 {
            record.note_attempt("sshd", at(i * 60));
        }
        assert_eq!(record.attempts.timestamps.len(), MAX_RETAINED_TIMESTAMPS);
        // Oldest entries were dropped
        assert_eq!(record.attempts.timestamps[0], at(50 * 60));
        assert_eq!(record.attempts.total, 150);
    }

    #[test]
    fn test_unban_only_matching_jail() {
        let mut record = AttackRecord::new(at(0));
        record.note_ban("sshd", 600, 5, at(10));
        assert!(record.bans.active);

        // Unban from a different jail leaves the ban open
        assert!(!record.note_unban("recidive", at(20)));
        assert!(record.bans.active);
        assert_eq!(record.bans.current_jail.as_deref(), Some("sshd"));
        assert!(record.bans.history[0].end.is_none());

        // Matching jail closes it
        assert!(record.note_unban("sshd", at(30)));
        assert!(!record.bans.active);
        assert!(record.bans.current_jail.is_none());
        assert_eq!(record.bans.history[0].end, Some(at(30)));
        assert_eq!(record.unbans.total, 2);
    }

    #[test]
    fn test_geo_patch_preserves_siblings() {
        let mut record = AttackRecord::new(at(0));
        RecordPatch {
            geo: Some(GeoPatch {
                country: Some("Netherlands".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
        .apply_to(&mut record);

        RecordPatch {
            geo: Some(GeoPatch {
                city: Some("Amsterdam".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
        .apply_to(&mut record);

        assert_eq!(record.geo.country.as_deref(), Some("Netherlands"));
        assert_eq!(record.geo.city.as_deref(), Some("Amsterdam"));
    }

    #[test]
    fn test_document_roundtrip_keeps_version() {
        let doc = Document::empty(at(0));
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, SCHEMA_VERSION);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&IpStatus::ActiveBan).unwrap();
        assert_eq!(json, "\"active_ban\"");
    }
}
