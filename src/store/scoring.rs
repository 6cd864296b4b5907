//! Danger scoring and aggregate statistics.
//!
//! The danger score is a bounded 0-100 risk estimate summing capped
//! contributions from attempt volume, ban count, repeat-offender jail
//! involvement, recency, and an open ban.

use super::record::AttackRecord;
use super::AttackStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::info;

/// The repeat-offender jail; involvement is worth a flat +20.
const RECIDIVE_JAIL: &str = "recidive";

/// Pure 0-100 risk score for one record's history, evaluated at `now`.
///
/// Contributions: 1 point per 10 attempts (cap 25), 3 points per ban
/// (cap 25), +20 for recidive involvement, recency bonus (+20 under a day,
/// +10 under a week, +5 under a month), +10 while actively banned.
pub fn danger_score(record: &AttackRecord, now: DateTime<Utc>) -> u8 {
    let mut score = (record.attempts.total / 10).min(25);
    score += (record.bans.total * 3).min(25);

    if record.attempts.by_jail.contains_key(RECIDIVE_JAIL) {
        score += 20;
    }

    let days_ago = (now - record.last_seen).num_days();
    score += match days_ago {
        d if d < 1 => 20,
        d if d < 7 => 10,
        d if d < 30 => 5,
        _ => 0,
    };

    if record.bans.active {
        score += 10;
    }

    score.min(100) as u8
}

/// Outcome of per-record interval analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisOutcome {
    pub avg_interval: Option<f64>,
    pub min_interval: Option<f64>,
    pub max_interval: Option<f64>,
    pub evasion_detected: bool,
    pub evasion_active: bool,
    pub threat_detected: bool,
}

/// Counters returned by [`AttackStore::analyze_all_patterns`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternSummary {
    pub analyzed: u64,
    pub threats: u64,
    pub evading: u64,
}

impl AttackStore {
    /// Danger score for one IP; 0 for IPs never seen.
    pub fn calculate_danger_score(&self, ip: &str) -> u8 {
        let now = Utc::now();
        self.with_inner(|doc| doc.ips.get(ip).map(|r| danger_score(r, now)).unwrap_or(0))
    }

    /// Recompute and stamp the danger score of every record.
    pub fn recalculate_danger_scores(&self) {
        let now = Utc::now();
        self.with_inner_mut(|doc| {
            for record in doc.ips.values_mut() {
                record.danger_score = danger_score(record, now);
                record.analysis.last_analysis = Some(now);
            }
        });
    }

    /// Recompute the global counter cache from the full record set.
    ///
    /// Most-common country/org ties break deterministically (last key in
    /// sorted order wins).
    pub fn recalculate_stats(&self) {
        self.with_inner_mut(|doc| {
            let mut total_attempts = 0;
            let mut total_bans = 0;
            let mut active_bans = 0;
            let mut countries: BTreeMap<&str, u64> = BTreeMap::new();
            let mut orgs: BTreeMap<&str, u64> = BTreeMap::new();

            for record in doc.ips.values() {
                total_attempts += record.attempts.total;
                total_bans += record.bans.total;
                if record.bans.active {
                    active_bans += 1;
                }
                if let Some(country) = record.geo.country.as_deref() {
                    *countries.entry(country).or_insert(0) += 1;
                }
                if let Some(org) = record.geo.org.as_deref() {
                    *orgs.entry(org).or_insert(0) += 1;
                }
            }

            doc.stats.total_ips = doc.ips.len() as u64;
            doc.stats.total_attempts = total_attempts;
            doc.stats.total_bans = total_bans;
            doc.stats.active_bans = active_bans;
            doc.stats.top_country = most_common(&countries);
            doc.stats.top_org = most_common(&orgs);
        });
    }

    /// Interval analysis of one record's retained attempt timestamps.
    ///
    /// `threat_detected` means the IP was ever banned (caught).
    /// `evasion_detected` means the mean inter-attempt interval exceeds
    /// `findtime` - deliberately slow to stay under the ban threshold.
    /// `evasion_active` adds: not currently banned and active within 24h.
    pub fn analyze_patterns(&self, ip: &str, findtime: u64) -> AnalysisOutcome {
        let now = Utc::now();
        self.with_inner_mut(|doc| {
            let Some(record) = doc.ips.get_mut(ip) else {
                return AnalysisOutcome::default();
            };
            let outcome = analyze_record(record, findtime, now);

            record.analysis.avg_interval = outcome.avg_interval;
            record.analysis.min_interval = outcome.min_interval;
            record.analysis.max_interval = outcome.max_interval;
            record.analysis.evasion_detected = outcome.evasion_detected;
            record.analysis.evasion_active = outcome.evasion_active;
            record.analysis.threat_detected = outcome.threat_detected;
            record.analysis.last_analysis = Some(now);

            outcome
        })
    }

    /// Run pattern analysis over every record with enough data (at least 3
    /// retained timestamps, or any ban on file).
    pub fn analyze_all_patterns(&self, findtime: u64) -> PatternSummary {
        let candidates: Vec<String> = self.with_inner(|doc| {
            doc.ips
                .iter()
                .filter(|(_, r)| r.attempts.timestamps.len() >= 3 || r.bans.total > 0)
                .map(|(ip, _)| ip.clone())
                .collect()
        });

        let mut summary = PatternSummary::default();
        for ip in candidates {
            let outcome = self.analyze_patterns(&ip, findtime);
            summary.analyzed += 1;
            if outcome.threat_detected {
                summary.threats += 1;
            }
            if outcome.evasion_active {
                summary.evading += 1;
            }
        }

        info!(
            analyzed = summary.analyzed,
            threats = summary.threats,
            evading = summary.evading,
            "Pattern analysis complete"
        );
        summary
    }
}

fn analyze_record(record: &AttackRecord, findtime: u64, now: DateTime<Utc>) -> AnalysisOutcome {
    let mut outcome = AnalysisOutcome {
        threat_detected: record.bans.total > 0,
        ..Default::default()
    };

    let mut timestamps = record.attempts.timestamps.clone();
    if timestamps.len() < 2 {
        return outcome;
    }
    timestamps.sort();

    let intervals: Vec<f64> = timestamps
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
        .collect();

    let avg = intervals.iter().sum::<f64>() / intervals.len() as f64;
    outcome.avg_interval = Some(avg);
    outcome.min_interval = intervals.iter().copied().reduce(f64::min);
    outcome.max_interval = intervals.iter().copied().reduce(f64::max);

    if avg > findtime as f64 && intervals.len() >= 2 {
        outcome.evasion_detected = true;
    }

    if outcome.evasion_detected
        && !record.bans.active
        && let Some(last) = record.attempts.last_attempt
        && now - last < Duration::hours(24)
    {
        outcome.evasion_active = true;
    }

    outcome
}

fn most_common(counts: &BTreeMap<&str, u64>) -> Option<String> {
    counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(value, _)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GeoInfo, RecordPatch};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_unknown_ip_scores_zero() {
        let dir = TempDir::new().unwrap();
        let store = AttackStore::open(dir.path().join("db.json"));
        assert_eq!(store.calculate_danger_score("203.0.113.1"), 0);
    }

    #[test]
    fn test_score_components() {
        let now = Utc::now();
        let mut record = AttackRecord::new(now);

        // Recency only: last_seen is now
        assert_eq!(danger_score(&record, now), 20);

        // 100 attempts -> +10
        record.attempts.total = 100;
        assert_eq!(danger_score(&record, now), 30);

        // Attempts contribution caps at 25
        record.attempts.total = 10_000;
        assert_eq!(danger_score(&record, now), 45);

        // 2 bans -> +6
        record.bans.total = 2;
        assert_eq!(danger_score(&record, now), 51);

        // Recidive involvement -> +20
        record.attempts.by_jail.insert("recidive".into(), 1);
        assert_eq!(danger_score(&record, now), 71);

        // Active ban -> +10
        record.bans.active = true;
        assert_eq!(danger_score(&record, now), 81);
    }

    #[test]
    fn test_score_clamped_to_100() {
        let now = Utc::now();
        let mut record = AttackRecord::new(now);
        record.attempts.total = 10_000;
        record.bans.total = 100;
        record.bans.active = true;
        record.attempts.by_jail.insert("recidive".into(), 1);
        assert_eq!(danger_score(&record, now), 100);
    }

    #[test]
    fn test_recency_decay() {
        let now = at(86400 * 400);
        let mut record = AttackRecord::new(now);

        record.last_seen = now - Duration::days(3);
        assert_eq!(danger_score(&record, now), 10);

        record.last_seen = now - Duration::days(20);
        assert_eq!(danger_score(&record, now), 5);

        record.last_seen = now - Duration::days(90);
        assert_eq!(danger_score(&record, now), 0);
    }

    #[test]
    fn test_recalculate_stats_top_country() {
        let dir = TempDir::new().unwrap();
        let store = AttackStore::open(dir.path().join("db.json"));

        for (ip, country) in [
            ("10.0.0.1", "Netherlands"),
            ("10.0.0.2", "Netherlands"),
            ("10.0.0.3", "Panama"),
        ] {
            store.set_geo(
                ip,
                GeoInfo {
                    country: Some(country.into()),
                    org: Some("ExampleNet".into()),
                    ..Default::default()
                },
            );
            store.record_attempt(ip, "sshd", None);
        }
        store.record_ban("10.0.0.1", "sshd", 600, 0, None);

        store.recalculate_stats();
        let stats = store.get_stats();
        assert_eq!(stats.total_ips, 3);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.total_bans, 1);
        assert_eq!(stats.active_bans, 1);
        assert_eq!(stats.top_country.as_deref(), Some("Netherlands"));
        assert_eq!(stats.top_org.as_deref(), Some("ExampleNet"));
    }

    #[test]
    fn test_recalculate_scores_stamps_analysis() {
        let dir = TempDir::new().unwrap();
        let store = AttackStore::open(dir.path().join("db.json"));
        store.record_attempt("10.0.0.1", "sshd", None);

        store.recalculate_danger_scores();
        let record = store.get_ip("10.0.0.1").unwrap();
        assert!(record.analysis.last_analysis.is_some());
        assert!(record.danger_score >= 20); // recency bonus at minimum
    }

    #[test]
    fn test_analyze_patterns_slow_attacker() {
        let dir = TempDir::new().unwrap();
        let store = AttackStore::open(dir.path().join("db.json"));
        let base = Utc::now() - Duration::hours(2);

        // 5 attempts 900s apart: mean interval 900 > findtime 600
        for i in 0..5 {
            store.record_attempt("10.0.0.1", "sshd", Some(base + Duration::seconds(i * 900)));
        }

        let outcome = store.analyze_patterns("10.0.0.1", 600);
        assert_eq!(outcome.avg_interval, Some(900.0));
        assert!(outcome.evasion_detected);
        assert!(outcome.evasion_active, "no ban and recent activity");
        assert!(!outcome.threat_detected);

        // A ban makes it a caught threat and clears the active flag
        store.record_ban("10.0.0.1", "sshd", 600, 0, None);
        let outcome = store.analyze_patterns("10.0.0.1", 600);
        assert!(outcome.threat_detected);
        assert!(!outcome.evasion_active);
    }

    #[test]
    fn test_analyze_patterns_fast_attacker_not_evasion() {
        let dir = TempDir::new().unwrap();
        let store = AttackStore::open(dir.path().join("db.json"));
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..5 {
            store.record_attempt("10.0.0.1", "sshd", Some(base + Duration::seconds(i * 60)));
        }

        let outcome = store.analyze_patterns("10.0.0.1", 600);
        assert_eq!(outcome.avg_interval, Some(60.0));
        assert!(!outcome.evasion_detected);
    }

    #[test]
    fn test_analyze_all_patterns_counts() {
        let dir = TempDir::new().unwrap();
        let store = AttackStore::open(dir.path().join("db.json"));
        let base = Utc::now() - Duration::hours(2);

        for i in 0..4 {
            store.record_attempt("10.0.0.1", "sshd", Some(base + Duration::seconds(i * 900)));
        }
        store.record_ban("10.0.0.2", "sshd", 600, 0, None);
        // Too little data, skipped
        store.record_attempt("10.0.0.3", "sshd", None);

        let summary = store.analyze_all_patterns(600);
        assert_eq!(summary.analyzed, 2);
        assert_eq!(summary.threats, 1);
        assert_eq!(summary.evading, 1);
    }

    #[test]
    fn test_upsert_does_not_affect_score_of_others() {
        let dir = TempDir::new().unwrap();
        let store = AttackStore::open(dir.path().join("db.json"));
        store.upsert_ip(
            "10.0.0.1",
            RecordPatch {
                danger_score: Some(42),
                ..Default::default()
            },
        );
        assert_eq!(store.get_ip("10.0.0.1").unwrap().danger_score, 42);
        assert_eq!(store.calculate_danger_score("10.0.0.9"), 0);
    }
}
