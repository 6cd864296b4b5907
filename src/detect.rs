//! Slow brute-force detector.
//!
//! Offline batch analyzer for attackers who space out login attempts to
//! stay under fail2ban's rate-based ban threshold. Scans raw Found/Ban log
//! lines, computes per-IP inter-attempt intervals, and ranks IPs whose mean
//! interval is deliberately long. Independent of the attack record store;
//! the ranked output is consumed by the display layer as a pseudo-jail.

use crate::config::{Config, DetectorConfig};
use crate::error::DetectError;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

lazy_static! {
    // [sshd] Found 192.0.2.1 / [sshd] Ban 192.0.2.1, searched anywhere in the line
    static ref ACTION_RE: Regex =
        Regex::new(r"\[([A-Za-z0-9_-]+)\]\s+(Found|Ban)\s+([0-9a-f.:]+)").expect("action pattern compiles");
}

/// Status label for an IP that was never banned despite a sustained
/// slow pattern.
pub const STATUS_EVASION: &str = "EVASION (ACTIVE)";
/// Status label for a slow attacker fail2ban eventually caught.
pub const STATUS_CAUGHT: &str = "CAUGHT (History)";

/// One ranked slow-attacker candidate.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub ip: String,
    /// First two distinct jails touched, comma-joined.
    pub jail: String,
    /// Found events observed.
    pub count: usize,
    pub bans: u64,
    /// Mean inter-attempt interval, seconds.
    pub avg_int: f64,
    /// Last seen minus first seen, seconds.
    pub duration: f64,
    pub status: String,
    /// Sort priority: evasion (2) before caught (1).
    pub prio: u8,
}

/// Result of one [`SlowScan::scan`] pass.
#[derive(Debug)]
pub struct ScanOutcome {
    pub candidates: Vec<Candidate>,
    /// Distinct IPs observed before threshold filtering.
    pub unique_ips: usize,
}

#[derive(Debug, Default)]
struct IpActivity {
    found: Vec<DateTime<Utc>>,
    bans: u64,
    jails: BTreeSet<String>,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

impl IpActivity {
    fn touch(&mut self, at: DateTime<Utc>) {
        if self.first_seen.is_none_or(|first| at < first) {
            self.first_seen = Some(at);
        }
        if self.last_seen.is_none_or(|last| at > last) {
            self.last_seen = Some(at);
        }
    }
}

/// Offline slow brute-force scan over the fail2ban log family.
pub struct SlowScan {
    log_path: PathBuf,
    config: DetectorConfig,
}

impl SlowScan {
    pub fn new(config: &Config) -> Self {
        Self {
            log_path: config.ingest.log_path.clone(),
            config: config.detector.clone(),
        }
    }

    pub fn with_paths(log_path: PathBuf, config: DetectorConfig) -> Self {
        Self { log_path, config }
    }

    /// Scan all log files and return ranked candidates, highest priority
    /// and attempt count first.
    pub fn scan(&self) -> Result<ScanOutcome, DetectError> {
        let pattern = format!("{}*", self.log_path.display());
        let mut stats: BTreeMap<String, IpActivity> = BTreeMap::new();

        for path in glob::glob(&pattern)?.filter_map(Result::ok) {
            if let Err(e) = scan_file(&path, &mut stats) {
                warn!(path = %path.display(), error = %e, "Skipping unreadable log file");
            }
        }

        debug!(unique_ips = stats.len(), "Slow brute-force scan complete");
        let unique_ips = stats.len();
        Ok(ScanOutcome {
            candidates: self.rank(stats),
            unique_ips,
        })
    }

    /// Apply the threshold filters and classify the survivors.
    fn rank(&self, stats: BTreeMap<String, IpActivity>) -> Vec<Candidate> {
        let window = self.config.window_secs as f64;
        let mut candidates = Vec::new();

        for (ip, activity) in stats {
            let mut found = activity.found;
            found.sort();
            let count = found.len();
            if count < self.config.min_attempts {
                continue;
            }

            // Consecutive intervals, dropping cross-window artifacts
            let intervals: Vec<f64> = found
                .windows(2)
                .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
                .filter(|delta| *delta < window)
                .collect();
            if intervals.is_empty() {
                continue;
            }

            let avg_int = intervals.iter().sum::<f64>() / intervals.len() as f64;
            if avg_int < self.config.min_interval_secs as f64 {
                // Ordinary fast brute-forcer, already caught by rate limiting
                continue;
            }

            let duration = match (activity.first_seen, activity.last_seen) {
                (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 1000.0,
                _ => 0.0,
            };

            let (status, prio) = if activity.bans == 0 {
                (STATUS_EVASION, 2)
            } else {
                (STATUS_CAUGHT, 1)
            };

            let jail = activity
                .jails
                .iter()
                .take(2)
                .cloned()
                .collect::<Vec<_>>()
                .join(",");

            candidates.push(Candidate {
                ip,
                jail,
                count,
                bans: activity.bans,
                avg_int,
                duration,
                status: status.to_string(),
                prio,
            });
        }

        candidates.sort_by(|a, b| (b.prio, b.count).cmp(&(a.prio, a.count)));
        candidates
    }

    /// Write the machine-readable candidate cache (the `--json` output).
    pub fn write_cache(&self, candidates: &[Candidate]) -> Result<(), DetectError> {
        let path = &self.config.cache_path;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer(file, candidates)?;
        Ok(())
    }
}

fn scan_file(path: &Path, stats: &mut BTreeMap<String, IpActivity>) -> std::io::Result<()> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    for line in BufReader::new(reader).lines() {
        let Ok(line) = line else { continue };
        let Some(caps) = ACTION_RE.captures(&line) else {
            continue;
        };
        // Timestamp is the line prefix; lines without one are skipped
        let Some(at) = parse_prefix_timestamp(&line) else {
            continue;
        };

        let activity = match stats.entry(caps[3].to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(IpActivity::default()),
        };
        activity.touch(at);
        activity.jails.insert(caps[1].to_string());
        match &caps[2] {
            "Found" => activity.found.push(at),
            "Ban" => activity.bans += 1,
            _ => {}
        }
    }
    Ok(())
}

fn parse_prefix_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let prefix = line.get(..19)?;
    NaiveDateTime::parse_from_str(prefix, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Human-readable ranked report table.
pub fn render_report(candidates: &[Candidate], unique_ips: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Analyzed {unique_ips} unique IPs.");
    let _ = writeln!(out, "\n[SLOW BRUTE-FORCE REPORT]");
    let _ = writeln!(out, "{}", "-".repeat(110));
    let _ = writeln!(
        out,
        "{:<18} | {:<15} | {:<5} | {:<4} | {:<8} | {:<8} | {}",
        "IP Address", "Jail", "Found", "Bans", "Avg Int", "Duration", "Status"
    );
    let _ = writeln!(out, "{}", "-".repeat(110));

    for c in candidates {
        let _ = writeln!(
            out,
            "{:<18} | {:<15} | {:<5} | {:<4} | {:<8} | {:<8} | {}",
            c.ip,
            c.jail,
            c.count,
            c.bans,
            format_duration(c.avg_int),
            format_duration(c.duration),
            c.status
        );
    }

    let _ = writeln!(out, "{}", "-".repeat(110));
    let _ = writeln!(out, "Total Slow Attackers Found: {}", candidates.len());

    let evading = candidates.iter().filter(|c| c.status == STATUS_EVASION).count();
    if evading > 0 {
        let _ = writeln!(
            out,
            "\n{evading} IPs evading detection - consider banning permanently!"
        );
    }
    out
}

/// Compact duration for the report table (`45s`, `12m`, `3h`, `2d`).
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{}s", seconds as u64)
    } else if seconds < 3600.0 {
        format!("{}m", (seconds / 60.0) as u64)
    } else if seconds < 86400.0 {
        format!("{}h", (seconds / 3600.0) as u64)
    } else {
        format!("{}d", (seconds / 86400.0) as u64)
    }
}
