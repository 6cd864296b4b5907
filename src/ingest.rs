//! Fail2ban log ingestion.
//!
//! Converts raw, possibly-rotated, possibly-gzipped fail2ban logs into
//! typed events applied to the attack record store at most once each.
//! Rotated files (oldest first) are processed before the current log; the
//! current log carries a persisted line-count cursor so each poll only
//! re-reads the tail.

use crate::config::{Config, IngestConfig, JailsConfig};
use crate::error::StoreError;
use crate::store::AttackStore;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

lazy_static! {
    // 2024-01-15 10:23:45,123 fail2ban.actions [12345]: NOTICE [sshd] Ban 192.0.2.1
    static ref BAN_RE: Regex = Regex::new(
        r"^(?P<timestamp>\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}),\d+\s+fail2ban\.\w+\s+\[\d+\]:\s+\w+\s+\[(?P<jail>[^\]]+)\]\s+Ban\s+(?P<ip>\S+)"
    )
    .expect("ban pattern compiles");

    // 2024-01-15 10:23:45,123 fail2ban.actions [12345]: NOTICE [sshd] Unban 192.0.2.1
    static ref UNBAN_RE: Regex = Regex::new(
        r"^(?P<timestamp>\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}),\d+\s+fail2ban\.\w+\s+\[\d+\]:\s+\w+\s+\[(?P<jail>[^\]]+)\]\s+Unban\s+(?P<ip>\S+)"
    )
    .expect("unban pattern compiles");

    // 2024-01-15 10:23:45,123 fail2ban.filter [12345]: INFO [sshd] Found 192.0.2.1
    static ref FOUND_RE: Regex = Regex::new(
        r"^(?P<timestamp>\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}),\d+\s+fail2ban\.filter\s+\[\d+\]:\s+INFO\s+\[(?P<jail>[^\]]+)\]\s+Found\s+(?P<ip>\S+)"
    )
    .expect("found pattern compiles");
}

/// Kind of a classified log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Ban,
    Unban,
    Found,
}

/// One classified log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: EventKind,
    pub jail: String,
    pub ip: String,
    /// `None` when the matched timestamp failed to parse; the event is
    /// still applied (with "now" substituted by the store).
    pub timestamp: Option<DateTime<Utc>>,
}

/// Classify one raw log line. Lines matching no pattern yield `None` and
/// are silently skipped by the caller.
pub fn parse_line(line: &str) -> Option<LogEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    for (re, kind) in [
        (&*BAN_RE, EventKind::Ban),
        (&*UNBAN_RE, EventKind::Unban),
        (&*FOUND_RE, EventKind::Found),
    ] {
        if let Some(caps) = re.captures(line) {
            let timestamp = NaiveDateTime::parse_from_str(&caps["timestamp"], "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc());
            return Some(LogEvent {
                kind,
                jail: caps["jail"].to_string(),
                ip: caps["ip"].to_string(),
                timestamp,
            });
        }
    }
    None
}

/// Per-run ingestion summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub bans: u64,
    pub unbans: u64,
    pub attempts: u64,
    pub new_ips: u64,
    pub logs_parsed: Vec<String>,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.bans += other.bans;
        self.unbans += other.unbans;
        self.attempts += other.attempts;
        self.new_ips += other.new_ips;
        self.logs_parsed.extend(other.logs_parsed);
    }
}

/// Log collector: discovers log files, classifies lines, applies events.
///
/// Not safe to run from two workers over the same cursor; callers serialize
/// ingestion externally (one scheduled task).
pub struct Collector {
    store: Arc<AttackStore>,
    log_path: PathBuf,
    jails: JailsConfig,
    findtime_secs: u64,
}

impl Collector {
    pub fn new(store: Arc<AttackStore>, config: &Config) -> Self {
        Self::with_configs(store, &config.ingest, config.jails.clone())
    }

    pub fn with_configs(store: Arc<AttackStore>, ingest: &IngestConfig, jails: JailsConfig) -> Self {
        Self {
            store,
            log_path: ingest.log_path.clone(),
            jails,
            findtime_secs: ingest.findtime_secs,
        }
    }

    pub fn store(&self) -> &Arc<AttackStore> {
        &self.store
    }

    /// fail2ban findtime for per-record pattern analysis.
    pub fn findtime_secs(&self) -> u64 {
        self.findtime_secs
    }

    /// One incremental ingestion pass over all discovered log files.
    ///
    /// Missing or unreadable files are logged and skipped, never a hard
    /// failure. Events within one file apply strictly in line order;
    /// rotated files always apply before the current log.
    pub fn run(&self) -> IngestReport {
        let mut report = IngestReport::default();
        let files = self.log_files();
        if files.is_empty() {
            warn!(path = %self.log_path.display(), "No fail2ban log files found");
            return report;
        }

        for file in files {
            match self.parse_single_log(&file) {
                Ok(file_report) => {
                    report.logs_parsed.push(file.display().to_string());
                    report.absorb(file_report);
                }
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "Skipping unreadable log file");
                }
            }
        }

        debug!(
            bans = report.bans,
            unbans = report.unbans,
            attempts = report.attempts,
            new_ips = report.new_ips,
            logs = report.logs_parsed.len(),
            "Ingestion pass complete"
        );
        report
    }

    /// Full re-parse for recovery/backfill. Optionally resets the cursors
    /// first, then recalculates stats and saves.
    pub fn parse_full(&self, reset_positions: bool) -> Result<IngestReport, StoreError> {
        if reset_positions {
            self.store.reset_log_positions();
        }
        let report = self.run();
        self.store.recalculate_stats();
        self.store.mark_full_sync();
        self.store.save()?;
        Ok(report)
    }

    /// Discover log files matching `<log_path>*`, ordered oldest first:
    /// highest rotation index (or `.gz`) first, the current file strictly
    /// last.
    pub fn log_files(&self) -> Vec<PathBuf> {
        let pattern = format!("{}*", self.log_path.display());
        let mut files: Vec<PathBuf> = match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid log glob pattern");
                return Vec::new();
            }
        };

        let current = self.log_path.clone();
        files.sort_by_key(|path| {
            if *path == current {
                // Current log last
                (1, 0)
            } else {
                (0, -rotation_index(path, &current))
            }
        });
        files
    }

    fn is_current(&self, path: &Path) -> bool {
        path == self.log_path
    }

    /// Parse one log file, applying each classified event once.
    ///
    /// Only the current (non-rotated) file consults and updates the
    /// persisted cursor; rotated files are always re-scanned in full.
    fn parse_single_log(&self, path: &Path) -> std::io::Result<IngestReport> {
        let mut report = IngestReport::default();
        let is_current = self.is_current(path);
        let log_key = path.display().to_string();

        let last_position = if is_current {
            self.store
                .log_position(&log_key)
                .map(|p| p.position)
                .unwrap_or(0)
        } else {
            0
        };

        let file = File::open(path)?;
        let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut line_num: u64 = 0;
        let mut last_line: Option<String> = None;
        for line in BufReader::new(reader).lines() {
            // Undecodable lines are skipped, not fatal
            let Ok(line) = line else { continue };
            line_num += 1;
            if line_num <= last_position {
                continue;
            }
            if let Some(event) = parse_line(&line) {
                self.apply_event(&event, &mut report);
            }
            last_line = Some(line);
        }

        if is_current {
            self.store
                .set_log_position(&log_key, line_num, file_inode(path), last_line);
        }

        Ok(report)
    }

    fn apply_event(&self, event: &LogEvent, report: &mut IngestReport) {
        if self.store.get_ip(&event.ip).is_none() {
            report.new_ips += 1;
        }

        match event.kind {
            EventKind::Ban => {
                let duration = self.jails.bantime_for(&event.jail);
                self.store
                    .record_ban(&event.ip, &event.jail, duration, 0, event.timestamp);
                report.bans += 1;
                debug!(ip = %event.ip, jail = %event.jail, "Recorded ban");
            }
            EventKind::Unban => {
                self.store.record_unban(&event.ip, &event.jail, event.timestamp);
                report.unbans += 1;
                debug!(ip = %event.ip, jail = %event.jail, "Recorded unban");
            }
            EventKind::Found => {
                self.store.record_attempt(&event.ip, &event.jail, event.timestamp);
                report.attempts += 1;
            }
        }
    }
}

/// Rotation index of a rotated log (`fail2ban.log.2.gz` -> 2). Unknown
/// suffixes sort as 0, i.e. just before the current file.
fn rotation_index(path: &Path, current: &Path) -> i64 {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let current_name = current.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.strip_prefix(current_name)
        .and_then(|suffix| {
            suffix
                .trim_start_matches('.')
                .trim_end_matches(".gz")
                .parse::<i64>()
                .ok()
        })
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_inode(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).map(|m| m.ino()).unwrap_or(0)
}

#[cfg(not(unix))]
fn file_inode(_path: &Path) -> u64 {
    0
}
