//! Collaborator wrapper around `fail2ban-client`.
//!
//! Live jail queries and ban/unban commands. The attack record store is
//! never mutated on the basis of a command attempt; recorded state comes
//! only from observed log events, so a failed command here cannot
//! desynchronize it.

use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tracing::{info, warn};

lazy_static! {
    static ref JAIL_LIST_RE: Regex = Regex::new(r"Jail list:\s*(.+)").expect("jail list pattern");
    static ref COUNTER_RE: Regex =
        Regex::new(r"(Currently failed|Total failed|Currently banned|Total banned):\s*(\d+)")
            .expect("counter pattern");
    static ref BANNED_LIST_RE: Regex =
        Regex::new(r"Banned IP list:\s*(.*)$").expect("banned list pattern");
}

/// Parsed `fail2ban-client status <jail>` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JailStatus {
    pub name: String,
    pub currently_failed: u64,
    pub total_failed: u64,
    pub currently_banned: u64,
    pub total_banned: u64,
    pub banned_ips: Vec<String>,
}

/// Jail configuration values queried from the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JailConfig {
    pub findtime: Option<u64>,
    pub bantime: Option<u64>,
    pub maxretry: Option<u64>,
}

/// Async wrapper over the `fail2ban-client` binary.
pub struct Fail2banClient {
    timeout: Duration,
}

impl Default for Fail2banClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Fail2banClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run one `fail2ban-client` command. Returns `None` on spawn failure,
    /// non-zero exit, or timeout.
    async fn run_command(&self, args: &[&str]) -> Option<String> {
        let future = tokio::process::Command::new("fail2ban-client")
            .args(args)
            .output();

        let output = match tokio::time::timeout(self.timeout, future).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(args = ?args, error = %e, "fail2ban-client failed to spawn");
                return None;
            }
            Err(_) => {
                warn!(args = ?args, timeout = ?self.timeout, "fail2ban-client timed out");
                return None;
            }
        };

        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            warn!(
                args = ?args,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "fail2ban-client command failed"
            );
            None
        }
    }

    /// Whether the fail2ban daemon answers status queries.
    pub async fn is_running(&self) -> bool {
        match self.run_command(&["status"]).await {
            Some(output) => output.contains("Number of jail"),
            None => false,
        }
    }

    /// Active jail names.
    pub async fn get_jails(&self) -> Vec<String> {
        let Some(output) = self.run_command(&["status"]).await else {
            return Vec::new();
        };
        parse_jail_list(&output)
    }

    /// Status of one jail.
    pub async fn get_jail_status(&self, jail: &str) -> JailStatus {
        match self.run_command(&["status", jail]).await {
            Some(output) => parse_jail_status(jail, &output),
            None => JailStatus {
                name: jail.to_string(),
                ..Default::default()
            },
        }
    }

    /// findtime / bantime / maxretry of one jail.
    pub async fn get_jail_config(&self, jail: &str) -> JailConfig {
        JailConfig {
            findtime: self.get_jail_value(jail, "findtime").await,
            bantime: self.get_jail_value(jail, "bantime").await,
            maxretry: self.get_jail_value(jail, "maxretry").await,
        }
    }

    async fn get_jail_value(&self, jail: &str, key: &str) -> Option<u64> {
        self.run_command(&["get", jail, key])
            .await
            .and_then(|out| out.parse::<u64>().ok())
    }

    /// Ban an IP in a jail. Success means only that the command was
    /// accepted; recorded state still comes from the logs.
    pub async fn ban_ip(&self, ip: &str, jail: &str) -> bool {
        let success = self.run_command(&["set", jail, "banip", ip]).await.is_some();
        if success {
            info!(ip = %ip, jail = %jail, "Issued ban command");
        }
        success
    }

    /// Unban an IP from one jail, or from all jails when `jail` is `None`.
    pub async fn unban_ip(&self, ip: &str, jail: Option<&str>) -> bool {
        let success = match jail {
            Some(jail) => self.run_command(&["set", jail, "unbanip", ip]).await.is_some(),
            None => self.run_command(&["unban", ip]).await.is_some(),
        };
        if success {
            info!(ip = %ip, jail = jail.unwrap_or("*"), "Issued unban command");
        }
        success
    }
}

fn parse_jail_list(output: &str) -> Vec<String> {
    JAIL_LIST_RE
        .captures(output)
        .map(|caps| {
            caps[1]
                .split(',')
                .map(|j| j.trim().to_string())
                .filter(|j| !j.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_jail_status(jail: &str, output: &str) -> JailStatus {
    let mut status = JailStatus {
        name: jail.to_string(),
        ..Default::default()
    };

    for line in output.lines() {
        if let Some(caps) = COUNTER_RE.captures(line) {
            let value: u64 = caps[2].parse().unwrap_or(0);
            match &caps[1] {
                "Currently failed" => status.currently_failed = value,
                "Total failed" => status.total_failed = value,
                "Currently banned" => status.currently_banned = value,
                "Total banned" => status.total_banned = value,
                _ => {}
            }
        } else if let Some(caps) = BANNED_LIST_RE.captures(line) {
            status.banned_ips = caps[1]
                .split_whitespace()
                .map(|ip| ip.to_string())
                .collect();
        }
    }
    status
}
