//! banwatch - fail2ban log analytics.
//!
//! Ingests intrusion-prevention events (failed logins, bans, unbans) from
//! fail2ban logs, maintains a persistent per-IP threat profile with a 0-100
//! danger score, and runs an offline detector for slow brute-force campaigns
//! that space their attempts to stay under rate-based ban thresholds.

pub mod config;
pub mod detect;
pub mod error;
pub mod fail2ban;
pub mod ingest;
pub mod store;

pub use config::Config;
pub use detect::SlowScan;
pub use ingest::Collector;
pub use store::AttackStore;
