//! slowscan - offline slow brute-force detector.
//!
//! Scans the fail2ban log family for IPs spacing their attempts to stay
//! under the rate-based ban threshold and prints a ranked report. With
//! `--json`, also writes the machine-readable candidate cache consumed by
//! the display layer as a pseudo-jail.
//!
//! Usage: slowscan [--json] [config.toml]

use banwatch::config::Config;
use banwatch::detect::{render_report, SlowScan};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let mut json_output = false;
    let mut config_path = "banwatch.toml".to_string();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json_output = true,
            other => config_path = other.to_string(),
        }
    }

    let config = Config::load_or_default(&config_path)?;
    let scan = SlowScan::new(&config);
    let outcome = scan.scan()?;

    if json_output {
        scan.write_cache(&outcome.candidates)?;
        info!(
            path = %config.detector.cache_path.display(),
            candidates = outcome.candidates.len(),
            "Wrote candidate cache"
        );
    }

    // The report table is always printed
    print!("{}", render_report(&outcome.candidates, outcome.unique_ips));

    Ok(())
}
