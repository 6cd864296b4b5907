//! banwatchd - fail2ban log analytics daemon.
//!
//! Polls the fail2ban logs into the attack record store and periodically
//! recomputes danger scores, aggregate stats, and per-record pattern
//! analysis. Display and enforcement live elsewhere.

use banwatch::config::Config;
use banwatch::fail2ban::Fail2banClient;
use banwatch::ingest::Collector;
use banwatch::store::AttackStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "banwatch.toml".to_string());
    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        store = %config.store.path.display(),
        log = %config.ingest.log_path.display(),
        "Starting banwatchd"
    );

    // Open the attack record store
    let store = Arc::new(AttackStore::open(&config.store.path));
    info!(
        ips = store.get_stats().total_ips,
        active_bans = store.get_stats().active_bans,
        "Attack store ready"
    );

    // Probe the fail2ban daemon (informational only; ingestion reads logs)
    let client = Fail2banClient::default();
    if client.is_running().await {
        let jails = client.get_jails().await;
        info!(jails = ?jails, "fail2ban daemon detected");
    } else {
        warn!("fail2ban daemon not reachable; parsing logs only");
    }

    let collector = Arc::new(Collector::new(Arc::clone(&store), &config));

    // Ingestion poll: incremental log parse + save
    {
        let collector = Arc::clone(&collector);
        let poll = Duration::from_secs(config.ingest.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                let collector = Arc::clone(&collector);
                let result = tokio::task::spawn_blocking(move || {
                    let report = collector.run();
                    collector.store().save()?;
                    Ok::<_, banwatch::error::StoreError>(report)
                })
                .await;

                match result {
                    Ok(Ok(report)) => {
                        if report.bans + report.unbans + report.attempts > 0 {
                            info!(
                                bans = report.bans,
                                unbans = report.unbans,
                                attempts = report.attempts,
                                new_ips = report.new_ips,
                                "Ingestion pass applied events"
                            );
                        }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, code = e.error_code(), "Ingestion save failed");
                    }
                    Err(e) => {
                        error!(error = %e, "Ingestion task panicked");
                    }
                }
            }
        });
    }
    info!("Ingestion poll task started");

    // Analysis pass: danger scores, aggregate stats, pattern flags
    {
        let store = Arc::clone(&store);
        let findtime = config.ingest.findtime_secs;
        let every = Duration::from_secs(config.ingest.analysis_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let store = Arc::clone(&store);
                let result = tokio::task::spawn_blocking(move || {
                    store.recalculate_danger_scores();
                    store.recalculate_stats();
                    let summary = store.analyze_all_patterns(findtime);
                    store.save()?;
                    Ok::<_, banwatch::error::StoreError>(summary)
                })
                .await;

                match result {
                    Ok(Ok(summary)) => {
                        info!(
                            analyzed = summary.analyzed,
                            threats = summary.threats,
                            evading = summary.evading,
                            "Analysis pass complete"
                        );
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, code = e.error_code(), "Analysis save failed");
                    }
                    Err(e) => {
                        error!(error = %e, "Analysis task panicked");
                    }
                }
            }
        });
    }
    info!("Analysis task started");

    // Run until interrupted, then flush once more
    tokio::signal::ctrl_c().await?;
    info!("Shutting down, saving store");
    let store = Arc::clone(&store);
    tokio::task::spawn_blocking(move || store.save()).await??;

    Ok(())
}
