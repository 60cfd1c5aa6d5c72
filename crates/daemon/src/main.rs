use anyhow::{Context, Result};
use lethe::{EngineConfig, InvalidationService, SweepOptions, SweepScheduler};
use std::env;
use tracing_subscriber::EnvFilter;

/// Truthy values for the boolean `LETHE_*` switches.
fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for the one-shot JSON result.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env().context("invalid LETHE_* configuration")?;
    let service = InvalidationService::open(config.clone())
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    let seeded = service
        .ensure_default_rules()
        .await
        .context("failed to seed default rules")?;
    tracing::info!(db_path = %config.db_path.display(), seeded, "lethe daemon ready");

    if flag("LETHE_SWEEP_ONCE") {
        let options = if flag("LETHE_DRY_RUN") {
            SweepOptions::dry_run()
        } else {
            SweepOptions::live()
        };
        let options = match env::var("LETHE_SOURCE_FILTER") {
            Ok(source) if !source.is_empty() => options.with_source(source),
            _ => options,
        };
        let result = service.run_sweep(&options).await.context("sweep failed")?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let scheduler = SweepScheduler::from_service(service).spawn();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    let report = scheduler.shutdown().await.context("scheduler task failed")?;
    tracing::info!(
        sweeps_run = report.sweeps_run,
        sweeps_failed = report.sweeps_failed,
        "lethe daemon stopped"
    );
    Ok(())
}
