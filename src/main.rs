/// hemis-sync - one-shot sync runner
///
/// Syncs `SYNC_IDENTITY_ID` when set, otherwise every active identity, then exits.
/// Scheduling repeated runs is left to cron or whatever invokes the binary.
use anyhow::Context;
use hemis_sync::{AppContext, EngineConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = EngineConfig::from_env().context("failed to load configuration")?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "hemis_sync=debug".into());
    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("hemis-sync v{}", env!("CARGO_PKG_VERSION"));

    // Create engine context
    let ctx = AppContext::new(config).await.context("failed to start engine")?;

    match std::env::var("SYNC_IDENTITY_ID").ok() {
        Some(raw) => {
            let identity_id: i64 = raw
                .parse()
                .with_context(|| format!("SYNC_IDENTITY_ID is not a number: {}", raw))?;
            let outcome = ctx.coordinator.sync(identity_id).await?;
            info!(
                "Identity {} synced: changed={} fields={:?} unresolved={:?}",
                identity_id, outcome.changed, outcome.changed_fields, outcome.unresolved
            );
        }
        None => {
            let report = ctx.coordinator.sync_all().await?;
            for failure in &report.failures {
                error!(
                    "Identity {} failed ({}): {}",
                    failure.identity_id, failure.code, failure.message
                );
            }
        }
    }

    let purged = ctx.coordinator.purge_cache().await?;
    info!("Done ({} expired cache entries purged)", purged);

    Ok(())
}
