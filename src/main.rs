//! gmfsim - population health simulator
//!
//! Runs every module under the configured module directory for a seeded
//! population of synthetic people.

use gmfsim_core::time::datetime;
use gmfsim_core::ModuleCatalog;
use gmfsim_runner::{Config, DiscardSink, PopulationScheduler};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if GMFSIM_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("GMFSIM_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting gmfsim");
    tracing::info!("  Module directory: {}", config.modules.dir.display());
    tracing::info!("  Population: {} (seed {})", config.population.size, config.population.seed);
    tracing::info!("  Keep: {:?}", config.population.keep);
    tracing::info!(
        "  Timestep: {} days, births from {}",
        config.simulation.timestep_days,
        config.simulation.start_year
    );
    if let Some(stop) = config.simulation.stop_time().and_then(datetime) {
        tracing::info!(
            "  Stop: {} (dual records: {})",
            stop,
            config.simulation.dual_records
        );
    }

    let catalog = match ModuleCatalog::open(&config.modules.dir) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            tracing::error!("Failed to open module directory: {}", e);
            return Err(e.into());
        }
    };

    let scheduler = match PopulationScheduler::new(&config, catalog) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            tracing::error!("Failed to load modules: {}", e);
            return Err(e.into());
        }
    };

    let summary = scheduler.run(Arc::new(DiscardSink)).await;

    if summary.failed > 0 {
        tracing::warn!(
            "{} of {} people failed; see errors above",
            summary.failed,
            summary.population
        );
    }
    tracing::info!(
        "Done: {} people ({} alive, {} dead) in {:?}",
        summary.completed,
        summary.alive,
        summary.dead,
        summary.elapsed
    );
    Ok(())
}
