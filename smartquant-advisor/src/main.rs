//! SmartQuant Advisor - T+1 portfolio tracker and market-aware decision loop
//! for A-shares.

use anyhow::Result;
use smartquant_advisor::AdvisorService;
use smartquant_common::logging::init_logging;
use smartquant_common::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Start timing immediately for cold-start measurement
    let startup_start = std::time::Instant::now();

    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(&config.observability);

    tracing::info!("SmartQuant Advisor v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        data_dir = %config.data_dir().display(),
        strategy = config.scheduler.strategy.label(),
        period_minutes = config.scheduler.period_minutes,
        "Configuration loaded"
    );

    let service = AdvisorService::new(config);

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    service.start().await
}
