//! Advisor Chat - Main entry point.

use advisor_common::config::Config;
use advisor_common::logging::init_logging_with_exclusions;
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    // Load and validate configuration
    let config = Config::load_and_validate()?;

    // Initialize logging
    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Advisor Chat v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        duration_ms = startup_start.elapsed().as_millis() as u64,
        model = %config.llm.model,
        "Configuration loaded"
    );

    advisor_chat::start_server(&config).await
}
