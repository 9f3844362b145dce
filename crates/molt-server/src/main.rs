use anyhow::Result;
use clap::Parser;
use molt_ecdysis::ProcessRole;
use tracing::info;

use molt_server::{server, telemetry, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Resolved once; everything downstream takes the role as a parameter.
    let role = ProcessRole::from_env();
    let server_config = ServerConfig::parse();

    // Initialize telemetry
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;
    } else {
        telemetry::init_local()
            .map_err(|e| anyhow::anyhow!("Failed to init local telemetry: {}", e))?;
    }

    info!("Molt Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}, role: {}", std::process::id(), role);
    server_config.log_config();

    let outcome = server::start(server_config, role).await?;
    info!(outcome = ?outcome, "Exiting");

    telemetry::shutdown();

    Ok(())
}
