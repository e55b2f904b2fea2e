//! Eddy control service binary.

use tracing::info;
use tracing_subscriber::EnvFilter;

use eddy_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("eddy_control=info".parse()?))
        .init();

    info!("Eddy control service starting");

    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        workspace = %config.workspace.remote,
        artifacts = %config.artifacts.store_url,
        submitter = %config.submitter.url,
        "configuration loaded"
    );

    ControlService::new(config).run().await?;
    Ok(())
}
