//! Platform Controller
//!
//! Drives IntegrationPlatform resources through their install, startup
//! and upgrade lifecycle: renders and applies the bundled manifest set,
//! watches workloads come up, and runs the backup/migrate/reinstall
//! pipeline when the operator build carries a newer platform version.

mod actions;
mod apply;
mod backup;
mod config;
mod context;
mod controller;
mod error;
mod exec;
mod poll;
mod reconciler;
mod render;
mod status;
#[cfg(test)]
mod test_utils;
mod upgrade;

use controller::Controller;

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting Platform Controller");

    let config = OperatorConfig::from_env();

    info!("Configuration:");
    info!("  Target version: {}", config.target_version);
    info!("  Manifest dir: {}", config.manifest_dir.display());
    info!("  Backup dir: {}", config.backup_dir.display());
    info!(
        "  Namespace: {}",
        config.namespace.as_deref().unwrap_or("<client default>")
    );

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
