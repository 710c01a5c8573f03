//! fleet provisioner daemon.
//!
//! Loads a provider configuration, starts the provisioning engine against
//! the configured coordination backend, and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_coordination::{Coordinator, InMemoryCoordinator};
use fleet_provisioner::scan::{KeyScanner, TcpBannerScanner};
use fleet_provisioner::{Config, DriverRegistry, ProvisionerService};

#[derive(Parser, Debug)]
#[command(name = "provisionerd", about = "fleet node provisioner")]
struct Args {
    /// Path to the provider configuration file.
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = Config::from_path(&args.config)?;
    info!(
        config = %args.config.display(),
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let registry = DriverRegistry::with_builtin();
    // Single-process coordination backend; deployments spanning multiple
    // launcher processes plug a shared backend in here.
    let coordinator: Arc<dyn Coordinator> = Arc::new(InMemoryCoordinator::new());
    let scanner: Arc<dyn KeyScanner> = Arc::new(TcpBannerScanner);

    let service = ProvisionerService::start(config, &registry, coordinator, scanner)?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    service.shutdown().await;

    Ok(())
}
