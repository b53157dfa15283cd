mod app;
mod collaborators;
mod config;
mod db;
mod domain;
mod error;
mod infrastructure;
mod tasks;
mod telegram;

use anyhow::Result;
use infrastructure::{directories, instance_guard::InstanceGuard, logging, shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let paths = directories::ensure_directories(&config.directories)?;
    logging::init_tracing(&config, &paths)?;

    let instance_guard = InstanceGuard::acquire(&paths)?;

    let (shutdown, _) = shutdown::Shutdown::new();
    shutdown::install_signal_handlers(shutdown.clone());

    let app = app::PostVaultApp::initialize(config, paths, instance_guard, shutdown.clone()).await?;
    app.run().await
}
