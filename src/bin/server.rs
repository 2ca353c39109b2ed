//! KVSQL Server

use std::env;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvsql::config::EngineConfig;
use kvsql::executor::Database;
use kvsql::server::Server;
use kvsql::storage::Store;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Config file first, then environment, then flags
fn load_config() -> Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();
    let mut config = EngineConfig::new();
    let mut port = None;
    let mut host = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--config" | "-c" => {
                let path = value.context("--config needs a path")?;
                config = EngineConfig::from_file(path)
                    .with_context(|| format!("loading {}", path))?;
            }
            "--port" | "-p" => {
                let raw = value.context("--port needs a value")?;
                port = Some(raw.parse::<u16>().with_context(|| format!("invalid port: {}", raw))?);
            }
            "--host" | "-H" => host = Some(value.context("--host needs a value")?.clone()),
            other => bail!("unknown argument: {}", other),
        }
        i += 2;
    }

    let mut config = config.with_env()?;
    if let Some(host) = host {
        config = config.host(host);
    }
    if let Some(port) = port {
        config = config.port(port);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let config = load_config()?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting KVSQL server");
    let db = Database::new(Store::memory(), config);
    let vacuum = db.start_vacuum();

    let server = Server::new(db.clone());
    let listener = server.bind().await.context("failed to bind")?;
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    db.vacuum().stop();
    vacuum.await.context("vacuum task panicked")?;
    info!("server stopped");
    Ok(())
}
