//! hassbridge daemon.
//!
//! Holds one source connection to Home Assistant and serves its state and
//! events to dashboard clients over WebSocket.
//!
//!   hassbridge --config hassbridge.toml

mod config;
mod hub;
mod store;

use anyhow::Context;
use clap::Parser;
use config::DaemonConfig;
use hassbridge_plugin::HassPlugin;
use hassbridge_stream::Multiplexer;
use hub::DashboardHub;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::StateStore;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hassbridge", about = "Home Assistant event bridge")]
struct Args {
    /// Path to the config file.
    #[arg(long, env = "HASSBRIDGE_CONFIG", default_value = "hassbridge.toml")]
    config: PathBuf,

    /// Override the stream listen address.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.debug { "hassbridge=debug" } else { "hassbridge=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let mut config = DaemonConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.stream.bind = bind;
    }

    let store = Arc::new(StateStore::new());
    let plugin = Arc::new(
        HassPlugin::new(config.name.clone(), config.hass, store.clone())
            .context("building source connection")?,
    );

    let hub = DashboardHub::new(store, plugin.client().clone());
    let mux = Multiplexer::new(Arc::new(hub));
    let listener = TcpListener::bind(config.stream.bind)
        .await
        .with_context(|| format!("binding stream to {}", config.stream.bind))?;

    let server = tokio::spawn(hassbridge_stream::serve(listener, mux.clone()));
    let source = tokio::spawn({
        let plugin = plugin.clone();
        async move { plugin.run().await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    plugin.stop();
    mux.stop().await;
    let (server, source) = tokio::join!(server, source);
    server?;
    source?;

    tracing::info!("stopped");
    Ok(())
}
