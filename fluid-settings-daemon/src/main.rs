//! Fluid Settings Daemon (`fluid-settingsd`)
//!
//! Loads the setting definitions and the persisted values, joins the
//! communicator bus, listens for peer daemons and serves the control
//! vocabulary until told to stop.

use clap::Parser;
use fluid_settings::{persist, Schema, SettingsStore};
use fluid_settings_daemon::{messenger, peers, DaemonConfig, Server, ServerEvent};
use std::path::Path;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fluid-settingsd", version, about = "Fluid Settings Daemon")]
struct Args {
    /// Configuration file
    #[arg(long, short)]
    config: Option<String>,

    /// Communicator bus address:port
    #[arg(long)]
    communicator: Option<String>,

    /// address:port to listen on for other fluid-settings daemons
    #[arg(long)]
    listen: Option<String>,

    /// Colon-separated list of definition directories
    #[arg(long)]
    definitions: Option<String>,

    /// Path of the persisted settings file
    #[arg(long)]
    settings: Option<String>,

    /// Seconds between gossip announcements
    #[arg(long)]
    gossip_timeout: Option<u64>,

    /// Seconds of quiet before changed settings are saved
    #[arg(long)]
    save_timeout: Option<u64>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("fluid-settingsd v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(communicator) = args.communicator {
        config.communicator = communicator;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(definitions) = args.definitions {
        config.definitions = definitions;
    }
    if let Some(settings) = args.settings {
        config.settings = settings;
    }
    if let Some(gossip_timeout) = args.gossip_timeout {
        config.gossip_timeout = gossip_timeout;
    }
    if let Some(save_timeout) = args.save_timeout {
        config.save_timeout = save_timeout;
    }
    config.validate()?;

    let schema = Schema::load(&config.definitions);
    tracing::info!("{} settings declared", schema.len());
    let mut store = SettingsStore::new(schema);
    match persist::load(&mut store, Path::new(&config.settings)) {
        Ok(applied) => tracing::info!("{applied} saved settings loaded"),
        Err(e) => tracing::warn!("cannot load {}: {e}", config.settings),
    }

    let (event_tx, event_rx) = mpsc::channel(256);
    let listener_address = peers::spawn_listener(config.listen_address()?, event_tx.clone()).await?;
    let bus_tx = messenger::spawn(
        config.communicator.clone(),
        config.server_name.clone(),
        event_tx.clone(),
    );

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        stop_requested().await;
        tracing::info!("stop requested; shutting down");
        let _ = shutdown_tx
            .send(ServerEvent::Shutdown { restart: false })
            .await;
    });

    let server = Server::new(
        config,
        store,
        listener_address,
        bus_tx,
        event_tx,
        event_rx,
    );
    let code = server.run().await;
    tracing::info!("daemon stopped");
    std::process::exit(code);
}

/// RUST_LOG wins when set; otherwise -v/-vv pick the level.
fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resolves once the operator asks the daemon to stop. A daemon that
/// cannot install its signal handlers keeps serving until killed; bus
/// STOP/QUITTING messages still shut it down cleanly.
async fn stop_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut interrupt), Ok(mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
            }
            _ => {
                tracing::error!("cannot install signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
