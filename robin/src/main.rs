use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use robin::{settings, Server};
use robin_common::Signal;

#[derive(Parser, Debug)]
#[command(name = "robin", about = "A configurable MTA", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "robin.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = settings::install(robin_common::config::Config::from_file(&args.config)?);
    tracing::info!(config = %args.config.display(), "configuration loaded");

    let server = Server::from_config(config)?;
    let (shutdown, _) = tokio::sync::broadcast::channel::<Signal>(16);

    let serve = tokio::spawn(server.serve(shutdown.clone()));

    // SIGHUP swaps the configuration snapshot; sessions accepted and
    // scheduler ticks run after the swap see the new values.
    let mut sighup = signal(SignalKind::hangup())?;
    let reload_path = args.config.clone();
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            match settings::reload(&reload_path) {
                Ok(config) => tracing::info!(
                    hostname = %config.server.hostname,
                    "configuration reloaded"
                ),
                Err(error) => tracing::error!(
                    %error,
                    "reload failed, keeping the previous configuration"
                ),
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }

    let _ = shutdown.send(Signal::Shutdown);
    serve.await??;

    Ok(())
}
