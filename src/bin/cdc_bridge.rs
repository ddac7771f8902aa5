//! Process entry point: load configuration, initialize logging, and run
//! the outer driver loop until a termination signal arrives.
//!
//! `clap` is retained only for `--help`/`--version` scaffolding; the
//! settings themselves are env-var-only, parsed by [`cdc_bridge::config`].

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cdc_bridge::config::Config;
use cdc_bridge::{logging, supervisor};

#[derive(Parser)]
#[command(
    name = "cdc_bridge",
    version,
    about = "Streams Postgres logical replication into a partitioned append log"
)]
struct Cli {}

#[tokio::main]
async fn main() {
    let _cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    logging::init(config.log_format);

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    supervisor::run_forever(&config, &cancel).await;
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
