//! meshlinkd - meshlink peer daemon
//!
//! Accepts and dials encrypted peer links, keeps them alive with heartbeats
//! and serves request streams until interrupted.

use anyhow::Context;
use clap::Parser;
use meshlinkd::config::{Cli, Config, LogConfig, LogFormat};
use meshlinkd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("meshlinkd: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.log) {
        eprintln!("meshlinkd: {e:#}");
        return ExitCode::FAILURE;
    }

    info!("meshlinkd v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_logging(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)
            .with_context(|| format!("invalid log level {:?}", log.level))?,
    };

    let (pretty, json) = match log.format {
        LogFormat::Pretty => (Some(fmt::layer()), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let server = Server::new(config).context("invalid configuration")?;

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown.stop().await;
        }
    });

    server.start().await.context("server failed")?;
    info!("meshlinkd stopped");
    Ok(())
}
