// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use dd_procctl::config::{ADDRESS_ENV, DaemonConfig};
use dd_procctl::controller::ProcessController;
use dd_procctl::master::{Master, SERVER_MANAGER_PROCESS_NAME};
use dd_procctl::server::PeerServer;
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Supervise COMMAND as the server manager and every process it adds.
#[derive(Debug, Parser)]
#[command(name = "dd-procctld", version)]
struct Cli {
    /// Working directory of the initial process
    working_dir: PathBuf,

    /// Initial process command line
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::from_env();

    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level '{}'", config.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::io::stdout().is_terminal())
        .init();
    config.validate()?;
    info!(version = env!("CARGO_PKG_VERSION"), "dd-procctld starting");

    let initial = config.initial_process()?;
    let mut env = initial.environment(std::env::vars())?;

    let controller = ProcessController::new();
    let server = PeerServer::bind(&config.listen_addr, controller.clone())
        .await
        .with_context(|| format!("binding peer server on {}", config.listen_addr))?;
    let addr = server.local_addr().context("resolving peer server address")?;
    env.insert(ADDRESS_ENV.to_string(), addr.to_string());

    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(server.run(cancel.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let registered = controller
        .add_initial_process(
            SERVER_MANAGER_PROCESS_NAME,
            cli.command,
            env,
            cli.working_dir,
            initial.respawn.into_policy(),
        )
        .await;
    if registered.is_some() {
        controller.start_process(SERVER_MANAGER_PROCESS_NAME).await;
    }

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = controller.wait_for_shutdown() => info!("shutdown requested by peer"),
    }

    controller.shutdown().await;
    cancel.cancel();
    let _ = server_task.await;
    info!("dd-procctld shut down");
    Ok(())
}
