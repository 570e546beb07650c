// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, SessionCommands};
use maestro_core::{ClientConnection, KernelBuilder};
use maestro_session::SessionStore;
use maestro_supervisor::CliSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = maestro_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Sessions { command } => sessions_cmd(config, command).await,
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::Classify { prompt } => {
            let c = maestro_orchestrator::classify(
                &prompt,
                &[],
                config.orchestrator.trivial_threshold,
            );
            println!("{}", serde_json::to_string_pretty(&c)?);
            Ok(())
        }
    }
}

/// Logging: quiet by default so the stdio protocol stays clean.  Opt in
/// with --verbose (stderr) or MAESTRO_LOG_FILE (file).
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("MAESTRO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));

    if let Ok(path) = std::env::var("MAESTRO_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(file).with_ansi(false))
                .init();
            return;
        }
    }
    if verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn serve(config: maestro_config::Config) -> anyhow::Result<()> {
    let store = Arc::new(
        SessionStore::open(&config.store.data_dir()).context("opening session store")?,
    );
    let driver = Arc::new(CliSupervisor::from_config(&config));
    let kernel = KernelBuilder::new(config, store, driver).build();
    let _sweeper = kernel.spawn_sweeper();
    info!("maestro kernel up");

    let (out_tx, mut out_rx) = mpsc::channel(1024);
    let mut connection = ClientConnection::new(kernel, out_tx);

    // Outbound: one JSON event per line.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(ev) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&ev) else {
                continue;
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Inbound: one JSON control message per line.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(msg) => connection.handle(msg).await,
            Err(e) => warn!("bad control message: {e}"),
        }
    }

    drop(connection);
    let _ = writer.await;
    Ok(())
}

async fn sessions_cmd(
    config: maestro_config::Config,
    command: SessionCommands,
) -> anyhow::Result<()> {
    let store = SessionStore::open(&config.store.data_dir()).context("opening session store")?;
    match command {
        SessionCommands::List { limit } => {
            let sessions = store.list(limit, 0).await?;
            if sessions.is_empty() {
                println!("no sessions");
                return Ok(());
            }
            for s in sessions {
                println!(
                    "{}  {:20}  {}  {} msgs, {} agents  ({})",
                    s.id,
                    s.name,
                    s.provider,
                    s.message_count,
                    s.agent_count,
                    s.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        SessionCommands::Show { id } => {
            let session = store.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        SessionCommands::Delete { id } => {
            store.delete(&id).await?;
            println!("deleted {id}");
        }
        SessionCommands::Export { id } => {
            println!("{}", store.export(&id).await?);
        }
        SessionCommands::Import { path } => {
            let dump = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let session = store.import(&dump).await?;
            println!("imported as {}", session.id);
        }
    }
    Ok(())
}
