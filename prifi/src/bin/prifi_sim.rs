// Copyright (c) 2024 The PriFi Authors

//! Runs a whole PriFi session in one process and prints what the relay
//! measured.

use anyhow::{Context, Result};
use clap::Parser;
use prifi::{service, telemetry, PrifiConfig};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "prifi-sim")]
#[command(about = "Run a local PriFi session over in-process channels", long_about = None)]
struct Cli {
    /// Path to a TOML session config (defaults are used otherwise)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of clients
    #[arg(long)]
    clients: Option<usize>,

    /// Override the number of trustees
    #[arg(long)]
    trustees: Option<usize>,

    /// Stop after this many rounds (0 runs until Ctrl+C)
    #[arg(short, long, default_value_t = 100)]
    rounds: u32,

    /// Message every client sends upstream once
    #[arg(short, long)]
    message: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn session_config(&self) -> Result<PrifiConfig> {
        let mut config = match &self.config {
            Some(path) => PrifiConfig::load(path)
                .with_context(|| format!("cannot load {}", path.display()))?,
            None => PrifiConfig::default(),
        };
        if let Some(clients) = self.clients {
            config.n_clients = clients;
        }
        if let Some(trustees) = self.trustees {
            config.n_trustees = trustees;
        }
        if self.rounds > 0 {
            config.experiment_round_limit = Some(self.rounds);
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);
    let config = cli.session_config()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, cli.message))
}

async fn run(config: PrifiConfig, message: Option<String>) -> Result<()> {
    let session = service::spawn_local_session(&config)?;
    if let Some(message) = message {
        for client_id in 0..config.n_clients as u32 {
            session.send_upstream(client_id, format!("{message} ({client_id})").into_bytes())?;
        }
    }

    if config.experiment_round_limit.is_none() {
        println!("Session running. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;
        session.shutdown()?;
    }

    let mut report = session.finish().await?;
    let upstream = report.relay.take_upstream();
    info!(messages = upstream.len(), "session finished");
    for data in &upstream {
        println!("upstream: {}", String::from_utf8_lossy(data));
    }

    match report.relay.take_experiment_results() {
        Some(results) => {
            println!("=== Experiment results ===");
            for line in results {
                println!("  {line}");
            }
        }
        None => warn!("session stopped before its round limit"),
    }
    for client in &report.clients {
        if !client.latencies().is_empty() {
            println!("client {:?} latencies (ms): {:?}", client.id(), client.latencies());
        }
    }
    Ok(())
}
