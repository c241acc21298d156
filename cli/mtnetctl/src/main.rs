//! mtnetctl - interactive client for mtnet servers
//!
//! Connects before the host supervisor is launched, then sends stdin lines
//! through the outbox while the connection's actor prints replies.

use anyhow::{Context, Result};
use clap::Parser;
use mtnet_dispatch::{ConnectionContext, HostSupervisor};
use mtnet_transport::{Packet, TcpNetwork, TcpNetworkConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod printer;

use cli::Cli;
use printer::PrintHandler;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let net = TcpNetwork::bind(TcpNetworkConfig::client()).context("failed to create network loop")?;
    let factory = |_ctx: &ConnectionContext| PrintHandler::stdout();
    let mut supervisor = HostSupervisor::new(net, factory, cli.supervisor_config());

    let id = supervisor
        .connect(cli.addr)
        .with_context(|| format!("failed to connect to {}", cli.addr))?;
    info!(connection_id = %id, addr = %cli.addr, "Connected");

    supervisor.launch().context("failed to launch host supervisor")?;
    let outbox = supervisor.outbox();
    let reliability = cli.reliability();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line == "quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }

        if let Err(e) = outbox.send(id, Packet::new(line.as_bytes().to_vec(), reliability)) {
            eprintln!("error: {e}");
            break;
        }
        debug!(connection_id = %id, len = line.len(), "Sent line");
    }

    tokio::task::spawn_blocking(move || supervisor.shutdown())
        .await
        .context("shutdown task panicked")?
        .context("host supervisor shutdown failed")?;
    Ok(())
}
