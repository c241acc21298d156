//! mtnet echo server
//!
//! Runs a host supervisor over a TCP network loop. Stops on Ctrl-C or when
//! `quit` is typed on stdin, then drains and joins every connection.

use std::io::BufRead;

use anyhow::{Context, Result};
use mtnet_dispatch::HostSupervisor;
use mtnet_echo::{Config, EchoFactory};
use mtnet_transport::TcpNetwork;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        bind_addr = %config.bind_addr,
        max_connections = config.max_connections,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        "Starting mtnet echo server"
    );

    let net = TcpNetwork::bind(config.network_config())
        .with_context(|| format!("failed to listen on {}", config.bind_addr))?;
    if let Some(addr) = net.local_addr() {
        info!(local_addr = %addr, "Listening");
    }

    let factory = EchoFactory::new();
    let stats = factory.stats();
    let mut supervisor = HostSupervisor::new(net, factory, config.supervisor_config());
    supervisor.launch().context("failed to launch host supervisor")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        Ok(()) = quit_command() => {
            info!("Received quit command");
        }
    }

    // Joining blocks until every connection has drained.
    tokio::task::spawn_blocking(move || supervisor.shutdown())
        .await
        .context("shutdown task panicked")?
        .context("host supervisor shutdown failed")?;

    info!(
        connections = stats.connections.load(std::sync::atomic::Ordering::Relaxed),
        packets_echoed = stats.packets_echoed.load(std::sync::atomic::Ordering::Relaxed),
        "Echo server shutdown complete"
    );
    Ok(())
}

/// Resolves when `quit` is read from stdin. Never resolves with `Ok` on EOF.
fn quit_command() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim() == "quit" => {
                    let _ = tx.send(());
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });
    rx
}
