mod auth;
mod config;
mod connection;
mod error;
mod forward;
mod http_connect;
mod relay;
mod response;
mod server;
mod socks;
mod tunnel;
mod upstream;

use crate::config::{Cli, ProxyConfig};
use crate::connection::ActiveSessions;
use crate::server::ProxyServer;
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tunnel_syndrome=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();

    // Unknown protocol selectors and missing fields stop here
    let config = ProxyConfig::from_cli(args)?;
    let upstream = config.upstream.clone();

    let server = ProxyServer::bind(config).await?;
    info!("HTTP proxy listening on http://{}", server.local_addr()?);
    info!(
        "Upstream {} proxy: {}{}{}",
        upstream.protocol,
        upstream.addr(),
        if upstream.tls { " (tls)" } else { "" },
        if upstream.auth.is_some() { " with credentials" } else { "" }
    );

    tokio::task::spawn(monitor_sessions(server.sessions()));

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = server.run() => {
            warn!("Server loop terminated");
        }
        _ = shutdown => {
            // Open tunnels are not drained
            info!("Server shutdown complete");
        }
    }

    Ok(())
}

/// Periodically report the number of open tunnels when it changes
async fn monitor_sessions(sessions: ActiveSessions) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
    let mut last_active = 0;

    loop {
        interval.tick().await;

        let active = sessions.active();
        if active != last_active {
            info!("Active tunnels: {}", active);
        }
        last_active = active;
    }
}
