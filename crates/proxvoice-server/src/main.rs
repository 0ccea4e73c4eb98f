use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use proxvoice_server::{Collaborators, MemoryLookup, ServerConfig, ServerHooks, VoiceServer};

#[derive(Parser)]
#[command(name = "proxvoice-server", about = "Standalone proximity voice server")]
struct Args {
    /// Directory holding config.toml, mutes.json and forwarding-secret
    #[arg(short, long, default_value = "proxvoice")]
    config_dir: PathBuf,

    /// UDP bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// UDP port, overrides config
    #[arg(long)]
    udp_port: Option<u16>,

    /// TCP port, overrides config
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Port used when the UDP port is 0
    #[arg(long)]
    game_port: Option<u16>,
}

/// Applies the command line on every config (re)load.
struct CliOverrides {
    host: Option<String>,
    udp_port: Option<u16>,
    tcp_port: Option<u16>,
}

impl ServerHooks for CliOverrides {
    fn on_config_loaded(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.ip = host.clone();
        }
        if let Some(port) = self.udp_port {
            config.host.port = port;
        }
        if let Some(port) = self.tcp_port {
            config.tcp.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxvoice_server=info".into()),
        )
        .init();

    // Install the ring crypto provider for rustls
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("a rustls crypto provider was already installed");
    }

    let args = Args::parse();

    let hooks = Arc::new(CliOverrides {
        host: args.host,
        udp_port: args.udp_port,
        tcp_port: args.tcp_port,
    });
    // Standalone: no game server to ask, everyone is admitted.
    let mut collaborators = Collaborators::new(Arc::new(MemoryLookup::open())).with_hooks(hooks);
    if let Some(port) = args.game_port {
        collaborators = collaborators.with_game_port(port);
    }

    info!("proxvoice server starting");
    let server = VoiceServer::new(&args.config_dir, collaborators);
    server
        .initialize()
        .await
        .with_context(|| format!("failed to start from {}", args.config_dir.display()))?;

    info!(
        tcp = ?server.tcp_addr(),
        udp = ?server.udp_addr().await,
        "server ready, accepting connections"
    );

    wait_for_shutdown(&server).await;
    server.shutdown().await;
    Ok(())
}

/// Waits for Ctrl-C. On unix, SIGHUP reloads the config.
#[cfg(unix)]
async fn wait_for_shutdown(server: &VoiceServer) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("SIGHUP reload unavailable: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for Ctrl-C: {}", e);
            }
            return;
        }
    };
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("failed to listen for Ctrl-C: {}", e);
                }
                return;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading config");
                if let Err(e) = server.load_config().await {
                    error!("config reload failed, keeping previous config: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &VoiceServer) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {}", e);
    }
}
