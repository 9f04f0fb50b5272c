use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use reclip_server::config::{self, Config, DEFAULT_PORT};
use reclip_server::net::server::Server;
use reclip_server::net::tls;

#[derive(Parser)]
#[command(name = "reclip-server", version, about = "Clipboard history sync server")]
struct Cli {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,
    /// Application data directory holding config.toml and the TLS files
    #[arg(long)]
    app_data_dir: Option<PathBuf>,
    /// Serve plain TCP instead of TLS
    #[arg(long)]
    no_tls: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app_data_dir = config::init_app_data_dir(cli.app_data_dir)?;
    let config = Config::load(&app_data_dir)?;
    let port = cli.port.or(config.port).unwrap_or(DEFAULT_PORT);

    let acceptor = if cli.no_tls {
        None
    } else {
        Some(tls::load_acceptor(&app_data_dir)?)
    };

    let server = Server::from_config(&config)?.start()?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    tokio::select! {
        result = server.listen(listener, acceptor) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    server.shutdown()?;
    Ok(())
}
