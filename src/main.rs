//! Peeper - Main entry point
//!
//! A TLS-terminating HTTPS interception proxy

use anyhow::Result;
use clap::Parser;
use peeper::{ProxyConfig, ProxyServer, UpstreamVerification};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Peeper - log every HTTPS exchange passing through
#[derive(Parser, Debug)]
#[command(name = "peeper")]
#[command(author = "Peeper Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A TLS-terminating HTTPS interception proxy")]
struct Args {
    /// Address to accept TLS connections on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:443")]
    listen: SocketAddr,

    /// Directory holding the generated per-host certificates
    #[arg(long, env = "CERT_DIR", default_value = "./cert")]
    cert_dir: PathBuf,

    /// Do not verify upstream server certificates
    #[arg(long, env = "INSECURE_UPSTREAM", default_value = "false")]
    insecure_upstream: bool,

    /// Give up on an upstream exchange after this many seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT")]
    upstream_timeout: Option<u64>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting peeper v1.0.0");

    let config = ProxyConfig {
        listen_addr: args.listen,
        cert_dir: args.cert_dir,
        upstream_verification: if args.insecure_upstream {
            UpstreamVerification::Insecure
        } else {
            UpstreamVerification::WebPki
        },
        upstream_timeout: args.upstream_timeout.map(Duration::from_secs),
        ..ProxyConfig::default()
    };

    info!("Certificate store: {}", config.cert_dir.display());

    let server = Arc::new(ProxyServer::from_config(config)?);
    server.run().await?;

    Ok(())
}
