//! otunnel client
//!
//! Connects to a server, opens the configured tunnels over the link and
//! reconnects whenever the link goes down.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use otunnel::config::{ClientConfig, Config, LinkSettings};
use otunnel::crypto::{derive_link_keys, LinkKeys, Role};
use otunnel::transport::{self, client_hello, FramedConn};
use otunnel::{logging, Link, TunnelConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// otunnel client - opens port-forwarding tunnels over a secure link
#[derive(Parser, Debug)]
#[command(name = "otunnel-client")]
#[command(about = "otunnel client - opens port-forwarding tunnels over a secure link")]
#[command(version)]
struct Args {
    /// Server address (overrides config)
    server: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Tunnel to open, as f|r[:tcp|udp]:local_host:local_port:remote_host:remote_port
    #[arg(short, long = "tunnel")]
    tunnels: Vec<String>,

    /// Shared secret for enciphered framing
    #[arg(short, long)]
    secret: Option<String>,

    /// CA certificate (PEM) to verify a TLS server
    #[arg(long)]
    tls_ca: Option<String>,

    /// Server name expected in the TLS certificate
    #[arg(long)]
    tls_server_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<String>,
}

/// How the connection is wrapped before the hello
enum Wrapping {
    Plain,
    Secret(LinkKeys),
    #[cfg(feature = "tls")]
    Tls(transport::TlsClient),
}

/// Client state shared across reconnects
struct ClientState {
    server_addr: String,
    wrapping: Wrapping,
    tunnels: Vec<TunnelConfig>,
    link: LinkSettings,
    connect_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    logging::init(&config.logging).context("Failed to initialize logging")?;

    let mut client_config = config.client.clone().unwrap_or_default();
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if !args.tunnels.is_empty() {
        client_config.tunnels = args.tunnels;
    }
    if args.secret.is_some() {
        client_config.secret = args.secret;
    }
    if args.tls_ca.is_some() {
        client_config.tls_ca = args.tls_ca;
    }
    if args.tls_server_name.is_some() {
        client_config.tls_server_name = args.tls_server_name;
    }

    let tunnels = client_config
        .tunnel_configs()
        .context("Invalid tunnel specification")?;
    if tunnels.is_empty() {
        warn!("No tunnels configured");
    }

    let state = ClientState {
        server_addr: client_config.server.clone(),
        wrapping: wrapping(&client_config, &config.link)?,
        tunnels,
        link: config.link.clone(),
        connect_timeout: Duration::from_secs(client_config.connect_timeout),
    };
    let reconnect_delay = Duration::from_secs(client_config.reconnect_delay);

    info!("otunnel client v{}", otunnel::VERSION);

    loop {
        tokio::select! {
            result = run_link(&state) => match result {
                Ok(()) => info!("Link to {} closed", state.server_addr),
                Err(e) => error!("Link to {} failed: {:#}", state.server_addr, e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }

        info!("Reconnecting in {:?}...", reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

fn wrapping(client: &ClientConfig, link: &LinkSettings) -> Result<Wrapping> {
    if let Some(ca) = &client.tls_ca {
        return tls_wrapping(ca, client.tls_server_name.as_deref());
    }
    match &client.secret {
        Some(secret) => {
            let keys = derive_link_keys(secret.as_bytes(), link.pbkdf2_iterations)
                .context("Failed to derive keys from secret")?;
            Ok(Wrapping::Secret(keys))
        }
        None => {
            warn!("No TLS or secret configured - link is NOT encrypted");
            Ok(Wrapping::Plain)
        }
    }
}

#[cfg(feature = "tls")]
fn tls_wrapping(ca: &str, server_name: Option<&str>) -> Result<Wrapping> {
    let client = transport::TlsClient::from_ca_file(ca, server_name)
        .context("Failed to build TLS client config")?;
    Ok(Wrapping::Tls(client))
}

#[cfg(not(feature = "tls"))]
fn tls_wrapping(_ca: &str, _server_name: Option<&str>) -> Result<Wrapping> {
    Err(anyhow!("built without the `tls` feature"))
}

/// Connect, open every tunnel and wait for the link to go down
async fn run_link(state: &ClientState) -> Result<()> {
    let stream = transport::connect(&state.server_addr, state.connect_timeout)
        .await
        .context("Failed to connect to server")?;

    let handshake_timeout = Duration::from_secs(state.link.write_timeout);
    let mut conn = match &state.wrapping {
        Wrapping::Plain => FramedConn::from_stream(stream),
        Wrapping::Secret(keys) => FramedConn::from_stream(stream).secure_with_keys(keys, Role::Initiator)?,
        #[cfg(feature = "tls")]
        Wrapping::Tls(client) => tokio::time::timeout(handshake_timeout, client.connect(stream))
            .await
            .map_err(|_| anyhow!("TLS handshake timed out"))?
            .context("TLS handshake failed")?,
    };

    let link_id = tokio::time::timeout(handshake_timeout, client_hello(&mut conn))
        .await
        .map_err(|_| anyhow!("hello timed out"))?
        .context("hello failed")?;

    let link = Link::new(state.link.link_config(link_id, false))?;
    link.bind(conn)?;
    info!(link = link_id, "Connected to {}", state.server_addr);

    for cfg in &state.tunnels {
        match link.open_tunnel(cfg.clone()).await {
            Ok(tunnel) => info!(tunnel = tunnel.id(), "Tunnel ready: {}", tunnel.config()),
            Err(e) => error!("Open tunnel {} failed: {}", cfg, e),
        }
    }

    link.wait().await;
    link.close();
    Ok(())
}
