//! otunnel server
//!
//! Accepts link connections from clients and serves their tunnel requests:
//! - Plain TCP, TLS, or framing enciphered with a shared secret
//! - JSON hello assigning each link an ID
//! - One server-side link per connection

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use otunnel::config::{generate_example_config, Config, LinkSettings};
use otunnel::crypto::{derive_link_keys, LinkKeys, Role};
use otunnel::transport::{server_hello, FramedConn};
use otunnel::{logging, Link};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// otunnel server - serves port-forwarding tunnels over secure links
#[derive(Parser, Debug)]
#[command(name = "otunnel-server")]
#[command(about = "otunnel server - serves port-forwarding tunnels over secure links")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Shared secret for enciphered framing
    #[arg(short, long)]
    secret: Option<String>,

    /// TLS certificate chain (PEM)
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    tls_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,
}

/// How accepted connections are wrapped before the hello
enum Wrapping {
    Plain,
    Secret(LinkKeys),
    #[cfg(feature = "tls")]
    Tls(otunnel::transport::TlsServer),
}

/// Server state shared across connections
struct ServerState {
    wrapping: Wrapping,
    link: LinkSettings,
    next_link_id: AtomicU32,
    /// Connection semaphore for limiting concurrent links
    conn_semaphore: Semaphore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", toml::to_string_pretty(&generate_example_config())?);
        return Ok(());
    }

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

    let mut server_config = config.server.clone().unwrap_or_default();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if args.secret.is_some() {
        server_config.secret = args.secret;
    }
    if args.tls_cert.is_some() {
        server_config.tls_cert = args.tls_cert;
    }
    if args.tls_key.is_some() {
        server_config.tls_key = args.tls_key;
    }

    let wrapping = match (&server_config.tls_cert, &server_config.tls_key, &server_config.secret) {
        (Some(cert), Some(key), _) => tls_wrapping(cert, key)?,
        (None, None, Some(secret)) => {
            let keys = derive_link_keys(secret.as_bytes(), config.link.pbkdf2_iterations)
                .context("Failed to derive keys from secret")?;
            info!("Enciphered framing enabled");
            Wrapping::Secret(keys)
        }
        (None, None, None) => {
            warn!("No TLS or secret configured - links are NOT encrypted");
            Wrapping::Plain
        }
        _ => return Err(anyhow!("tls_cert and tls_key must be given together")),
    };

    let state = Arc::new(ServerState {
        wrapping,
        link: config.link.clone(),
        next_link_id: AtomicU32::new(1),
        conn_semaphore: Semaphore::new(server_config.max_connections.max(1)),
    });

    let listen_addr = server_config.listen_addr();
    info!("otunnel server v{}", otunnel::VERSION);
    info!("Listening on {}", listen_addr);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);

                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                                warn!("Connection from {} failed: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(feature = "tls")]
fn tls_wrapping(cert: &str, key: &str) -> Result<Wrapping> {
    let server = otunnel::transport::TlsServer::from_pem_files(cert, key)
        .context("Failed to build TLS server config")?;
    info!("TLS enabled with cert: {}", cert);
    Ok(Wrapping::Tls(server))
}

#[cfg(not(feature = "tls"))]
fn tls_wrapping(_cert: &str, _key: &str) -> Result<Wrapping> {
    Err(anyhow!("built without the `tls` feature"))
}

/// Serve one client connection until its link goes down
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let _permit = state
        .conn_semaphore
        .acquire()
        .await
        .context("Failed to acquire connection permit")?;

    stream.set_nodelay(true)?;

    let handshake_timeout = Duration::from_secs(state.link.write_timeout);
    let mut conn = match &state.wrapping {
        Wrapping::Plain => FramedConn::from_stream(stream),
        Wrapping::Secret(keys) => FramedConn::from_stream(stream).secure_with_keys(keys, Role::Responder)?,
        #[cfg(feature = "tls")]
        Wrapping::Tls(server) => tokio::time::timeout(handshake_timeout, server.accept(stream))
            .await
            .map_err(|_| anyhow!("TLS accept timed out"))?
            .context("TLS accept failed")?,
    };

    let link_id = state.next_link_id.fetch_add(1, Ordering::Relaxed);
    tokio::time::timeout(handshake_timeout, server_hello(&mut conn, link_id))
        .await
        .map_err(|_| anyhow!("hello timed out"))?
        .context("hello failed")?;

    let link = Link::new(state.link.link_config(link_id, true))?;
    link.bind(conn)?;
    info!(link = link_id, "Client {} connected", peer_addr);

    link.wait().await;
    link.close();
    info!(link = link_id, "Client {} disconnected", peer_addr);
    Ok(())
}
