//! TLS wrapping for link connections
//!
//! The server presents a PEM certificate chain; the client verifies it
//! against a PEM CA file and the configured server name.

use super::{FramedConn, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// Server name used when none is configured
pub const DEFAULT_SERVER_NAME: &str = "otunnelDefaultServer";

/// Load a certificate chain from a PEM file
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let path = path.as_ref();
    let mut file = BufReader::new(File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load a private key from a PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, TransportError> {
    let path = path.as_ref();
    let mut file = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut file)?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

/// Accepts TLS connections from link clients
#[derive(Clone)]
pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl TlsServer {
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub async fn accept(&self, stream: TcpStream) -> Result<FramedConn, TransportError> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!("TLS handshake complete with client");
        Ok(FramedConn::from_stream(tls))
    }
}

/// Opens TLS connections to a link server
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    /// Trust the certificates in `ca_path`, expecting `server_name` on the peer
    pub fn from_ca_file(
        ca_path: impl AsRef<Path>,
        server_name: Option<&str>,
    ) -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = server_name.unwrap_or(DEFAULT_SERVER_NAME).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| TransportError::Tls(format!("invalid server name '{}': {}", name, e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub async fn connect(&self, stream: TcpStream) -> Result<FramedConn, TransportError> {
        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!("TLS handshake complete");
        Ok(FramedConn::from_stream(tls))
    }
}
