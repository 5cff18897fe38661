//! Byte streams for control and data connections.
//!
//! Both ends start in plaintext and may switch to TLS mid-session
//! (`AUTH TLS`), so connections are carried as boxed trait objects.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::FtpError;

/// Any bidirectional async byte stream.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, FtpError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(FtpError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, FtpError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| FtpError::Tls(format!("no private key found in {}", path.display())))
}

/// Builds the server-side acceptor from PEM certificate chain and key files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, FtpError> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FtpError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the client-side connector.
///
/// Trusts the certificates in `ca_file` when given, the bundled web PKI
/// roots otherwise.
pub fn build_connector(ca_file: Option<&Path>) -> Result<TlsConnector, FtpError> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in read_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| FtpError::Tls(e.to_string()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, FtpError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| FtpError::Tls(format!("invalid server name: {host}")))
}

/// Client-side TLS handshake over an existing stream.
pub async fn connect_tls(
    connector: &TlsConnector,
    name: ServerName<'static>,
    io: BoxedIo,
) -> Result<BoxedIo, FtpError> {
    let tls = connector
        .connect(name, io)
        .await
        .map_err(|e| FtpError::Tls(format!("handshake failed: {e}")))?;
    Ok(Box::new(tls))
}

/// Server-side TLS handshake over an existing stream.
pub async fn accept_tls(acceptor: &TlsAcceptor, io: BoxedIo) -> Result<BoxedIo, FtpError> {
    let tls = acceptor
        .accept(io)
        .await
        .map_err(|e| FtpError::Tls(format!("handshake failed: {e}")))?;
    Ok(Box::new(tls))
}
