//! TLS termination for https prefixes

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ServerConfig as RustlsConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsFiles;
use crate::listener::ListenerError;

/// Build an acceptor from the configured PEM certificate chain and key
///
/// Only HTTP/1.1 is offered via ALPN.
pub fn load_acceptor(files: &TlsFiles) -> Result<TlsAcceptor, ListenerError> {
    let certs = load_certs(&files.cert_path)?;
    let key = load_key(&files.key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = RustlsConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ListenerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ListenerError::Tls(format!("Certificate rejected: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    tracing::debug!(cert = %files.cert_path.display(), "Loaded TLS material");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, ListenerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ListenerError::Tls(format!("{}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ListenerError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenerError::Tls(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ListenerError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ListenerError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ListenerError::Tls(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| ListenerError::Tls(format!("{}: no private key found", path.display())))
}
