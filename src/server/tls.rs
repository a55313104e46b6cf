use crate::config::TlsEntry;
use anyhow::{Context, Result};
use rustls::crypto::ring;
use rustls::server::ResolvesServerCertUsingSni;
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build the downstream TLS acceptor: one certificate per configured SNI
/// hostname. No TLS entries means the listener stays plain HTTP.
pub fn build_acceptor(entries: &[TlsEntry]) -> Result<Option<TlsAcceptor>> {
    if entries.is_empty() {
        return Ok(None);
    }

    let mut resolver = ResolvesServerCertUsingSni::new();
    for entry in entries {
        let certs = load_certs(&entry.cert)?;
        let key = load_key(&entry.key)?;
        let signing_key = ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("unsupported key type for {}: {e}", entry.host))?;
        resolver
            .add(&entry.host, CertifiedKey::new(certs, signing_key))
            .with_context(|| format!("invalid TLS material for host {}", entry.host))?;
    }

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("no TLS protocol versions available")?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("could not read certificate {path}"))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid certificate {path}"))?;
    if certs.is_empty() {
        anyhow::bail!("{path} contains no certificates");
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("could not read key {path}"))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("invalid key {path}"))?
        .with_context(|| format!("{path} contains no private key"))
}
