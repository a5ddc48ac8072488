//! TLS contexts: the server side for LDAPS/StartTLS listeners and the client side for backends.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::SignatureScheme;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs_from_file(cert_file)?;
    let key = load_private_key_from_file(key_file)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from cert and key")?;
    Ok(Arc::new(config))
}

pub fn acceptor_from_files(cert_file: &str, key_file: &str) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(load_server_config_from_files(cert_file, key_file)?))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path).with_context(|| format!("Open key file: {}", path))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

/// Server TLS context that can be swapped for a fresh one read from the
/// same files, without touching connections already accepted.
#[derive(Clone)]
pub struct ReloadableAcceptor {
    current: Arc<ArcSwap<TlsAcceptor>>,
    cert_file: String,
    key_file: String,
}

impl ReloadableAcceptor {
    pub fn from_files(cert_file: &str, key_file: &str) -> Result<Self> {
        let acceptor = acceptor_from_files(cert_file, key_file)?;
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(acceptor)),
            cert_file: cert_file.to_string(),
            key_file: key_file.to_string(),
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::clone(&self.current.load())
    }

    /// Re-reads the certificate and key. On error the current context stays.
    pub fn reload(&self) -> Result<()> {
        let acceptor = acceptor_from_files(&self.cert_file, &self.key_file)?;
        self.current.store(Arc::new(acceptor));
        Ok(())
    }
}

/// Check that cert and key files exist and are readable (for startup validation).
pub fn validate_tls_files(cert_file: &str, key_file: &str, ca_file: Option<&str>) -> Result<()> {
    if !Path::new(cert_file).exists() {
        anyhow::bail!("TLS cert file not found: {}", cert_file);
    }
    if !Path::new(key_file).exists() {
        anyhow::bail!("TLS key file not found: {}", key_file);
    }
    if let Some(ca) = ca_file {
        if !Path::new(ca).exists() {
            anyhow::bail!("TLS CA file not found: {}", ca);
        }
    }
    load_server_config_from_files(cert_file, key_file)?;
    Ok(())
}

/// Verifier that accepts any server certificate. Only for use with tls_skip_verify (internal/test).
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS client config for backends: system roots plus an optional extra CA
/// file, or no verification at all when `skip_verify` is set.
pub fn client_config(skip_verify: bool, ca_file: Option<&str>) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    // An empty system store is fine when a CA file is given
    if let Ok(native) = rustls_native_certs::load_native_certs() {
        for cert in native {
            let _ = root_store.add(cert);
        }
    }
    if let Some(path) = ca_file {
        for cert in load_certs_from_file(path)? {
            root_store
                .add(cert)
                .with_context(|| format!("Add CA certificate from {}", path))?;
        }
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if skip_verify {
        config.dangerous().set_certificate_verifier(Arc::new(InsecureServerVerifier));
    }
    Ok(Arc::new(config))
}

pub fn connector(skip_verify: bool, ca_file: Option<&str>) -> Result<TlsConnector> {
    Ok(TlsConnector::from(client_config(skip_verify, ca_file)?))
}
