//! Server-side TLS configuration for pool listeners
//!
//! Builds a rustls `ServerConfig` from a pool's in-memory PEM material:
//! TLS 1.3 only, client certificates required and verified against the
//! pool's CA, NIST-curve key exchange. Also extracts the Subject CN from
//! the verified leaf certificate, which admission matches against the pool
//! identity.

use std::io::BufReader;
use std::sync::{Arc, Once};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use x509_parser::prelude::*;

use crate::config::ServicePool;
use crate::error::ConfigError;

static CRYPTO_INIT: Once = Once::new();

/// Install the process-wide crypto provider exactly once
pub fn init_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build the mTLS server configuration for one pool
///
/// # Errors
///
/// Returns `ConfigError` when the certificate, key or CA PEM cannot be
/// parsed, so that `listen()` fails before any socket is bound.
pub fn build_server_config(pool: &ServicePool) -> Result<Arc<ServerConfig>, ConfigError> {
    init_crypto_provider();

    let certs = read_certificates(&pool.certificate_pem)
        .map_err(|e| ConfigError::invalid_pki(e.to_string()))?;
    if certs.is_empty() {
        return Err(ConfigError::invalid_pki("no certificates found"));
    }
    let key = read_private_key(&pool.private_key_pem)?;

    let ca_certs = read_certificates(&pool.ca_certificate_pem)
        .map_err(|e| ConfigError::invalid_ca(e.to_string()))?;
    if ca_certs.is_empty() {
        return Err(ConfigError::invalid_ca("no CA certificates found"));
    }
    let mut roots = RootCertStore::empty();
    for ca in ca_certs {
        roots
            .add(ca)
            .map_err(|e| ConfigError::invalid_ca(e.to_string()))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ConfigError::invalid_ca(e.to_string()))?;

    // NIST curve preference; rustls' ring provider stops at P-384
    let mut provider = rustls::crypto::ring::default_provider();
    provider.kx_groups = vec![
        rustls::crypto::ring::kx_group::SECP384R1,
        rustls::crypto::ring::kx_group::SECP256R1,
    ];

    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ConfigError::invalid_pki(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::invalid_pki(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Read all certificates from a PEM string
fn read_certificates(pem: &str) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader).collect()
}

/// Read a private key from a PEM string, trying PKCS#8, then RSA, then EC
fn read_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = BufReader::new(pem.as_bytes());
    for key in rustls_pemfile::pkcs8_private_keys(&mut reader).flatten() {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = BufReader::new(pem.as_bytes());
    for key in rustls_pemfile::rsa_private_keys(&mut reader).flatten() {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    let mut reader = BufReader::new(pem.as_bytes());
    for key in rustls_pemfile::ec_private_keys(&mut reader).flatten() {
        return Ok(PrivateKeyDer::Sec1(key));
    }

    Err(ConfigError::invalid_pki("no valid private key found"))
}

/// Subject Common Name of the leaf certificate, if one is present
#[must_use]
pub fn peer_common_name(certs: &[CertificateDer<'_>]) -> Option<String> {
    let leaf = certs.first()?;
    let (_, cert) = parse_x509_certificate(leaf.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);
    name
}
