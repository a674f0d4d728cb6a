//! Test harness: generated PKI, upstream servers and an mTLS test client
//!
//! Everything the end-to-end scenarios need to stand up a balancer on
//! loopback: a throwaway CA with server and client certificates, greeting
//! upstreams that count their hits, and a client that speaks the same
//! one-line protocol through the balancer.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use rust_balancer::listener::tls::init_crypto_provider;
use rust_balancer::{Options, RateQuota, ServicePool};

/// Throwaway PKI: one CA, a server certificate for localhost and the means
/// to mint client certificates with arbitrary CNs
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
}

/// Client credential minted by [`TestPki::client_identity`]
pub struct ClientIdentity {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl TestPki {
    /// Generate a CA and a localhost server certificate signed by it
    pub fn generate() -> Self {
        init_crypto_provider();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::OrganizationName, "Balancer Integration CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            ca_cert,
            ca_key,
        }
    }

    /// Mint a client certificate with the given Common Name
    pub fn client_identity(&self, common_name: &str) -> ClientIdentity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        ClientIdentity {
            cert: cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        }
    }

    /// Pool descriptor wired to this PKI
    pub fn pool(&self, identity: &str, port: u16) -> ServicePool {
        ServicePool::new(identity, port).with_pki(
            self.server_cert_pem.clone(),
            self.server_key_pem.clone(),
            self.ca_pem.clone(),
        )
    }
}

/// A TCP upstream answering the one-line test protocol
pub struct TestUpstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    /// Spawn an upstream on an ephemeral port
    ///
    /// Replies carry a little latency so concurrent requests overlap, which
    /// is what spreads least-connections selection.
    pub async fn spawn(reply: &'static str) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        Self::from_listener(listener, reply, Duration::from_millis(30))
    }

    /// Spawn an upstream that answers immediately
    pub async fn spawn_fast(reply: &'static str) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        Self::from_listener(listener, reply, Duration::ZERO)
    }

    /// Spawn an upstream on a specific port (used to "restart" a server)
    pub async fn spawn_on(port: u16, reply: &'static str) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        Self::from_listener(listener, reply, Duration::from_millis(30))
    }

    fn from_listener(listener: TcpListener, reply: &'static str, latency: Duration) -> Self {
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let _ = stream.read(&mut buf).await;
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { addr, hits, handle }
    }

    /// Number of connections this upstream accepted
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Stop accepting and free the port
    pub fn stop(self) -> u16 {
        let port = self.addr.port();
        self.handle.abort();
        port
    }
}

/// Build a rustls client configuration trusting the test CA
pub fn client_config(pki: &TestPki, identity: Option<&ClientIdentity>) -> Arc<ClientConfig> {
    init_crypto_provider();

    let mut roots = RootCertStore::empty();
    let mut reader = std::io::BufReader::new(pki.ca_pem.as_bytes());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match identity {
        Some(id) => builder
            .with_client_auth_cert(vec![id.cert.clone()], id.key.clone_key())
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

/// Send one request through the balancer and return the upstream's reply
///
/// Fails when the handshake is refused or the balancer closes the stream
/// without forwarding anything.
pub async fn send_request(port: u16, config: &Arc<ClientConfig>) -> Result<String> {
    let tcp = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .await
        .context("tcp connect")?;
    let server_name = ServerName::try_from("localhost").unwrap();
    let connector = TlsConnector::from(Arc::clone(config));
    let mut stream = connector
        .connect(server_name, tcp)
        .await
        .context("tls handshake")?;

    stream.write_all(b"ping\n").await.context("send request")?;
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response).await;
    if response.is_empty() {
        bail!("connection closed without a response");
    }
    Ok(response)
}

/// Retry requests until the balancer serves one, or give up after 10s
pub async fn wait_until_serving(port: u16, config: &Arc<ClientConfig>) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if send_request(port, config).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("balancer did not start serving on port {port}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait until the port accepts TCP connections, without speaking TLS
///
/// Useful when a test must not generate upstream traffic before its own
/// requests; note the dropped probe counts as one failed handshake.
pub async fn wait_listening(port: u16) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("port {port} never started listening");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Reserve an ephemeral port and release it for the caller to bind
pub async fn free_port() -> u16 {
    let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

/// Default options for tests
pub fn test_options() -> Options {
    Options::default()
}

/// A generous quota so admission tests control their own limits
pub fn unlimited_quota() -> RateQuota {
    RateQuota::per_second(10_000)
}
