//! Per-pool TLS listener and admission loop
//!
//! One listener task runs per configured pool. It terminates mTLS on the
//! pool's port and walks every accepted connection through the admission
//! pipeline: abuse-cache gate, explicit TLS handshake, rate limiting, leaf
//! certificate and CN verification. Admitted streams are handed to the
//! pool's shared forwarder in their own task so a slow upstream never
//! blocks the accept loop.

pub mod tls;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::blocklist::AbuseCache;
use crate::config::ServicePool;
use crate::error::{ForwardError, ListenerError};
use crate::forward::Forwarder;
use crate::ratelimit::TokenBucket;

/// Abuse window base applied to a peer that failed the TLS handshake
const HANDSHAKE_ABUSE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// State one pool listener runs with
pub(crate) struct PoolListener {
    /// Descriptor captured at listener start
    pub(crate) pool: ServicePool,
    /// Pre-built TLS configuration for this pool
    pub(crate) tls_config: Arc<ServerConfig>,
    /// Supervisor-wide peer abuse cache
    pub(crate) abuse: Arc<AbuseCache>,
    /// Latest pool descriptors, shared with the supervisor
    pub(crate) pools: Arc<Mutex<HashMap<String, ServicePool>>>,
    /// Live forwarders, shared with the supervisor
    pub(crate) forwarders: Arc<Mutex<HashMap<String, Arc<Forwarder>>>>,
    /// Listener scope; cancelling it closes the listener
    pub(crate) cancel: CancellationToken,
}

impl PoolListener {
    /// Bind, report to the start gate, then accept until cancelled
    ///
    /// The startup result goes through `ready` so the supervisor can roll
    /// every listener back when one of them fails to bind.
    pub(crate) async fn run(
        self,
        ready: mpsc::Sender<Result<u16, ListenerError>>,
    ) -> Result<(), ListenerError> {
        let port = self.pool.port;
        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = ListenerError::bind(port, e.to_string());
                let _ = ready.send(Err(ListenerError::bind(port, e.to_string()))).await;
                return Err(err);
            }
        };
        let _ = ready.send(Ok(port)).await;
        info!(port, identity = %self.pool.identity, "listening");

        let acceptor = TlsAcceptor::from(Arc::clone(&self.tls_config));
        // One bucket per listener task; no sharing, no lock
        let mut rate_limiter = TokenBucket::from_quota(self.pool.effective_rate_quota());

        loop {
            let (tcp, peer) = tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(port, "listener closed");
                    self.forwarders.lock().remove(&self.pool.identity);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(port, error = %e, "failed to accept connection");
                        self.forwarders.lock().remove(&self.pool.identity);
                        return Err(ListenerError::accept(port, e.to_string()));
                    }
                }
            };

            // Known offenders are dropped before any handshake CPU is spent
            let peer_ip = peer.ip().to_string();
            if let Some(entry) = self.abuse.get(&peer_ip) {
                if entry.count > self.pool.unauthorized_attempts {
                    if !entry.is_expired() {
                        trace!(peer = %peer, identity = %self.pool.identity, "blocked peer dropped");
                        drop(tcp);
                        continue;
                    }
                    self.abuse.invalidate(&peer_ip);
                }
            }

            debug!(port, peer = %peer, "accepting request");

            // Handshake explicitly so admission sees peer certificates
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(peer = %peer, error = %e, "cannot complete handshake");
                    self.abuse.increment(&peer_ip, HANDSHAKE_ABUSE_WINDOW);
                    continue;
                }
            };

            // An authenticated client bursting past its quota is not abuse
            if !rate_limiter.within_rate_limit() {
                trace!(identity = %self.pool.identity, "rate quota exceeded for pool");
                continue;
            }

            let common_name = {
                let (_, connection) = tls_stream.get_ref();
                match connection.peer_certificates() {
                    Some(certs) if !certs.is_empty() => tls::peer_common_name(certs),
                    _ => {
                        error!(peer = %peer, "failed to extract certificate");
                        continue;
                    }
                }
            };
            let Some(identity) = common_name else {
                error!(peer = %peer, "peer certificate carries no common name");
                continue;
            };

            if identity != self.pool.identity {
                warn!(peer = %peer, identity = %identity, "certificate failed identity matching");
                continue;
            }

            let forwarder = self.forwarder();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                match forwarder.attach(cancel, tls_stream).await {
                    Ok(()) | Err(ForwardError::Cancelled) => {
                        debug!("conn closed");
                    }
                    Err(e) => {
                        error!(error = %e, "cannot attach to backend");
                    }
                }
            });
        }
    }

    /// Fetch the pool's shared forwarder, creating it on first use
    ///
    /// The lazily-created forwarder reads the latest installed descriptor so
    /// an `update_pool` that arrived before the first connection is honored.
    fn forwarder(&self) -> Arc<Forwarder> {
        let mut forwarders = self.forwarders.lock();
        if let Some(existing) = forwarders.get(&self.pool.identity) {
            return Arc::clone(existing);
        }
        let descriptor = self
            .pools
            .lock()
            .get(&self.pool.identity)
            .cloned()
            .unwrap_or_else(|| self.pool.clone());
        let forwarder = Arc::new(Forwarder::new(&descriptor));
        forwarders.insert(self.pool.identity.clone(), Arc::clone(&forwarder));
        forwarder
    }
}
