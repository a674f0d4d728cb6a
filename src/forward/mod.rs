//! Per-pool forwarding
//!
//! The [`Forwarder`] owns a pool's route set, picks the next upstream with a
//! least-connections strategy and splices accepted client streams onto the
//! chosen route. The route vector sits behind an [`ArcSwap`] so selection is
//! lock-free on the hot path; hot reloads build a new vector under a short
//! writer lock and publish it atomically, which keeps in-flight connections
//! untouched while the strategy immediately sees the new set.

mod route;

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

pub use route::Route;
use route::ConnectionGuard;

use crate::config::ServicePool;
use crate::error::ForwardError;
use crate::health::{HealthCheckScheduler, HealthSchedulerOptions};

/// Timeout handed to the health scheduler for recovery probes
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns a pool's routes and proxies accepted streams to them
#[derive(Debug)]
pub struct Forwarder {
    /// Published route set; readers load one snapshot per selection
    routes: ArcSwap<Vec<Arc<Route>>>,
    /// Serializes route-set rebuilds
    update_lock: Mutex<()>,
    /// Timeout for dialing an upstream
    dial_timeout: Duration,
    /// Recovery prober for quarantined routes
    health: Arc<HealthCheckScheduler>,
}

impl Forwarder {
    /// Build a forwarder from a pool descriptor
    ///
    /// Only routes flagged active make the initial set; every route starts
    /// healthy with a zero connection count.
    #[must_use]
    pub fn new(pool: &ServicePool) -> Self {
        let routes: Vec<Arc<Route>> = pool
            .routes
            .iter()
            .filter(|r| r.active)
            .map(|r| Arc::new(Route::new(&r.address)))
            .collect();

        let health = HealthCheckScheduler::new(HealthSchedulerOptions {
            max_items: 0,
            release_checks: pool.health_check_validations,
            check_interval_ms: pool.health_check_reschedule_ms,
        });

        Self {
            routes: ArcSwap::from_pointee(routes),
            update_lock: Mutex::new(()),
            dial_timeout: pool.effective_route_timeout(),
            health,
        }
    }

    /// Hot-swap the route set from an updated pool descriptor
    ///
    /// Routes whose address survives keep their connection counter and
    /// health flag; their active flag is taken from the new descriptor.
    /// New addresses join healthy and idle. Routes the descriptor no longer
    /// covers are deactivated and dropped from the published vector; they
    /// are freed once the last in-flight connection or probe worker lets go
    /// of them.
    pub fn update_service_pool(&self, pool: &ServicePool) {
        let _guard = self.update_lock.lock();
        let current = self.routes.load_full();

        let lookup: HashMap<&str, &Arc<Route>> =
            current.iter().map(|r| (r.address(), r)).collect();

        let mut next = Vec::with_capacity(pool.routes.len());
        for cfg in &pool.routes {
            if let Some(existing) = lookup.get(cfg.address.as_str()) {
                existing.set_active(cfg.active);
                next.push(Arc::clone(existing));
            } else {
                let route = Arc::new(Route::new(&cfg.address));
                route.set_active(cfg.active);
                next.push(route);
            }
        }

        let covered: HashSet<&str> = pool.routes.iter().map(|r| r.address.as_str()).collect();
        for orphan in current.iter().filter(|r| !covered.contains(r.address())) {
            orphan.set_active(false);
            debug!(address = orphan.address(), "route removed from rotation");
        }

        self.routes.store(Arc::new(next));
    }

    /// Proxy one accepted client stream to an upstream
    ///
    /// Selection and dialing loop until a dial succeeds or no selectable
    /// route remains; each dial failure quarantines the route and retries.
    /// The splice runs both copy directions to completion unless `cancel`
    /// fires first, in which case the cancellation is surfaced distinctly.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::NoActiveRoutes`] when the pool has nothing to
    /// dial, [`ForwardError::Cancelled`] on shutdown, or a composite
    /// [`ForwardError::Transport`] when a copy direction failed with
    /// something other than normal stream termination.
    pub async fn attach<S>(&self, cancel: CancellationToken, client: S) -> Result<(), ForwardError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (route, upstream) = loop {
            let Some(route) = self.next_route() else {
                return Err(ForwardError::NoActiveRoutes);
            };

            match timeout(self.dial_timeout, TcpStream::connect(route.address())).await {
                Ok(Ok(stream)) => break (route, stream),
                Ok(Err(e)) => {
                    error!(address = route.address(), error = %e, "route unreachable");
                    self.health
                        .add_unhealthy(route, HEALTH_PROBE_TIMEOUT, cancel.clone());
                }
                Err(_) => {
                    error!(
                        address = route.address(),
                        timeout_ms = self.dial_timeout.as_millis() as u64,
                        "route dial timed out"
                    );
                    self.health
                        .add_unhealthy(route, HEALTH_PROBE_TIMEOUT, cancel.clone());
                }
            }
        };

        let _guard = ConnectionGuard::acquire(Arc::clone(&route));
        let _ = upstream.set_nodelay(true);
        trace!(
            address = route.address(),
            connections = route.connections(),
            "attached"
        );

        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = upstream.into_split();

        let (results_tx, mut results_rx) = mpsc::channel::<io::Result<u64>>(2);
        let inbound = tokio::spawn(copy_direction(client_read, upstream_write, results_tx.clone()));
        let outbound = tokio::spawn(copy_direction(upstream_read, client_write, results_tx));

        let mut errors = Vec::new();
        for _ in 0..2 {
            tokio::select! {
                () = cancel.cancelled() => {
                    // Dropping the halves closes both sockets
                    inbound.abort();
                    outbound.abort();
                    return Err(ForwardError::Cancelled);
                }
                result = results_rx.recv() => {
                    if let Some(Err(e)) = result {
                        if !is_normal_termination(&e) {
                            errors.push(e.to_string());
                        }
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForwardError::Transport { errors })
        }
    }

    /// Least-connections selection over one route-set snapshot
    ///
    /// Filters to `active && healthy` routes and picks the smallest
    /// connection counter, first-seen on ties. The snapshot may trail a
    /// concurrent swap by one publication; the next call sees the new set.
    #[must_use]
    pub fn next_route(&self) -> Option<Arc<Route>> {
        let snapshot = self.routes.load();
        let mut best: Option<&Arc<Route>> = None;
        let mut min = u32::MAX;
        for route in snapshot.iter() {
            if route.is_selectable() {
                let connections = route.connections();
                if connections < min {
                    min = connections;
                    best = Some(route);
                }
            }
        }
        best.cloned()
    }

    /// Snapshot of the currently published route set
    ///
    /// Diagnostic view; the set may be swapped out at any moment.
    #[must_use]
    pub fn routes(&self) -> Arc<Vec<Arc<Route>>> {
        self.routes.load_full()
    }
}

/// Copy one direction to completion, then propagate the half-close
///
/// The terminal result, error or byte count, lands in the two-slot results
/// channel the splice phase drains.
async fn copy_direction<R, W>(mut reader: R, mut writer: W, results: mpsc::Sender<io::Result<u64>>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => {
            let _ = writer.shutdown().await;
            Ok(n)
        }
        Err(e) => Err(e),
    };
    let _ = results.send(result).await;
}

/// Classify copy errors that simply mean the peer went away
fn is_normal_termination(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
