//! Upstream route state
//!
//! A [`Route`] is one upstream endpoint inside a pool. The operator controls
//! `active` (hot reloads deactivate removed routes), the health scheduler
//! controls `healthy`, and the forwarder counts in-flight connections. All
//! three are atomics so selection never takes a lock on the hot path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// One upstream endpoint with its routing state
#[derive(Debug)]
pub struct Route {
    /// Upstream address as `host:port`
    address: String,
    /// Operator-controlled flag
    active: AtomicBool,
    /// Scheduler-controlled flag
    healthy: AtomicBool,
    /// Number of in-flight forwarded connections
    connections: AtomicU32,
}

impl Route {
    /// Create a route that is active, healthy and idle
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            active: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            connections: AtomicU32::new(0),
        }
    }

    /// Upstream address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the operator keeps this route in rotation
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Set the operator flag
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Whether the health scheduler considers this route reachable
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Set the health flag
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Whether selection may pick this route
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.is_active() && self.is_healthy()
    }

    /// Current in-flight connection count
    #[must_use]
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement_connections(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// RAII guard balancing a route's connection counter
///
/// Created after a successful dial; the counter drops exactly once however
/// the splice phase exits.
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    route: Arc<Route>,
}

impl ConnectionGuard {
    pub(crate) fn acquire(route: Arc<Route>) -> Self {
        route.increment_connections();
        Self { route }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.route.decrement_connections();
    }
}
