//! Load balancer supervisor
//!
//! The [`LoadBalancer`] owns every configured pool, the shared abuse cache
//! and the live forwarder map. `listen()` starts one TLS listener per pool
//! under a derived cancellation scope with all-or-nothing semantics: every
//! TLS configuration is built before any socket is bound, and a single
//! failed bind rolls the whole startup back. `update_pool()` hot-swaps a
//! pool's route set without touching its listener or in-flight connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::blocklist::AbuseCache;
use crate::config::{Options, ServicePool};
use crate::error::{BalancerError, ConfigError, ListenerError, Result};
use crate::forward::Forwarder;
use crate::listener::{tls, PoolListener};

/// Supervisor owning all pools and their listeners
pub struct LoadBalancer {
    id: String,
    /// Root cancellation scope supplied by the embedder
    cancel: CancellationToken,
    pools: Arc<Mutex<HashMap<String, ServicePool>>>,
    forwarders: Arc<Mutex<HashMap<String, Arc<Forwarder>>>>,
    abuse: Arc<AbuseCache>,
}

impl LoadBalancer {
    /// Create a supervisor for the given pools
    ///
    /// Cancelling `cancel` shuts the whole balancer down; [`shutdown`]
    /// does the same from this side.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when no pools are supplied or a pool fails
    /// validation.
    ///
    /// [`shutdown`]: LoadBalancer::shutdown
    pub fn new(
        cancel: CancellationToken,
        pools: Vec<ServicePool>,
        options: Options,
    ) -> Result<Self> {
        if pools.is_empty() {
            return Err(ConfigError::NoPools.into());
        }

        let mut pool_map = HashMap::with_capacity(pools.len());
        for pool in pools {
            pool.validate()?;
            pool_map.insert(pool.identity.clone(), pool);
        }
        let mut ports = std::collections::HashSet::with_capacity(pool_map.len());
        for pool in pool_map.values() {
            if !ports.insert(pool.port) {
                return Err(ConfigError::DuplicatePort { port: pool.port }.into());
            }
        }

        let capacity = options.abuse_cache_capacity;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            cancel,
            pools: Arc::new(Mutex::new(pool_map)),
            forwarders: Arc::new(Mutex::new(HashMap::new())),
            abuse: Arc::new(AbuseCache::new(capacity)),
        })
    }

    /// Supervisor id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start every pool listener and serve until shutdown
    ///
    /// Startup is all-or-nothing: TLS configurations are built for every
    /// pool before any bind, the call waits for each listener to become
    /// healthy, and any bind failure cancels the others. Once up, the call
    /// blocks until all listeners terminate; the first fatal listener error
    /// cancels the derived scope and is returned.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on port collisions or bad PEM material,
    /// `ListenerError::StartGate` when a listener failed to start, or the
    /// first fatal accept error.
    pub async fn listen(&self) -> Result<()> {
        let schedule = self.collect_listen_targets()?;

        let derived = self.cancel.child_token();
        let (ready_tx, mut ready_rx) = mpsc::channel(schedule.len());
        let mut listeners = JoinSet::new();

        for (pool, tls_config) in schedule {
            let listener = PoolListener {
                pool,
                tls_config,
                abuse: Arc::clone(&self.abuse),
                pools: Arc::clone(&self.pools),
                forwarders: Arc::clone(&self.forwarders),
                cancel: derived.clone(),
            };
            let ready = ready_tx.clone();
            listeners.spawn(async move { listener.run(ready).await });
        }
        drop(ready_tx);

        // All-or-nothing start gate
        let expected = listeners.len();
        let mut healthy = 0;
        while healthy < expected {
            match ready_rx.recv().await {
                Some(Ok(port)) => {
                    debug!(id = %self.id, port, "listener healthy");
                    healthy += 1;
                }
                Some(Err(e)) => {
                    error!(id = %self.id, error = %e, "listener failed to start, rolling back");
                    derived.cancel();
                    while listeners.join_next().await.is_some() {}
                    return Err(ListenerError::StartGate(e.to_string()).into());
                }
                None => {
                    derived.cancel();
                    return Err(
                        ListenerError::StartGate("listener exited before start".into()).into(),
                    );
                }
            }
        }
        info!(id = %self.id, listeners = expected, "all listeners healthy");

        // Serve until every listener terminates; one fatal error stops all
        let mut first_error: Option<ListenerError> = None;
        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    derived.cancel();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) if e.is_panic() => {
                    derived.cancel();
                    if first_error.is_none() {
                        first_error =
                            Some(ListenerError::Accept {
                                port: 0,
                                reason: format!("listener task panicked: {e}"),
                            });
                    }
                }
                Err(_) => {}
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Install an updated pool descriptor and hot-swap its live forwarder
    ///
    /// The listen port is part of the pool's identity here; moving a pool
    /// to another port is rejected.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the descriptor is invalid or changes the
    /// listen port.
    pub fn update_pool(&self, pool: ServicePool) -> Result<()> {
        pool.validate()?;

        let mut pools = self.pools.lock();
        if let Some(existing) = pools.get(&pool.identity) {
            if existing.port != pool.port {
                return Err(ConfigError::PortChange {
                    identity: pool.identity.clone(),
                    from: existing.port,
                    to: pool.port,
                }
                .into());
            }
        } else if pools.values().any(|p| p.port == pool.port) {
            return Err(ConfigError::DuplicatePort { port: pool.port }.into());
        }
        pools.insert(pool.identity.clone(), pool.clone());
        drop(pools);

        if let Some(forwarder) = self.forwarders.lock().get(&pool.identity) {
            forwarder.update_service_pool(&pool);
            debug!(id = %self.id, identity = %pool.identity, "pool hot-swapped");
        }
        Ok(())
    }

    /// Stop accepting and cancel every in-flight connection
    pub fn shutdown(&self) {
        info!(id = %self.id, "shutting down");
        self.cancel.cancel();
    }

    /// Map each pool to its port and pre-build all TLS configurations
    ///
    /// Failing here means `listen()` has had no side effects yet.
    fn collect_listen_targets(
        &self,
    ) -> Result<Vec<(ServicePool, Arc<rustls::ServerConfig>)>> {
        let pools = self.pools.lock();

        let mut ports = HashMap::with_capacity(pools.len());
        for pool in pools.values() {
            if let Some(other) = ports.insert(pool.port, pool.identity.clone()) {
                debug!(
                    id = %self.id,
                    port = pool.port,
                    first = %other,
                    second = %pool.identity,
                    "port collision"
                );
                return Err(ConfigError::DuplicatePort { port: pool.port }.into());
            }
        }

        let mut schedule = Vec::with_capacity(pools.len());
        for pool in pools.values() {
            let tls_config = tls::build_server_config(pool)?;
            schedule.push((pool.clone(), tls_config));
        }
        Ok(schedule)
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("id", &self.id)
            .field("pools", &self.pools.lock().len())
            .field("forwarders", &self.forwarders.lock().len())
            .finish_non_exhaustive()
    }
}
