//! Configuration types for rust-balancer
//!
//! This module defines the pool descriptors supplied by the embedder.
//! A [`ServicePool`] describes one tenant: the client identity it serves,
//! the port it terminates mTLS on, its upstream routes and the knobs for
//! rate limiting and health checking. Descriptors are validated at
//! supervisor construction and again on every hot reload.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default request rate applied when a pool's quota count is zero
pub const DEFAULT_RATE_PER_SECOND: u32 = 1000;

/// Default timeout for dialing an upstream route
pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of consecutive successful probes before a route is reinstated
pub const DEFAULT_HEALTH_CHECK_VALIDATIONS: u32 = 1;

/// Default interval between health probes for one route, in milliseconds
pub const DEFAULT_HEALTH_CHECK_RESCHEDULE_MS: u64 = 5000;

/// Default number of offenses before a peer address is blocked
pub const DEFAULT_UNAUTHORIZED_ATTEMPTS: u32 = 10;

/// Default capacity of the supervisor-wide abuse cache
pub const DEFAULT_ABUSE_CACHE_CAPACITY: usize = 1000;

/// Admission rate quota: `times` tokens per `per` window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateQuota {
    /// Number of admitted connections per window
    pub times: u32,

    /// Window length in milliseconds
    #[serde(rename = "per_ms", with = "duration_ms")]
    pub per: Duration,
}

impl RateQuota {
    /// Create a new rate quota
    #[must_use]
    pub const fn new(times: u32, per: Duration) -> Self {
        Self { times, per }
    }

    /// Quota of `times` connections per second
    #[must_use]
    pub const fn per_second(times: u32) -> Self {
        Self::new(times, Duration::from_secs(1))
    }
}

impl Default for RateQuota {
    fn default() -> Self {
        Self::per_second(DEFAULT_RATE_PER_SECOND)
    }
}

/// One upstream endpoint inside a pool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoolRoute {
    /// Upstream address as `host:port`
    pub address: String,

    /// Operator-controlled flag; inactive routes are never selected
    #[serde(default = "default_true")]
    pub active: bool,
}

impl PoolRoute {
    /// Create an active route for the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            active: true,
        }
    }

    /// Set the active flag
    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Descriptor for one service pool
///
/// The identity doubles as the admission gate: a client is only forwarded
/// when the Common Name of its leaf certificate equals `identity`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServicePool {
    /// Pool identity, matched against the client certificate CN
    pub identity: String,

    /// Port to listen on for incoming mTLS traffic
    pub port: u16,

    /// Admission rate quota for this pool
    #[serde(default)]
    pub rate_quota: RateQuota,

    /// Upstream routes traffic is forwarded to
    pub routes: Vec<PoolRoute>,

    /// Server certificate, PEM encoded
    pub certificate_pem: String,

    /// Server private key, PEM encoded
    pub private_key_pem: String,

    /// CA certificate used to verify client certificates, PEM encoded
    pub ca_certificate_pem: String,

    /// Timeout for dialing an upstream route
    #[serde(default = "default_route_timeout", with = "duration_ms")]
    pub route_timeout: Duration,

    /// Consecutive successful probes required to reinstate a route
    #[serde(default = "default_health_check_validations")]
    pub health_check_validations: u32,

    /// Interval between health probes in milliseconds
    #[serde(default = "default_health_check_reschedule_ms")]
    pub health_check_reschedule_ms: u64,

    /// Offenses from one peer address before admission drops it pre-handshake
    #[serde(default = "default_unauthorized_attempts")]
    pub unauthorized_attempts: u32,
}

impl ServicePool {
    /// Create a pool descriptor with defaults for the tuning knobs
    pub fn new(identity: impl Into<String>, port: u16) -> Self {
        Self {
            identity: identity.into(),
            port,
            rate_quota: RateQuota::default(),
            routes: Vec::new(),
            certificate_pem: String::new(),
            private_key_pem: String::new(),
            ca_certificate_pem: String::new(),
            route_timeout: DEFAULT_ROUTE_TIMEOUT,
            health_check_validations: DEFAULT_HEALTH_CHECK_VALIDATIONS,
            health_check_reschedule_ms: DEFAULT_HEALTH_CHECK_RESCHEDULE_MS,
            unauthorized_attempts: DEFAULT_UNAUTHORIZED_ATTEMPTS,
        }
    }

    /// Set the rate quota
    #[must_use]
    pub const fn with_rate_quota(mut self, quota: RateQuota) -> Self {
        self.rate_quota = quota;
        self
    }

    /// Add an active route
    #[must_use]
    pub fn with_route(mut self, address: impl Into<String>) -> Self {
        self.routes.push(PoolRoute::new(address));
        self
    }

    /// Replace the full route list
    #[must_use]
    pub fn with_routes(mut self, routes: Vec<PoolRoute>) -> Self {
        self.routes = routes;
        self
    }

    /// Set the PEM material for this pool
    #[must_use]
    pub fn with_pki(
        mut self,
        certificate_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
        ca_certificate_pem: impl Into<String>,
    ) -> Self {
        self.certificate_pem = certificate_pem.into();
        self.private_key_pem = private_key_pem.into();
        self.ca_certificate_pem = ca_certificate_pem.into();
        self
    }

    /// Set the upstream dial timeout
    #[must_use]
    pub const fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }

    /// Set health-check reinstatement threshold and probe interval
    #[must_use]
    pub const fn with_health_check(mut self, validations: u32, reschedule_ms: u64) -> Self {
        self.health_check_validations = validations;
        self.health_check_reschedule_ms = reschedule_ms;
        self
    }

    /// Effective rate quota, substituting the default rate for a zero count
    #[must_use]
    pub fn effective_rate_quota(&self) -> RateQuota {
        if self.rate_quota.times == 0 {
            RateQuota::new(DEFAULT_RATE_PER_SECOND, self.rate_quota.per)
        } else {
            self.rate_quota
        }
    }

    /// Effective upstream dial timeout, substituting the default for zero
    #[must_use]
    pub fn effective_route_timeout(&self) -> Duration {
        if self.route_timeout.is_zero() {
            DEFAULT_ROUTE_TIMEOUT
        } else {
            self.route_timeout
        }
    }

    /// Validate the descriptor
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the identity is empty or a tuning knob is
    /// out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.port == 0 {
            return Err(ConfigError::invalid_parameter(format!(
                "pool '{}' has no listen port",
                self.identity
            )));
        }
        for route in &self.routes {
            if route.address.is_empty() {
                return Err(ConfigError::invalid_parameter(format!(
                    "pool '{}' has a route with an empty address",
                    self.identity
                )));
            }
        }
        Ok(())
    }
}

/// Supervisor options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Options {
    /// Capacity of the shared peer-address abuse cache
    #[serde(default = "default_abuse_cache_capacity")]
    pub abuse_cache_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            abuse_cache_capacity: DEFAULT_ABUSE_CACHE_CAPACITY,
        }
    }
}

impl Options {
    /// Set the abuse cache capacity
    #[must_use]
    pub fn with_abuse_cache_capacity(mut self, capacity: usize) -> Self {
        self.abuse_cache_capacity = capacity;
        self
    }
}

const fn default_true() -> bool {
    true
}

const fn default_route_timeout() -> Duration {
    DEFAULT_ROUTE_TIMEOUT
}

const fn default_health_check_validations() -> u32 {
    DEFAULT_HEALTH_CHECK_VALIDATIONS
}

const fn default_health_check_reschedule_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_RESCHEDULE_MS
}

const fn default_unauthorized_attempts() -> u32 {
    DEFAULT_UNAUTHORIZED_ATTEMPTS
}

const fn default_abuse_cache_capacity() -> usize {
    DEFAULT_ABUSE_CACHE_CAPACITY
}

mod duration_ms {
    //! (De)serialize `Duration` as a millisecond count

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
