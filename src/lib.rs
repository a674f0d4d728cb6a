//! rust-balancer: multi-tenant mutually-authenticated TCP load balancer
//!
//! For each configured service pool this crate terminates mTLS on a
//! dedicated port, authenticates the client by certificate Common Name,
//! applies a per-pool rate quota and a per-peer abuse threshold, then
//! splices the byte stream to one of the pool's upstreams chosen by a
//! least-connections policy. Upstreams that fail to dial are quarantined
//! and probed until they recover.
//!
//! # Architecture
//!
//! ```text
//! Client → mTLS listener → admission (abuse cache, handshake, CN, rate)
//!                              ↓
//!                         Forwarder (least connections)
//!                              ↓
//!                    Upstream dial → bidirectional copy
//!                              ↓
//!              dial failure → health scheduler → probe → reinstate
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use rust_balancer::{LoadBalancer, Options, RateQuota, ServicePool};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(
//! #     server_cert_pem: String,
//! #     server_key_pem: String,
//! #     ca_cert_pem: String,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ServicePool::new("tenant-a", 9092)
//!     .with_route("localhost:9081")
//!     .with_route("localhost:9082")
//!     .with_rate_quota(RateQuota::per_second(100))
//!     .with_pki(server_cert_pem, server_key_pem, ca_cert_pem);
//!
//! let shutdown = CancellationToken::new();
//! let balancer = LoadBalancer::new(shutdown.clone(), vec![pool], Options::default())?;
//!
//! // Blocks until every listener terminates; cancel `shutdown` to stop.
//! balancer.listen().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`balancer`]: supervisor owning all pools and listeners
//! - [`blocklist`]: bounded LRU of misbehaving peer addresses
//! - [`config`]: pool descriptors and supervisor options
//! - [`error`]: error types
//! - [`forward`]: route set, least-connections selection, byte splicing
//! - [`health`]: probe queue and health-check scheduler
//! - [`listener`]: per-pool TLS listener and admission pipeline
//! - [`ratelimit`]: token-bucket admission throttle

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod balancer;
pub mod blocklist;
pub mod config;
pub mod error;
pub mod forward;
pub mod health;
pub mod listener;
pub mod ratelimit;

// Re-export commonly used types at the crate root
pub use balancer::LoadBalancer;
pub use blocklist::{AbuseCache, AbuseEntry};
pub use config::{Options, PoolRoute, RateQuota, ServicePool};
pub use error::{BalancerError, ConfigError, ForwardError, ListenerError, Result};
pub use forward::{Forwarder, Route};
pub use health::{HealthCheckScheduler, HealthSchedulerOptions, TaskQueue};
pub use ratelimit::TokenBucket;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
