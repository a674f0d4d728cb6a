//! Error types for rust-balancer
//!
//! This module defines the error hierarchy for the load balancer.
//! Errors are categorized by subsystem: configuration errors surface before
//! any listener starts, listener errors cover startup and accept failures,
//! and forward errors cover the per-connection data plane.

use std::io;

use thiserror::Error;

/// Top-level error type for rust-balancer
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Configuration errors (pool validation, PEM parsing)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener startup and accept errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Forwarding errors on the data plane
    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BalancerError {
    /// Check if this error is recoverable (the balancer can keep serving)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Listener(e) => e.is_recoverable(),
            Self::Forward(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
///
/// These are reported by the supervisor constructor, `update_pool` and the
/// pre-flight phase of `listen()`, before any socket is bound.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A pool descriptor was supplied without an identity
    #[error("pool missing identity")]
    MissingIdentity,

    /// No pools were supplied to the supervisor
    #[error("missing parameter pools: at least one service pool is required")]
    NoPools,

    /// Two pools are configured for the same listen port
    #[error("more than one service pool per port {port}")]
    DuplicatePort { port: u16 },

    /// Certificate or key PEM data could not be parsed
    #[error("invalid service pool pki data: {reason}")]
    InvalidPki { reason: String },

    /// CA certificate PEM data could not be parsed
    #[error("invalid service pool ca data: {reason}")]
    InvalidCa { reason: String },

    /// A pool field failed validation
    #[error("invalid pool parameter: {0}")]
    InvalidParameter(String),

    /// `update_pool` tried to move a pool to a different listen port
    #[error("pool '{identity}' cannot change listen port {from} -> {to}")]
    PortChange {
        identity: String,
        from: u16,
        to: u16,
    },
}

impl ConfigError {
    /// Config errors are never recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create an invalid PKI error
    pub fn invalid_pki(reason: impl Into<String>) -> Self {
        Self::InvalidPki {
            reason: reason.into(),
        }
    }

    /// Create an invalid CA error
    pub fn invalid_ca(reason: impl Into<String>) -> Self {
        Self::InvalidCa {
            reason: reason.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

/// Listener startup and accept errors
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind the listen socket
    #[error("failed to listen on port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// One listener failed during startup, all listeners were rolled back
    #[error("failed to listen for one of the ports, all listeners will shutdown: {0}")]
    StartGate(String),

    /// Accept failed for a reason other than listener close
    #[error("failed to accept connection on port {port}: {reason}")]
    Accept { port: u16, reason: String },

    /// I/O error
    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ListenerError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::StartGate(_) => false,
            Self::Accept { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(port: u16, reason: impl Into<String>) -> Self {
        Self::Bind {
            port,
            reason: reason.into(),
        }
    }

    /// Create an accept error
    pub fn accept(port: u16, reason: impl Into<String>) -> Self {
        Self::Accept {
            port,
            reason: reason.into(),
        }
    }
}

/// Data-plane forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The route set contains no selectable route
    #[error("no active routes")]
    NoActiveRoutes,

    /// Dial to the chosen upstream failed
    #[error("route unreachable {address}: {reason}")]
    RouteUnreachable { address: String, reason: String },

    /// Dial to the chosen upstream timed out
    #[error("dial to {address} timed out after {timeout_ms}ms")]
    DialTimeout { address: String, timeout_ms: u64 },

    /// The splice phase terminated with transport errors
    #[error("forwarder attach closed with errors: {}", .errors.join("; "))]
    Transport { errors: Vec<String> },

    /// The supervisor context was cancelled while the connection was in flight
    #[error("connection cancelled by shutdown")]
    Cancelled,

    /// I/O error
    #[error("forward I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ForwardError {
    /// Check if this error is recoverable (the listener can keep accepting)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoActiveRoutes => true,
            Self::RouteUnreachable { .. } | Self::DialTimeout { .. } => true,
            Self::Transport { .. } => true,
            Self::Cancelled => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a route unreachable error
    pub fn unreachable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RouteUnreachable {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a dial timeout error
    pub fn dial_timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self::DialTimeout {
            address: address.into(),
            timeout_ms,
        }
    }
}

/// Type alias for Result with `BalancerError`
pub type Result<T> = std::result::Result<T, BalancerError>;
