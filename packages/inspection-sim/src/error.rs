//! error.rs — Error taxonomy for the device simulator
//!
//! - `ConfigError`: invalid construction parameters, fail fast, never corrected
//! - `BusError`: transient sensor-bus faults, counted by the session
//! - `LinkError`: network/backend faults, downgrade the session state

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("unsupported depth resolution {0} (supported: {1:?})")]
    UnsupportedResolution(usize, &'static [usize]),

    #[error("invalid dimension `{name}`: {value}")]
    InvalidDimension { name: &'static str, value: f64 },

    #[error("product {product_mm:?} mm does not fit inside container {container_mm:?} mm")]
    ProductExceedsContainer {
        product_mm: [f64; 2],
        container_mm: [f64; 2],
    },

    #[error("invalid threshold `{name}`: {reason}")]
    InvalidThreshold { name: &'static str, reason: String },

    #[error("unknown quality profile `{0}`")]
    UnknownProfile(String),
}

impl ConfigError {
    pub fn dimension(name: &'static str, value: f64) -> Self {
        Self::InvalidDimension { name, value }
    }

    pub fn threshold(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidThreshold { name, reason: reason.into() }
    }
}

/// Require a strictly positive, finite value.
pub fn require_positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::dimension(name, value))
    }
}

/// Require a value inside `[0, 1]`.
pub fn require_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::threshold(name, format!("{value} not in [0, 1]")))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    #[error("sensor at 0x{address:02x} did not answer within {timeout_ms} ms")]
    Timeout { address: u8, timeout_ms: u64 },

    #[error("no measurement pending on sensor 0x{0:02x}")]
    NothingPending(u8),

    #[error("self-test failed: {0}")]
    SelfTest(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("network join failed: {0}")]
    Network(String),

    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("no acknowledgement within {0} ms")]
    AckTimeout(u64),

    #[error("not connected")]
    NotConnected,

    #[error("encode failed: {0}")]
    Encode(String),
}
