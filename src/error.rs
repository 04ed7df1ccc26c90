//! Cache error types

use redis::RedisError;

/// Errors raised while talking to the upstream tile origin.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("failed to read upstream body: {0}")]
    Body(String),

    #[error("invalid tile path: {0}")]
    InvalidPath(String),
}

impl FetchError {
    /// Upstream HTTP status, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Errors raised by the distributed (L2) store.
///
/// A missing key is never an error; these only describe connectivity and
/// protocol failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("malformed record: {0}")]
    Decode(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Host memory telemetry could not be read.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("host memory telemetry unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a call rejected or failed under the circuit breaker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error(transparent)]
    Inner(E),
}

/// Invalid configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("memory fraction must be in (0, 1], got {0}")]
    MemoryFraction(f64),

    #[error("capacity bounds are inverted: min {min} > max {max}")]
    CapacityBounds { min: usize, max: usize },

    #[error("invalid origin URL: {0}")]
    OriginUrl(String),
}

/// Top-level errors returned while building cache components.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Http(String),
}
