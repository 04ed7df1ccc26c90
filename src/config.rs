//! Cache configuration

use std::time::Duration;

use crate::error::ConfigError;

/// Query parameters that identify a logical tile. Anything else (API keys,
/// cache busters) is left out of the cache key.
pub const DEFAULT_PARAM_WHITELIST: &[&str] = &[
    "x", "y", "z", "zoom", "size", "style", "lang", "lang2", "language", "ppi", "scale", "format",
    "features",
];

/// Configuration for the tile cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix applied to every L2 key and to the invalidation channel
    pub namespace: String,
    /// Query parameters kept in the cache key
    pub param_whitelist: Vec<String>,
    /// Collapse concurrent misses on the same key into one origin fetch
    pub coalesce_misses: bool,
    /// Run the invalidation listener and publish explicit invalidations
    pub enable_pubsub: bool,
    /// Upper bound on a single L2 round trip; a slow store is treated as a miss
    pub store_timeout: Duration,
    pub local: LocalStoreConfig,
    pub ttl: TtlConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub listener: ListenerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "tile:".to_owned(),
            param_whitelist: DEFAULT_PARAM_WHITELIST
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
            coalesce_misses: true,
            enable_pubsub: true,
            store_timeout: Duration::from_millis(500),
            local: LocalStoreConfig::default(),
            ttl: TtlConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Name of the explicit invalidation channel for this namespace.
    pub fn invalidation_channel(&self) -> String {
        format!("{}invalidate", self.namespace)
    }

    /// Check the configuration for values the cache cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "store_timeout",
            });
        }
        self.local.validate()?;
        if self.ttl.max_ttl_secs == 0 {
            return Err(ConfigError::Zero {
                field: "ttl.max_ttl_secs",
            });
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "circuit_breaker.failure_threshold",
            });
        }
        if self.listener.initial_backoff.is_zero() {
            return Err(ConfigError::Zero {
                field: "listener.initial_backoff",
            });
        }
        Ok(())
    }
}

/// Sizing of the in-process (L1) store.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Share of available host memory the store may target
    pub memory_fraction: f64,
    /// Estimated average payload size, used to turn bytes into an entry count
    pub average_entry_bytes: u64,
    pub min_capacity: usize,
    pub max_capacity: usize,
    /// Used when host telemetry cannot be read
    pub fallback_capacity: usize,
    /// Resample telemetry after this much time...
    pub sample_interval: Duration,
    /// ...or after this many writes, whichever comes first
    pub sample_every_puts: u64,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            memory_fraction: 0.10,
            average_entry_bytes: 32 * 1024,
            min_capacity: 100,
            max_capacity: 100_000,
            fallback_capacity: 10_000,
            sample_interval: Duration::from_secs(30),
            sample_every_puts: 10_000,
        }
    }
}

impl LocalStoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(ConfigError::MemoryFraction(self.memory_fraction));
        }
        if self.average_entry_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "local.average_entry_bytes",
            });
        }
        if self.min_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "local.min_capacity",
            });
        }
        if self.min_capacity > self.max_capacity {
            return Err(ConfigError::CapacityBounds {
                min: self.min_capacity,
                max: self.max_capacity,
            });
        }
        if self.fallback_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "local.fallback_capacity",
            });
        }
        Ok(())
    }
}

/// Bounds for TTLs derived from upstream `Cache-Control` headers.
#[derive(Debug, Clone)]
pub struct TtlConfig {
    /// Used when the header carries no usable `max-age`
    pub default_ttl_secs: u64,
    /// Upper bound applied to every derived TTL
    pub max_ttl_secs: u64,
    /// Number of distinct header values remembered
    pub memo_capacity: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            max_ttl_secs: 3600,
            memo_capacity: 1024,
        }
    }
}

/// Circuit breaker guarding the origin.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Cooldown before a probe is let through
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Reconnect behavior of the invalidation listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Random jitter added on top of each backoff, as a fraction of it
    pub jitter: f64,
    /// Ask Redis to emit keyspace notifications at connect time
    pub configure_keyspace_events: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: 0.2,
            configure_keyspace_events: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalidation_channel_uses_namespace() {
        let config = CacheConfig {
            namespace: "tiles:v2:".to_owned(),
            ..Default::default()
        };
        assert_eq!(config.invalidation_channel(), "tiles:v2:invalidate");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CacheConfig::default();
        config.namespace.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyNamespace)
        ));

        let mut config = CacheConfig::default();
        config.local.memory_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MemoryFraction(_))
        ));

        let mut config = CacheConfig::default();
        config.local.min_capacity = 500;
        config.local.max_capacity = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CapacityBounds { min: 500, max: 100 })
        ));

        let mut config = CacheConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero { .. })));
    }
}
