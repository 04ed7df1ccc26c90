//! TTL derivation from upstream `Cache-Control` headers.

use moka::sync::Cache;

use crate::config::TtlConfig;

/// Maps upstream `Cache-Control` values to a TTL in seconds.
///
/// Derivation is a pure function of the header text, so results are memoized
/// per distinct header value.
#[derive(Clone)]
pub struct TtlPolicy {
    default_ttl_secs: u64,
    max_ttl_secs: u64,
    memo: Cache<String, u64>,
}

impl std::fmt::Debug for TtlPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlPolicy")
            .field("default_ttl_secs", &self.default_ttl_secs)
            .field("max_ttl_secs", &self.max_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TtlPolicy {
    pub fn new(config: &TtlConfig) -> Self {
        Self {
            default_ttl_secs: config.default_ttl_secs,
            max_ttl_secs: config.max_ttl_secs,
            memo: Cache::builder().max_capacity(config.memo_capacity).build(),
        }
    }

    /// TTL for a response carrying the given `Cache-Control` value.
    ///
    /// Uses `max-age` when present, the default otherwise, and clamps the
    /// result to `[1, max_ttl]`.
    pub fn derive(&self, cache_control: Option<&str>) -> u64 {
        let Some(header) = cache_control else {
            return self.clamp(self.default_ttl_secs);
        };

        if let Some(ttl) = self.memo.get(header) {
            return ttl;
        }

        let ttl = self.clamp(parse_max_age(header).unwrap_or(self.default_ttl_secs));
        self.memo.insert(header.to_owned(), ttl);
        ttl
    }

    /// Bound an externally supplied TTL to `[1, max_ttl]`.
    pub fn clamp(&self, ttl: u64) -> u64 {
        ttl.clamp(1, self.max_ttl_secs.max(1))
    }
}

/// Extract the first `max-age=<seconds>` directive.
///
/// Values too large for a `u64` saturate so they still clamp to the cap.
pub fn parse_max_age(header: &str) -> Option<u64> {
    header.split(',').find_map(|directive| {
        let (name, value) = directive.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        let digits = value.trim().trim_matches('"');
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(digits.parse::<u64>().unwrap_or(u64::MAX))
    })
}
