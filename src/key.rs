//! Cache key derivation
//!
//! A [`CacheKey`] identifies one logical tile. It is built from the request
//! path (normalized) and the whitelisted query parameters, sorted, so two
//! requests for the same tile always map to the same key no matter how the
//! client ordered its parameters or which API key it sent.

use std::fmt;

use url::form_urlencoded;

/// Segment prefix some clients repeat in the tile path (`mc/8/134/86/256/png`).
const REDUNDANT_PREFIX: &str = "mc/";

/// Deterministic identifier of a logical tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-normalized key, e.g. one read back from an invalidation feed.
    pub fn from_normalized(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A tile request as seen by the cache: the path below the proxy mount point
/// and every query parameter the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl TileRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Build a request from a raw `a=1&b=2` query string.
    pub fn with_query(mut self, query: &str) -> Self {
        self.params.extend(
            form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
        self
    }

    /// Path with separators collapsed and the redundant `mc/` prefix removed.
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }
}

/// Collapse repeated slashes, trim leading/trailing ones and strip one
/// redundant `mc/` segment.
pub fn normalize_path(path: &str) -> String {
    let joined = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    match joined.strip_prefix(REDUNDANT_PREFIX) {
        Some(rest) => rest.to_owned(),
        None if joined == REDUNDANT_PREFIX.trim_end_matches('/') => String::new(),
        None => joined,
    }
}

/// Whether any segment of `path` is `.` or `..`, plain or percent-encoded.
///
/// Such paths would resolve outside the origin's tile prefix.
pub fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Turns tile requests into cache keys using a parameter whitelist.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    whitelist: Vec<String>,
}

impl KeyBuilder {
    pub fn new<I, S>(whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            whitelist: whitelist
                .into_iter()
                .map(|p| p.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_whitelisted(&self, name: &str) -> bool {
        self.whitelist
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(name))
    }

    /// Derive the key for a request.
    pub fn build(&self, request: &TileRequest) -> CacheKey {
        let path = request.normalized_path();

        let mut selected: Vec<(String, &str)> = request
            .params
            .iter()
            .filter(|(name, _)| self.is_whitelisted(name))
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .collect();

        if selected.is_empty() {
            return CacheKey(path);
        }

        selected.sort();
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(selected.iter().map(|(k, v)| (k.as_str(), *v)))
            .finish();

        CacheKey(format!("{}?{}", path, query))
    }
}
