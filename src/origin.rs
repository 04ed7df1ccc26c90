//! Upstream tile origin
//!
//! The cache talks to the origin through [`OriginGateway`] so tests (and
//! other providers) can substitute their own fetcher. [`HttpOrigin`] is the
//! `reqwest` implementation with a pooled, timeout-bounded client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::{CacheError, ConfigError, FetchError};
use crate::key::has_dot_segment;

/// Raw upstream response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header value with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Fetches tiles from the upstream provider.
#[async_trait]
pub trait OriginGateway: Send + Sync + 'static {
    /// Fetch `path` (already normalized) with the client's query parameters.
    ///
    /// Non-success HTTP statuses are returned as responses, not errors; the
    /// caller decides what is cacheable.
    async fn fetch(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<OriginResponse, FetchError>;
}

#[async_trait]
impl<O: OriginGateway + ?Sized> OriginGateway for Arc<O> {
    async fn fetch(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<OriginResponse, FetchError> {
        (**self).fetch(path, params).await
    }
}

/// Settings for [`HttpOrigin`].
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Base URL the normalized tile path is appended to
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// Query parameter carrying the provider API key, added when the client
    /// did not send one
    pub api_key: Option<(String, String)>,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: "https://maps.hereapi.com/v3/base/mc/".to_owned(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 100,
            api_key: None,
        }
    }
}

/// [`OriginGateway`] over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<(String, String)>,
}

impl HttpOrigin {
    pub fn new(config: OriginConfig) -> Result<Self, CacheError> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ConfigError::OriginUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::OriginUrl(format!("{}: not a base URL", config.base_url)).into());
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| CacheError::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    /// Full upstream URL for a tile path and its query parameters.
    ///
    /// Path segments are appended below the base URL, never resolved against
    /// it, so the result always stays on the configured host and prefix.
    pub fn build_url(&self, path: &str, params: &[(String, String)]) -> Result<Url, FetchError> {
        if has_dot_segment(path) {
            return Err(FetchError::InvalidPath(path.to_owned()));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidPath(path.to_owned()))?
            .pop_if_empty()
            .extend(path.split('/').filter(|segment| !segment.is_empty()));

        if !params.is_empty() || self.api_key.is_some() {
            let mut query = url.query_pairs_mut();
            for (name, value) in params {
                query.append_pair(name, value);
            }
            if let Some((name, value)) = &self.api_key {
                if !params.iter().any(|(k, _)| k == name) {
                    query.append_pair(name, value);
                }
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl OriginGateway for HttpOrigin {
    async fn fetch(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<OriginResponse, FetchError> {
        let url = self.build_url(path, params)?;

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(e.to_string())
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?;

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}
