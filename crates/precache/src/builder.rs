//! # Builder for ProxyConfig
//!
//! Fluent construction of [`ProxyConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use precache_engine::ProxyConfig;
//!
//! let config = ProxyConfig::builder()
//!     .with_prefix("my-app")
//!     .with_version("1.4.2")
//!     .with_max_attempts(5)
//!     .with_retry_delay(Duration::from_millis(250))
//!     .with_runtime_max_entries(100)
//!     .with_header("X-Client", "precache")
//!     .build();
//!
//! assert_eq!(config.partition_names().staging, "my-app-staging-1.4.2");
//! ```

use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use crate::ProxyConfig;
use crate::http::UpstreamProxy;

/// Builder for creating ProxyConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
        }
    }

    /// Set the cache-name prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Set the manifest version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    /// Set the site root manifest keys resolve against
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.config.origin = origin;
        self
    }

    /// Set the total number of fetch attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self
    }

    /// Set the pause between fetch attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry.retry_delay = delay;
        self
    }

    /// Bound each fetch attempt
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.retry.attempt_timeout = timeout;
        self
    }

    pub fn with_runtime_ttl(mut self, ttl: Duration) -> Self {
        self.config.runtime_ttl = ttl;
        self
    }

    pub fn with_runtime_max_entries(mut self, max_entries: usize) -> Self {
        self.config.runtime_max_entries = max_entries;
        self
    }

    pub fn with_expiry_interval(mut self, interval: Duration) -> Self {
        self.config.expiry_interval = interval;
        self
    }

    pub fn with_network_only_pattern(mut self, pattern: Regex) -> Self {
        self.config.network_only_pattern = pattern;
        self
    }

    pub fn with_media_pattern(mut self, pattern: Regex) -> Self {
        self.config.media_pattern = pattern;
        self
    }

    /// Set the document served to offline navigations
    pub fn with_offline_fallback(mut self, key: impl Into<String>) -> Self {
        self.config.offline_fallback = key.into();
        self
    }

    /// Replace the paths folded onto the root key
    pub fn with_index_aliases(mut self, aliases: Vec<String>) -> Self {
        self.config.index_aliases = aliases;
        self
    }

    /// Set the overall HTTP request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.timeout = timeout;
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout = timeout;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    /// Add a custom request header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_ref().as_bytes()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.http.headers.insert(header_name, header_value);
        }
        self
    }

    /// Route requests through an upstream proxy
    pub fn with_upstream_proxy(mut self, proxy: UpstreamProxy) -> Self {
        self.config.http.proxy = Some(proxy);
        self
    }

    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        self.config.http.use_system_proxy = use_system_proxy;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ProxyConfig {
        self.config
    }
}

impl Default for ProxyConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
