use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::fetch::RetryPolicy;
use crate::http::HttpConfig;
use crate::key::{ROOT_KEY, canonical_key};
use crate::partition::PartitionNames;

/// Keys that must always hit the network
pub static DEFAULT_NETWORK_ONLY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(?:php|aspx?|cgi|jsp)$").unwrap());

/// Keys cached at runtime with TTL and capacity limits
pub static DEFAULT_MEDIA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\.(?:png|jpe?g|gif|webp|avif|svg|ico|bmp|mp3|mp4|m4a|aac|ogg|oga|wav|flac|webm|mov|woff2?|ttf|otf)$",
    )
    .unwrap()
});

static DEFAULT_ORIGIN: LazyLock<Url> =
    LazyLock::new(|| Url::parse("http://localhost/").unwrap());

/// Configurable options for the caching proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Cache-name prefix shared by all partitions of the application
    pub prefix: String,

    /// Version string of the resource manifest
    pub version: String,

    /// Site root the manifest keys are relative to
    pub origin: Url,

    /// Retries of the streaming fetcher
    pub retry: RetryPolicy,

    /// Maximum age of a runtime entry
    pub runtime_ttl: Duration,

    /// Maximum number of runtime entries
    pub runtime_max_entries: usize,

    /// Minimum time between two runtime expiry passes
    pub expiry_interval: Duration,

    /// Keys matching this bypass every cache
    pub network_only_pattern: Regex,

    /// Keys matching this are cached in the runtime partition
    pub media_pattern: Regex,

    /// Document served to offline navigations without their own cached copy
    pub offline_fallback: String,

    /// Paths folded onto the root key
    pub index_aliases: Vec<String>,

    /// HTTP client settings
    pub http: HttpConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: "precache".to_owned(),
            version: "0".to_owned(),
            origin: DEFAULT_ORIGIN.clone(),
            retry: RetryPolicy::default(),
            runtime_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            runtime_max_entries: 50,
            expiry_interval: Duration::from_secs(5 * 60),
            network_only_pattern: DEFAULT_NETWORK_ONLY_PATTERN.clone(),
            media_pattern: DEFAULT_MEDIA_PATTERN.clone(),
            offline_fallback: ROOT_KEY.to_owned(),
            index_aliases: vec!["index.html".to_owned()],
            http: HttpConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn builder() -> crate::builder::ProxyConfigBuilder {
        crate::builder::ProxyConfigBuilder::new()
    }

    pub fn partition_names(&self) -> PartitionNames {
        PartitionNames::new(&self.prefix, &self.version)
    }

    /// Canonical key of the offline fallback document
    pub fn offline_fallback_key(&self) -> String {
        canonical_key(&self.offline_fallback, &self.index_aliases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns() {
        let config = ProxyConfig::default();
        assert!(config.media_pattern.is_match("img/logo.PNG"));
        assert!(config.media_pattern.is_match("assets/intro.mp4"));
        assert!(!config.media_pattern.is_match("main.dart.js"));
        assert!(config.network_only_pattern.is_match("api/login.php"));
        assert!(!config.network_only_pattern.is_match("/"));
    }

    #[test]
    fn test_offline_fallback_key() {
        let mut config = ProxyConfig::default();
        assert_eq!(config.offline_fallback_key(), "/");

        config.offline_fallback = "/index.html".into();
        assert_eq!(config.offline_fallback_key(), "/");

        config.offline_fallback = "/offline.html".into();
        assert_eq!(config.offline_fallback_key(), "offline.html");
    }
}
