//! # Request Router
//!
//! Classifies every intercepted request into the strategy that serves it.
//! Rules are checked in order and the first match wins.

use std::sync::Arc;

use regex::Regex;
use reqwest::Method;
use url::Url;

use crate::config::ProxyConfig;
use crate::http::Request;
use crate::key::{storage_key, url_key};
use crate::manifest::Manifest;

/// How a request is served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Forwarded untouched: non-GET, ranged, or not cacheable at all
    PassThrough,
    /// Always fetched from the network
    NetworkOnly,
    /// Pre-cached resource listed in the manifest
    CacheFirst { key: String },
    /// Navigation to a document outside the manifest
    OnlineFirst { key: String },
    /// Media cached at runtime, keyed with its query string
    Runtime { key: String },
}

impl Route {
    pub fn name(&self) -> &'static str {
        match self {
            Route::PassThrough => "pass-through",
            Route::NetworkOnly => "network-only",
            Route::CacheFirst { .. } => "cache-first",
            Route::OnlineFirst { .. } => "online-first",
            Route::Runtime { .. } => "runtime",
        }
    }
}

pub struct RequestRouter {
    origin: Url,
    manifest: Arc<Manifest>,
    network_only: Regex,
    media: Regex,
    index_aliases: Vec<String>,
}

impl RequestRouter {
    pub fn new(config: &ProxyConfig, manifest: Arc<Manifest>) -> Self {
        Self {
            origin: config.origin.clone(),
            manifest,
            network_only: config.network_only_pattern.clone(),
            media: config.media_pattern.clone(),
            index_aliases: config.index_aliases.clone(),
        }
    }

    fn same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    pub fn key(&self, url: &Url) -> String {
        url_key(url, &self.index_aliases)
    }

    pub fn classify(&self, request: &Request) -> Route {
        if request.method != Method::GET || request.has_range() {
            return Route::PassThrough;
        }

        let key = self.key(&request.url);
        if self.network_only.is_match(&key) {
            return Route::NetworkOnly;
        }

        // Manifest keys and navigations only make sense on the application's origin
        let same_origin = self.same_origin(&request.url);
        if same_origin && self.manifest.contains(&key) {
            return Route::CacheFirst { key };
        }
        if same_origin && request.is_navigation() {
            return Route::OnlineFirst { key };
        }

        if self.media.is_match(&key) {
            return Route::Runtime {
                key: storage_key(&request.url, &self.index_aliases),
            };
        }

        Route::PassThrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ResourceEntry;
    use reqwest::header::{self, HeaderValue};

    fn router() -> RequestRouter {
        let config = ProxyConfig::builder()
            .with_origin(Url::parse("https://app.test/").unwrap())
            .build();
        let manifest = Manifest::new([
            ("/".to_string(), ResourceEntry::new("index", None, "h0")),
            ("main.js".to_string(), ResourceEntry::new("main", None, "h1")),
            ("assets/logo.png".to_string(), ResourceEntry::new("logo", None, "h2")),
        ]);
        RequestRouter::new(&config, Arc::new(manifest))
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_non_get_and_range_pass_through() {
        let router = router();
        let post = Request::new(Method::POST, Url::parse("https://app.test/main.js").unwrap());
        assert_eq!(router.classify(&post), Route::PassThrough);

        let ranged = get("https://app.test/main.js")
            .with_header(header::RANGE, HeaderValue::from_static("bytes=0-99"));
        assert_eq!(router.classify(&ranged), Route::PassThrough);
    }

    #[test]
    fn test_manifest_hit_wins_over_media_and_navigation() {
        let router = router();
        assert_eq!(
            router.classify(&get("https://app.test/main.js?v=3")),
            Route::CacheFirst { key: "main.js".into() }
        );
        assert_eq!(
            router.classify(&get("https://app.test/assets/logo.png")),
            Route::CacheFirst { key: "assets/logo.png".into() }
        );
        let nav = Request::navigate(Url::parse("https://app.test/index.html").unwrap());
        assert_eq!(router.classify(&nav), Route::CacheFirst { key: "/".into() });
    }

    #[test]
    fn test_navigation_outside_manifest_is_online_first() {
        let router = router();
        let nav = Request::navigate(Url::parse("https://app.test/settings/").unwrap());
        assert_eq!(router.classify(&nav), Route::OnlineFirst { key: "settings".into() });

        let foreign = Request::navigate(Url::parse("https://other.test/settings").unwrap());
        assert_eq!(router.classify(&foreign), Route::PassThrough);
    }

    #[test]
    fn test_media_keeps_query_variants() {
        let router = router();
        assert_eq!(
            router.classify(&get("https://cdn.test/covers/a.jpg?w=200")),
            Route::Runtime { key: "covers/a.jpg?w=200".into() }
        );
    }

    #[test]
    fn test_network_only_and_fallthrough() {
        let router = router();
        assert_eq!(router.classify(&get("https://app.test/api/save.php")), Route::NetworkOnly);
        assert_eq!(router.classify(&get("https://app.test/data.bin")), Route::PassThrough);
    }
}
