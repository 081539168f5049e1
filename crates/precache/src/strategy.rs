//! # Strategy Engine
//!
//! The three caching strategies plus the uncached pass-through every one of
//! them falls back to. Strategies always settle into a [`Response`]; internal
//! failures are logged and answered from the network instead.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::eviction::EvictionManager;
use crate::events::ProgressEvent;
use crate::fetch::{FetchJob, StoredHook, StreamingFetcher};
use crate::http::{Request, Response};
use crate::manifest::Manifest;
use crate::notify::ClientNotifier;
use crate::partition::{MatchOptions, Partition, PartitionNames, PartitionStore};

pub struct StrategyEngine {
    store: Arc<dyn PartitionStore>,
    names: PartitionNames,
    manifest: Arc<Manifest>,
    fetcher: Arc<StreamingFetcher>,
    notifier: Arc<ClientNotifier>,
    eviction: Arc<EvictionManager>,
    offline_fallback: String,
}

impl StrategyEngine {
    pub fn new(
        store: Arc<dyn PartitionStore>,
        names: PartitionNames,
        manifest: Arc<Manifest>,
        fetcher: Arc<StreamingFetcher>,
        notifier: Arc<ClientNotifier>,
        eviction: Arc<EvictionManager>,
        offline_fallback: String,
    ) -> Self {
        Self {
            store,
            names,
            manifest,
            fetcher,
            notifier,
            eviction,
            offline_fallback,
        }
    }

    async fn open(&self, name: &str) -> Result<Arc<dyn Partition>, CacheError> {
        self.store
            .open(name)
            .await
            .map_err(|e| CacheError::Partition {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Forward the request without touching any partition.
    pub async fn pass_through(&self, request: &Request) -> Response {
        match self.fetcher.network().fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Pass-through fetch failed");
                Response::network_error()
            }
        }
    }

    /// Serve a manifest resource from Content, fetching and storing it on a miss.
    pub async fn cache_first(&self, request: &Request, key: &str) -> Response {
        match self.try_cache_first(request, key).await {
            Ok(response) => response,
            Err(e) => {
                warn!(key, error = %e, "Cache-first failed, fetching uncached");
                self.pass_through(request).await
            }
        }
    }

    async fn try_cache_first(&self, request: &Request, key: &str) -> Result<Response, CacheError> {
        let content = self.open(&self.names.content).await?;
        let meta = self.manifest.get(key).cloned();

        if let Some(hit) = content.get(key, MatchOptions::ignoring_search()).await? {
            debug!(key, "Cache hit");
            self.notifier
                .progress(ProgressEvent::from_cache(key, meta))
                .await;
            return Ok(hit.into_response());
        }

        debug!(key, "Cache miss, fetching");
        let job = FetchJob::new(request.clone(), content, key).with_meta(meta);
        Ok(self.fetcher.fetch(job).await?)
    }

    /// Prefer the network for navigations, answering from Content when offline.
    ///
    /// Never fails: without network, cached copy or fallback document the
    /// result is a generic network-error response.
    pub async fn online_first(&self, request: &Request, key: &str) -> Response {
        match self.fetcher.network().fetch(request).await {
            Ok(response) if response.is_success() => match self.open(&self.names.content).await {
                Ok(content) => {
                    let job = FetchJob::new(request.clone(), content, key).without_progress();
                    match self.fetcher.store(response, job).await {
                        Ok(response) => return response,
                        Err(e) => warn!(key, error = %e, "Failed to store navigation response"),
                    }
                }
                Err(e) => {
                    warn!(key, error = %e, "Content partition unavailable, serving uncached");
                    return response;
                }
            },
            Ok(response) => {
                debug!(key, status = %response.status, "Navigation answered with error status");
            }
            Err(e) => {
                debug!(key, error = %e, "Navigation fetch failed, trying cache");
            }
        }

        self.offline_response(key).await
    }

    async fn offline_response(&self, key: &str) -> Response {
        let content = match self.open(&self.names.content).await {
            Ok(content) => content,
            Err(e) => {
                warn!(key, error = %e, "Content partition unavailable while offline");
                return Response::network_error();
            }
        };

        for candidate in [key, self.offline_fallback.as_str()] {
            match content.get(candidate, MatchOptions::ignoring_search()).await {
                Ok(Some(hit)) => {
                    debug!(key, served = candidate, "Serving cached document offline");
                    return hit.into_response();
                }
                Ok(None) => {}
                Err(e) => warn!(key = candidate, error = %e, "Cache lookup failed"),
            }
        }

        warn!(key, "Offline with no cached document");
        Response::network_error()
    }

    /// Serve media from the runtime partition, bounded by TTL and capacity.
    pub async fn runtime(&self, request: &Request, key: &str) -> Response {
        match self.try_runtime(request, key).await {
            Ok(response) => response,
            Err(e) => {
                warn!(key, error = %e, "Runtime cache failed, fetching uncached");
                self.pass_through(request).await
            }
        }
    }

    async fn try_runtime(&self, request: &Request, key: &str) -> Result<Response, CacheError> {
        let runtime = self.open(&self.names.runtime).await?;
        if let Some(removed) = self.eviction.maybe_expire(runtime.as_ref()).await {
            debug!(removed, "Runtime expiry pass finished");
        }

        if let Some(hit) = runtime.get(key, MatchOptions::default()).await? {
            debug!(key, "Runtime cache hit");
            self.notifier
                .progress(ProgressEvent::from_cache(key, None))
                .await;
            return Ok(hit.into_response());
        }

        let eviction = Arc::clone(&self.eviction);
        let partition = Arc::clone(&runtime);
        let trim: StoredHook = Box::new(move || {
            async move {
                if let Err(e) = eviction.trim(partition.as_ref()).await {
                    warn!(partition = partition.name(), error = %e, "Capacity trim failed");
                }
            }
            .boxed()
        });

        let job = FetchJob::new(request.clone(), runtime, key).on_stored(trim);
        Ok(self.fetcher.fetch(job).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use reqwest::StatusCode;
    use url::Url;

    use crate::events::ProgressSource;
    use crate::eviction::RateLimiter;
    use crate::fetch::RetryPolicy;
    use crate::http::ResponseKind;
    use crate::manifest::ResourceEntry;
    use crate::partition::{MemoryStore, ResponseHead, StoredResponse};
    use crate::test_utils::{MockNetwork, RecordingClient, StaticRegistry};

    struct Fixture {
        network: Arc<MockNetwork>,
        client: Arc<RecordingClient>,
        store: Arc<MemoryStore>,
        names: PartitionNames,
        engine: StrategyEngine,
    }

    fn fixture(max_entries: usize) -> Fixture {
        let network = MockNetwork::new();
        let client = RecordingClient::new("tab");
        let store = Arc::new(MemoryStore::new());
        let names = PartitionNames::new("app", "1");
        let notifier = Arc::new(ClientNotifier::new(StaticRegistry::new(vec![client.clone()])));
        let fetcher = Arc::new(StreamingFetcher::new(
            network.clone(),
            Arc::clone(&notifier),
            RetryPolicy {
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
                attempt_timeout: None,
            },
        ));
        let eviction = Arc::new(EvictionManager::new(
            Duration::from_secs(3600),
            max_entries,
            Arc::new(RateLimiter::new(Duration::ZERO)),
        ));
        let manifest = Arc::new(Manifest::new([(
            "main.js".to_string(),
            ResourceEntry::new("main", Some(5), "h1"),
        )]));

        let engine = StrategyEngine::new(
            store.clone(),
            names.clone(),
            manifest,
            fetcher,
            notifier,
            eviction,
            "/".to_string(),
        );
        Fixture {
            network,
            client,
            store,
            names,
            engine,
        }
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse("https://app.test/").unwrap().join(path).unwrap())
    }

    #[tokio::test]
    async fn test_cache_first_miss_then_hit() {
        let fx = fixture(50);
        fx.network.serve("/main.js", b"hello");

        let first = fx.engine.cache_first(&get("main.js"), "main.js").await;
        assert_eq!(first.body.collect().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(fx.network.calls("/main.js"), 1);

        let second = fx.engine.cache_first(&get("main.js?v=2"), "main.js").await;
        assert_eq!(second.body.collect().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(fx.network.calls("/main.js"), 1);

        let last = fx.client.progress_for("main.js").pop().unwrap();
        assert_eq!(last.source, ProgressSource::Cache);
        assert_eq!(last.progress, 100);
    }

    #[tokio::test]
    async fn test_cache_first_falls_back_to_direct_fetch() {
        let fx = fixture(50);
        fx.network.serve_status("/main.js", StatusCode::NOT_FOUND);

        let response = fx.engine.cache_first(&get("main.js"), "main.js").await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        // Two attempts by the fetcher, one by the fallback
        assert_eq!(fx.network.calls("/main.js"), 3);

        let content = fx.store.open(&fx.names.content).await.unwrap();
        assert_eq!(content.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_online_first_stores_and_serves_offline() {
        let fx = fixture(50);
        fx.network.serve("/settings", b"<settings>");

        let online = fx.engine.online_first(&get("settings"), "settings").await;
        assert_eq!(online.body.collect().await.unwrap(), Bytes::from_static(b"<settings>"));

        fx.network.set_offline(true);
        let offline = fx.engine.online_first(&get("settings"), "settings").await;
        assert_eq!(offline.status, StatusCode::OK);
        assert_eq!(offline.body.collect().await.unwrap(), Bytes::from_static(b"<settings>"));
    }

    #[tokio::test]
    async fn test_online_first_uses_fallback_then_network_error() {
        let fx = fixture(50);
        fx.network.set_offline(true);

        let response = fx.engine.online_first(&get("profile"), "profile").await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.kind, ResponseKind::Error);

        let content = fx.store.open(&fx.names.content).await.unwrap();
        content
            .put("/", StoredResponse::new(ResponseHead::ok(), Bytes::from_static(b"<shell>")))
            .await
            .unwrap();
        let response = fx.engine.online_first(&get("profile"), "profile").await;
        assert_eq!(response.body.collect().await.unwrap(), Bytes::from_static(b"<shell>"));
    }

    #[tokio::test]
    async fn test_online_first_error_status_uses_cache() {
        let fx = fixture(50);
        fx.network.serve_status("/about", StatusCode::INTERNAL_SERVER_ERROR);
        let content = fx.store.open(&fx.names.content).await.unwrap();
        content
            .put("about", StoredResponse::new(ResponseHead::ok(), Bytes::from_static(b"cached")))
            .await
            .unwrap();

        let response = fx.engine.online_first(&get("about"), "about").await;
        assert_eq!(response.body.collect().await.unwrap(), Bytes::from_static(b"cached"));
    }

    #[tokio::test]
    async fn test_online_first_error_status_without_cache_is_network_error() {
        let fx = fixture(50);
        fx.network.serve_status("/about", StatusCode::NOT_FOUND);

        let response = fx.engine.online_first(&get("about"), "about").await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.kind, ResponseKind::Error);
        assert_eq!(fx.network.calls("/about"), 1);
    }

    #[tokio::test]
    async fn test_runtime_trims_after_each_write() {
        let fx = fixture(2);
        for name in ["a", "b", "c"] {
            let path = format!("/{name}.png");
            fx.network.serve(&path, name.as_bytes());
            let key = format!("{name}.png");
            let response = fx.engine.runtime(&get(&key), &key).await;
            response.body.drain().await.unwrap();
        }

        let runtime = fx.store.open(&fx.names.runtime).await.unwrap();
        assert_eq!(runtime.keys().await.unwrap(), vec!["b.png", "c.png"]);

        let hit = fx.engine.runtime(&get("c.png"), "c.png").await;
        assert_eq!(hit.body.collect().await.unwrap(), Bytes::from_static(b"c"));
        assert_eq!(fx.network.calls("/c.png"), 1);
    }

    #[tokio::test]
    async fn test_pass_through_offline_settles() {
        let fx = fixture(50);
        fx.network.set_offline(true);
        let response = fx.engine.pass_through(&get("data.bin")).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
