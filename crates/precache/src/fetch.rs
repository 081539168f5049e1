//! # Streaming Fetcher
//!
//! Downloads a resource with bounded retries and hands the body back as a
//! stream. While the consumer reads it, every chunk is written to a
//! partition entry and turned into a progress event. The entry becomes
//! visible only once the stream has ended cleanly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::events::{ProgressEvent, ProgressSource};
use crate::http::{Body, BodyStream, Network, Request, Response};
use crate::manifest::ResourceEntry;
use crate::notify::ClientNotifier;
use crate::partition::{EntryWriter, Partition, ResponseHead, StoredResponse};

/// Callback run after an entry was committed
pub type StoredHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Retry behavior of the fetcher
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
    /// Bound on a single attempt until response headers arrive
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            attempt_timeout: None,
        }
    }
}

/// One resource to fetch and where to keep it
pub struct FetchJob {
    pub request: Request,
    /// Path reported in progress events
    pub resource_path: String,
    pub meta: Option<ResourceEntry>,
    pub partition: Arc<dyn Partition>,
    pub key: String,
    /// Turn a failed cache write into a stream error
    pub require_stored: bool,
    pub report_progress: bool,
    pub on_stored: Option<StoredHook>,
}

impl FetchJob {
    pub fn new(request: Request, partition: Arc<dyn Partition>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            request,
            resource_path: key.clone(),
            meta: None,
            partition,
            key,
            require_stored: false,
            report_progress: true,
            on_stored: None,
        }
    }

    pub fn with_meta(mut self, meta: Option<ResourceEntry>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_resource_path(mut self, resource_path: impl Into<String>) -> Self {
        self.resource_path = resource_path.into();
        self
    }

    pub fn require_stored(mut self) -> Self {
        self.require_stored = true;
        self
    }

    pub fn without_progress(mut self) -> Self {
        self.report_progress = false;
        self
    }

    pub fn on_stored(mut self, hook: StoredHook) -> Self {
        self.on_stored = Some(hook);
        self
    }

    fn progress_event(&self, progress: u8) -> ProgressEvent {
        ProgressEvent::new(
            self.resource_path.clone(),
            self.meta.clone(),
            ProgressSource::Network,
            progress,
        )
    }

    fn total_size(&self, response: &Response) -> Option<u64> {
        self.meta
            .as_ref()
            .and_then(|m| m.size)
            .or_else(|| response.content_length())
            .filter(|&size| size > 0)
    }
}

pub struct StreamingFetcher {
    network: Arc<dyn Network>,
    notifier: Arc<ClientNotifier>,
    policy: RetryPolicy,
}

impl StreamingFetcher {
    pub fn new(network: Arc<dyn Network>, notifier: Arc<ClientNotifier>, policy: RetryPolicy) -> Self {
        Self {
            network,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    async fn attempt(&self, request: &Request) -> Result<Response, FetchError> {
        let response = match self.policy.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.network.fetch(request))
                .await
                .map_err(|_| FetchError::Timeout(limit))??,
            None => self.network.fetch(request).await?,
        };

        if response.is_opaque() || response.status.is_success() {
            Ok(response)
        } else {
            Err(FetchError::Status(response.status))
        }
    }

    /// Fetch `request`, retrying failures that happen before a response arrives.
    ///
    /// Every failure counts, error statuses included. Once attempts are
    /// exhausted the last error is returned.
    pub async fn fetch_with_retries(&self, request: &Request) -> Result<Response, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempts >= max_attempts {
                        warn!(
                            url = %request.url,
                            attempts,
                            error = %e,
                            "Giving up after max attempts"
                        );
                        return Err(e);
                    }
                    debug!(url = %request.url, attempt = attempts, error = %e, "Fetch failed, retrying");
                }
            }
            tokio::time::sleep(self.policy.retry_delay).await;
        }
    }

    /// Fetch the job's request and store the body under `job.key` as it streams.
    pub async fn fetch(&self, job: FetchJob) -> Result<Response, FetchError> {
        let response = self.fetch_with_retries(&job.request).await?;
        self.store(response, job).await
    }

    /// Tee an already received response into the job's partition.
    pub async fn store(&self, response: Response, mut job: FetchJob) -> Result<Response, FetchError> {
        let head = ResponseHead::from_response(&response);
        let total = if response.is_opaque() {
            None
        } else {
            job.total_size(&response)
        };

        let Response {
            status,
            headers,
            kind,
            body,
        } = response;

        let body = match body {
            Body::Stream(upstream) => {
                if total.is_none() {
                    self.report(&mut job, 100).await;
                }
                let writer = match job.partition.writer(&job.key, head).await {
                    Ok(writer) => Some(writer),
                    Err(e) if job.require_stored => {
                        return Err(FetchError::CacheWrite(e.to_string()));
                    }
                    Err(e) => {
                        warn!(key = %job.key, error = %e, "Cannot open cache entry, streaming uncached");
                        None
                    }
                };
                Body::Stream(self.tee(upstream, writer, total, job))
            }
            materialized => {
                let bytes = materialized.collect().await?;
                let stored = StoredResponse::new(head, bytes.clone()).with_fetched_at(Utc::now());
                match job.partition.put(&job.key, stored).await {
                    Ok(()) => {
                        if let Some(hook) = job.on_stored.take() {
                            hook().await;
                        }
                    }
                    Err(e) if job.require_stored => {
                        return Err(FetchError::CacheWrite(e.to_string()));
                    }
                    Err(e) => warn!(key = %job.key, error = %e, "Failed to cache response"),
                }
                self.report(&mut job, 100).await;
                bytes.into()
            }
        };

        Ok(Response {
            status,
            headers,
            kind,
            body,
        })
    }

    async fn report(&self, job: &mut FetchJob, progress: u8) {
        if job.report_progress {
            let event = job.progress_event(progress);
            self.notifier.progress(event).await;
        }
    }

    fn tee(
        &self,
        upstream: BodyStream,
        writer: Option<Box<dyn EntryWriter>>,
        total: Option<u64>,
        job: FetchJob,
    ) -> BodyStream {
        let state = TeeState {
            upstream,
            writer,
            total,
            received: 0,
            last_progress: None,
            notifier: Arc::clone(&self.notifier),
            job,
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            match state.upstream.next().await {
                Some(Ok(chunk)) => match state.on_chunk(&chunk).await {
                    Ok(()) => Some((Ok(chunk), state)),
                    Err(e) => {
                        state.finished = true;
                        Some((Err(e), state))
                    }
                },
                Some(Err(e)) => {
                    warn!(key = %state.job.key, error = %e, "Body stream failed, discarding entry");
                    state.abort().await;
                    state.finished = true;
                    Some((Err(e), state))
                }
                None => {
                    state.finished = true;
                    match state.finish().await {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), state)),
                    }
                }
            }
        })
        .boxed()
    }
}

struct TeeState {
    upstream: BodyStream,
    writer: Option<Box<dyn EntryWriter>>,
    total: Option<u64>,
    received: u64,
    last_progress: Option<u8>,
    notifier: Arc<ClientNotifier>,
    job: FetchJob,
    finished: bool,
}

impl TeeState {
    async fn on_chunk(&mut self, chunk: &Bytes) -> Result<(), FetchError> {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write(chunk).await {
                warn!(key = %self.job.key, error = %e, "Cache write failed, continuing uncached");
                self.abort().await;
                if self.job.require_stored {
                    return Err(FetchError::CacheWrite(e.to_string()));
                }
            }
        }

        self.received += chunk.len() as u64;
        if let Some(total) = self.total {
            let percent = (self.received.saturating_mul(100) / total).min(100) as u8;
            self.progress(percent).await;
        }
        Ok(())
    }

    async fn progress(&mut self, percent: u8) {
        // Never go backwards
        let percent = self.last_progress.map_or(percent, |last| percent.max(last));
        self.last_progress = Some(percent);
        if self.job.report_progress {
            let event = self.job.progress_event(percent);
            self.notifier.progress(event).await;
        }
    }

    async fn abort(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.abort().await {
                warn!(key = %self.job.key, error = %e, "Failed to discard partial entry");
            }
        }
    }

    async fn finish(&mut self) -> Result<(), FetchError> {
        if let Some(mut writer) = self.writer.take() {
            match writer.commit(Utc::now()).await {
                Ok(()) => {
                    debug!(key = %self.job.key, bytes = self.received, "Stored streamed response");
                    if let Some(hook) = self.job.on_stored.take() {
                        hook().await;
                    }
                }
                Err(e) if self.job.require_stored => {
                    return Err(FetchError::CacheWrite(e.to_string()));
                }
                Err(e) => warn!(key = %self.job.key, error = %e, "Failed to commit cache entry"),
            }
        }

        if self.total.is_some() && self.last_progress != Some(100) {
            self.progress(100).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::CacheMode;
    use crate::init_test_tracing;
    use futures::FutureExt;
    use crate::partition::{MatchOptions, MemoryStore, PartitionStore};
    use crate::test_utils::{MockNetwork, RecordingClient, StaticRegistry};
    use reqwest::StatusCode;
    use url::Url;

    struct Fixture {
        network: Arc<MockNetwork>,
        client: Arc<RecordingClient>,
        store: MemoryStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                network: MockNetwork::new(),
                client: RecordingClient::new("tab"),
                store: MemoryStore::new(),
            }
        }

        fn fetcher(&self, max_attempts: u32) -> StreamingFetcher {
            let registry = StaticRegistry::new(vec![self.client.clone()]);
            StreamingFetcher::new(
                self.network.clone(),
                Arc::new(ClientNotifier::new(registry)),
                RetryPolicy {
                    max_attempts,
                    retry_delay: Duration::from_millis(1),
                    attempt_timeout: None,
                },
            )
        }

        async fn job(&self, path: &str) -> FetchJob {
            let url = Url::parse("https://app.test/").unwrap().join(path).unwrap();
            let partition = self.store.open("content").await.unwrap();
            FetchJob::new(
                Request::get(url).with_cache_mode(CacheMode::Reload),
                partition,
                path,
            )
        }
    }

    #[tokio::test]
    async fn test_retry_bound() {
        init_test_tracing!();
        let fx = Fixture::new();
        fx.network.serve("/a.js", b"ok");
        fx.network.fail_times("/a.js", 2);

        let job = fx.job("a.js").await;
        let response = fx.fetcher(3).fetch(job).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(fx.network.calls("/a.js"), 3);

        fx.network.fail_times("/a.js", 3);
        let job = fx.job("a.js").await;
        let err = fx.fetcher(3).fetch(job).await.unwrap_err();
        assert!(matches!(err, FetchError::Unavailable(_)));
        assert_eq!(fx.network.calls("/a.js"), 6);
    }

    #[tokio::test]
    async fn test_error_statuses_are_retried() {
        let fx = Fixture::new();
        fx.network.serve_status("/missing.js", StatusCode::NOT_FOUND);
        fx.network.serve_status("/flaky.js", StatusCode::BAD_GATEWAY);

        let err = fx.fetcher(3).fetch(fx.job("missing.js").await).await.unwrap_err();
        assert!(matches!(err, FetchError::Status(StatusCode::NOT_FOUND)));
        assert_eq!(fx.network.calls("/missing.js"), 3);

        let err = fx.fetcher(3).fetch(fx.job("flaky.js").await).await.unwrap_err();
        assert!(matches!(err, FetchError::Status(StatusCode::BAD_GATEWAY)));
        assert_eq!(fx.network.calls("/flaky.js"), 3);

        let content = fx.store.open("content").await.unwrap();
        assert_eq!(content.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_streamed_body_is_byte_identical_and_stored() {
        let fx = Fixture::new();
        let chunks: [&[u8]; 4] = [b"abc", b"", b"defg", b"hij"];
        fx.network.serve_chunks("/video.bin", &chunks);

        let response = fx.fetcher(1).fetch(fx.job("video.bin").await).await.unwrap();
        let body = response.body.collect().await.unwrap();
        assert_eq!(body, Bytes::from_static(b"abcdefghij"));

        let stored = fx
            .store
            .open("content")
            .await
            .unwrap()
            .get("video.bin", MatchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.body, body);
        assert!(stored.fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_100() {
        let fx = Fixture::new();
        let chunks: [&[u8]; 3] = [b"aaaa", b"bbb", b"ccc"];
        fx.network.serve_chunks("/app.js", &chunks);

        let job = fx
            .job("app.js")
            .await
            .with_meta(Some(ResourceEntry::new("app", Some(10), "h1")));
        let response = fx.fetcher(1).fetch(job).await.unwrap();
        response.body.drain().await.unwrap();

        let progress: Vec<u8> = fx
            .client
            .progress_for("app.js")
            .iter()
            .map(|e| e.progress)
            .collect();
        assert_eq!(progress, vec![40, 70, 100]);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(fx.client.progress_for("app.js").iter().all(|e| e.source == ProgressSource::Network));
    }

    #[tokio::test]
    async fn test_understated_size_is_capped() {
        let fx = Fixture::new();
        let chunks: [&[u8]; 2] = [b"aaaa", b"bbbb"];
        fx.network.serve_chunks("/big.js", &chunks);

        let job = fx
            .job("big.js")
            .await
            .with_meta(Some(ResourceEntry::new("big", Some(4), "h")));
        fx.fetcher(1).fetch(job).await.unwrap().body.drain().await.unwrap();

        let progress: Vec<u8> = fx.client.progress_for("big.js").iter().map(|e| e.progress).collect();
        assert_eq!(progress, vec![100, 100]);
    }

    #[tokio::test]
    async fn test_unknown_size_reports_completion_once() {
        let fx = Fixture::new();
        let chunks: [&[u8]; 2] = [b"ab", b"cd"];
        fx.network.serve_chunks("/feed.json", &chunks);
        fx.network.without_length("/feed.json");

        let response = fx.fetcher(1).fetch(fx.job("feed.json").await).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), Bytes::from_static(b"abcd"));

        let progress: Vec<u8> = fx.client.progress_for("feed.json").iter().map(|e| e.progress).collect();
        assert_eq!(progress, vec![100]);
    }

    #[tokio::test]
    async fn test_opaque_response_is_cached_as_is() {
        let fx = Fixture::new();
        fx.network.serve_opaque("/cdn.js", b"opaque");

        let response = fx.fetcher(1).fetch(fx.job("cdn.js").await).await.unwrap();
        assert!(response.is_opaque());
        response.body.drain().await.unwrap();

        let stored = fx
            .store
            .open("content")
            .await
            .unwrap()
            .get("cdn.js", MatchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(stored.into_response().is_opaque());
        assert_eq!(fx.client.progress_for("cdn.js").len(), 1);
    }

    #[tokio::test]
    async fn test_mid_body_error_commits_nothing() {
        let fx = Fixture::new();
        let chunks: [&[u8]; 2] = [b"first", b"second"];
        fx.network.serve_chunks("/movie.mp4", &chunks);
        fx.network.break_mid_body("/movie.mp4");

        let response = fx.fetcher(3).fetch(fx.job("movie.mp4").await).await.unwrap();
        let err = response.body.collect().await.unwrap_err();
        assert!(matches!(err, FetchError::Stream(_)));
        // Body errors are not retried
        assert_eq!(fx.network.calls("/movie.mp4"), 1);

        let partition = fx.store.open("content").await.unwrap();
        assert_eq!(partition.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stored_hook_runs_after_commit() {
        let fx = Fixture::new();
        fx.network.serve("/clip.mp4", b"clip");
        let partition = fx.store.open("content").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let observed = Arc::clone(&partition);
        let job = fx.job("clip.mp4").await.on_stored(Box::new(move || {
            async move {
                let len = observed.len().await.unwrap_or(0);
                let _ = tx.send(len);
            }
            .boxed()
        }));

        fx.fetcher(1).fetch(job).await.unwrap().body.drain().await.unwrap();
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let fx = Fixture::new();
        fx.network.serve("/slow.js", b"slow");
        fx.network.set_latency(Duration::from_millis(200));

        let registry = StaticRegistry::empty();
        let fetcher = StreamingFetcher::new(
            fx.network.clone(),
            Arc::new(ClientNotifier::new(registry)),
            RetryPolicy {
                max_attempts: 2,
                retry_delay: Duration::from_millis(1),
                attempt_timeout: Some(Duration::from_millis(10)),
            },
        );
        let err = fetcher.fetch(fx.job("slow.js").await).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
        assert_eq!(fx.network.calls("/slow.js"), 2);
    }
}
