//! Scripted collaborators for exercising the engine without a real origin.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderValue};

use crate::error::FetchError;
use crate::events::{ClientMessage, ProgressEvent};
use crate::http::{Body, Network, Request, Response, ResponseKind};
use crate::notify::{Client, ClientRegistry, NotifyError};

/// Macro to initialize tracing for tests
///
/// Usage:
/// - `init_test_tracing!()` - uses DEBUG level (default)
/// - `init_test_tracing!(INFO)` - uses specified level
#[macro_export]
macro_rules! init_test_tracing {
    () => {
        $crate::init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

pub use crate::init_test_tracing;

#[derive(Clone)]
struct MockRoute {
    status: StatusCode,
    kind: ResponseKind,
    chunks: Vec<Bytes>,
    /// Advertise the body length
    content_length: bool,
    /// Requests failing before any header arrives
    failures: usize,
    /// Fail after the first chunk
    break_mid_body: bool,
}

impl MockRoute {
    fn new(chunks: Vec<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            kind: ResponseKind::Basic,
            chunks,
            content_length: true,
            failures: 0,
            break_mid_body: false,
        }
    }

    fn response(&self) -> Response {
        let mut chunks: Vec<Result<Bytes, FetchError>> =
            self.chunks.iter().cloned().map(Ok).collect();
        if self.break_mid_body {
            chunks.truncate(1);
            chunks.push(Err(FetchError::Stream("connection reset".into())));
        }

        let mut response = Response::new(self.status, Body::stream(stream::iter(chunks)));
        response.kind = self.kind;
        if self.content_length {
            let len: usize = self.chunks.iter().map(Bytes::len).sum();
            response
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        response
    }
}

/// [`Network`] answering from scripted routes, keyed by URL path.
///
/// Unknown paths answer 404. While offline every request fails.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, MockRoute>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, path: &str, route: MockRoute) {
        self.routes.lock().insert(path.to_string(), route);
    }

    fn update(&self, path: &str, f: impl FnOnce(&mut MockRoute)) {
        let mut routes = self.routes.lock();
        let route = routes
            .entry(path.to_string())
            .or_insert_with(|| MockRoute::new(Vec::new()));
        f(route);
    }

    /// Serve `body` in one chunk
    pub fn serve(&self, path: &str, body: &[u8]) {
        self.route(path, MockRoute::new(vec![Bytes::copy_from_slice(body)]));
    }

    /// Serve the body split into the given chunks
    pub fn serve_chunks(&self, path: &str, chunks: &[&[u8]]) {
        let chunks = chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect();
        self.route(path, MockRoute::new(chunks));
    }

    /// Answer with `status` and an empty body
    pub fn serve_status(&self, path: &str, status: StatusCode) {
        let mut route = MockRoute::new(Vec::new());
        route.status = status;
        self.route(path, route);
    }

    /// Serve a cross-origin response without a readable length
    pub fn serve_opaque(&self, path: &str, body: &[u8]) {
        let mut route = MockRoute::new(vec![Bytes::copy_from_slice(body)]);
        route.kind = ResponseKind::Opaque;
        route.content_length = false;
        self.route(path, route);
    }

    pub fn without_length(&self, path: &str) {
        self.update(path, |route| route.content_length = false);
    }

    /// Let the next `times` requests for `path` fail before any response
    pub fn fail_times(&self, path: &str, times: usize) {
        self.update(path, |route| route.failures = times);
    }

    /// Cut the body of `path` after its first chunk
    pub fn break_mid_body(&self, path: &str) {
        self.update(path, |route| route.break_mid_body = true);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every answer
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let path = request.url.path().to_string();
        *self.calls.lock().entry(path.clone()).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unavailable(format!("offline: {path}")));
        }

        let mut routes = self.routes.lock();
        let Some(route) = routes.get_mut(&path) else {
            return Ok(Response::new(StatusCode::NOT_FOUND, Body::Empty));
        };
        if route.failures > 0 {
            route.failures -= 1;
            return Err(FetchError::Unavailable(format!("scripted failure: {path}")));
        }
        Ok(route.response())
    }
}

/// Client keeping every message it receives
pub struct RecordingClient {
    id: String,
    controlled: bool,
    messages: Mutex<Vec<ClientMessage>>,
}

impl RecordingClient {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            controlled: true,
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn uncontrolled(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            controlled: false,
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn messages(&self) -> Vec<ClientMessage> {
        self.messages.lock().clone()
    }

    /// Progress events received for `resource_path`, in arrival order
    pub fn progress_for(&self, resource_path: &str) -> Vec<ProgressEvent> {
        self.messages
            .lock()
            .iter()
            .filter_map(|message| match message {
                ClientMessage::ResourceProgress(event) if event.resource_path == resource_path => {
                    Some(event.clone())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Client for RecordingClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_controlled(&self) -> bool {
        self.controlled
    }

    async fn post(&self, message: &ClientMessage) -> Result<(), NotifyError> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// Registry over a fixed set of clients
#[derive(Default)]
pub struct StaticRegistry {
    clients: Vec<Arc<dyn Client>>,
}

impl StaticRegistry {
    pub fn new(clients: Vec<Arc<dyn Client>>) -> Arc<Self> {
        Arc::new(Self { clients })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ClientRegistry for StaticRegistry {
    async fn clients(&self, include_uncontrolled: bool) -> Vec<Arc<dyn Client>> {
        self.clients
            .iter()
            .filter(|c| include_uncontrolled || c.is_controlled())
            .cloned()
            .collect()
    }
}
