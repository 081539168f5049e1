//! Request and response types exchanged between the host, the router and
//! the network layer.

use std::fmt;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FetchError;

/// A boxed stream of body chunks
pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// How the request was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation
    Navigate,
    /// Any subresource request
    #[default]
    Other,
}

/// Interaction with intermediate HTTP caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Always go to the network, ignoring any intermediate HTTP cache
    Reload,
}

/// An intercepted request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub cache_mode: CacheMode,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            mode: RequestMode::Other,
            cache_mode: CacheMode::Default,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// A top-level navigation request
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    pub fn has_range(&self) -> bool {
        self.headers.contains_key(header::RANGE)
    }
}

/// Visibility of a response to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Same-origin response with readable headers and body
    #[default]
    Basic,
    /// Cross-origin response whose headers and body cannot be inspected
    Opaque,
    /// Synthesized network failure
    Error,
}

/// Response body, either materialized or still streaming
pub enum Body {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl Body {
    pub fn stream(stream: impl futures::Stream<Item = Result<Bytes, FetchError>> + Send + 'static) -> Self {
        Body::Stream(stream.boxed())
    }

    pub fn into_stream(self) -> BodyStream {
        match self {
            Body::Empty => stream::empty().boxed(),
            Body::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream(stream) => stream,
        }
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> Result<Bytes, FetchError> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Consume the body without keeping it, returning the number of bytes read.
    pub async fn drain(self) -> Result<u64, FetchError> {
        let mut stream = self.into_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            total += chunk?.len() as u64;
        }
        Ok(total)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Full(bytes)
        }
    }
}

/// A response handed back to the host
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub kind: ResponseKind,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            kind: ResponseKind::Basic,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        let bytes: Bytes = body.into();
        Self::new(StatusCode::OK, bytes)
    }

    /// A cross-origin response the caller cannot look into
    pub fn opaque(body: Body) -> Self {
        Self {
            kind: ResponseKind::Opaque,
            ..Self::new(StatusCode::OK, body)
        }
    }

    /// Generic failure returned when neither network nor cache can answer
    pub fn network_error() -> Self {
        Self {
            kind: ResponseKind::Error,
            ..Self::new(StatusCode::SERVICE_UNAVAILABLE, Body::Empty)
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.kind != ResponseKind::Error && self.status.is_success()
    }

    pub fn is_opaque(&self) -> bool {
        self.kind == ResponseKind::Opaque
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_concatenates_chunks() {
        let body = Body::stream(stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"")),
            Ok(Bytes::from_static(b"cde")),
        ]));
        assert_eq!(body.collect().await.unwrap(), Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn test_drain_surfaces_stream_errors() {
        let body = Body::stream(stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(FetchError::Stream("reset".into())),
        ]));
        assert!(matches!(body.drain().await, Err(FetchError::Stream(_))));
    }

    #[test]
    fn test_content_length_header() {
        let response = Response::ok("hello").with_header(
            header::CONTENT_LENGTH,
            HeaderValue::from_static("5"),
        );
        assert_eq!(response.content_length(), Some(5));
        assert_eq!(Response::ok("x").content_length(), None);
    }

    #[test]
    fn test_range_and_navigation_flags() {
        let url = Url::parse("https://example.com/video.mp4").unwrap();
        let request = Request::get(url.clone())
            .with_header(header::RANGE, HeaderValue::from_static("bytes=0-"));
        assert!(request.has_range());
        assert!(!request.is_navigation());
        assert!(Request::navigate(url).is_navigation());
    }
}
