use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client;
use reqwest::header::{self, HeaderValue};
use tracing::debug;

use super::message::{Body, CacheMode, Request, Response, ResponseKind};
use crate::error::FetchError;

/// Capability to perform a real network request.
///
/// Implementations return the response as soon as headers are available;
/// the body is streamed through [`Body::Stream`].
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// [`Network`] backed by a reqwest client
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if request.cache_mode == CacheMode::Reload {
            builder = builder
                .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
                .header(header::PRAGMA, HeaderValue::from_static("no-cache"));
        }

        let response = builder.send().await?;
        debug!(url = %request.url, status = %response.status(), "Network response");

        let status = response.status();
        let headers = response.headers().clone();
        let body = Body::stream(response.bytes_stream().map_err(FetchError::from));

        Ok(Response {
            status,
            headers,
            kind: ResponseKind::Basic,
            body,
        })
    }
}
