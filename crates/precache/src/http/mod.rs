//! # HTTP Layer
//!
//! Request/response types seen by the router and strategies, the
//! [`Network`] capability and its reqwest implementation.

mod client;
mod message;
mod network;
pub mod upstream;

pub use client::{HttpConfig, create_client};
pub use message::{Body, BodyStream, CacheMode, Request, RequestMode, Response, ResponseKind};
pub use network::{HttpNetwork, Network};
pub use upstream::{UpstreamProxy, UpstreamProxyAuth, UpstreamProxyType};
