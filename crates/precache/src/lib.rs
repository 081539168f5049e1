//! # Precache
//!
//! An offline-first caching proxy engine. It intercepts an application's
//! requests, keeps resources in named cache partitions and upgrades between
//! manifest versions atomically.
//!
//! ## Features
//!
//! - Versioned installs through a staging partition and manifest diffing
//! - Cache-first pre-cached assets, online-first navigations with offline
//!   fallback, TTL and capacity bounded runtime media caching
//! - Streaming downloads with retries and per-chunk progress events
//! - In-memory and file-backed partition stores

pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod eviction;
pub mod fetch;
pub mod http;
pub mod key;
pub mod lifecycle;
pub mod manifest;
pub mod notify;
pub mod partition;
pub mod proxy;
pub mod router;
pub mod strategy;
pub mod test_utils;

pub use builder::ProxyConfigBuilder;
pub use config::ProxyConfig;
pub use error::{CacheError, FetchError};

// Re-export the host-facing API
pub use events::{ClientCommand, ClientMessage, ProgressEvent, ProgressSource};
pub use http::{HttpConfig, HttpNetwork, Network, Request, Response, create_client};
pub use lifecycle::{ControllerHost, LifecycleState, NoopHost};
pub use manifest::{Manifest, ResourceEntry};
pub use notify::{Client, ClientNotifier, ClientRegistry, DynamicRegistry};
pub use proxy::{CacheProxy, ProxyHost};

// Re-export partition stores
pub use partition::{FileStore, MemoryStore, Partition, PartitionStore};
