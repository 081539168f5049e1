//! # Cache Proxy
//!
//! Wires every component together and exposes the event handlers a host
//! calls: install, activate, fetch and client messages.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::ProxyConfig;
use crate::error::CacheError;
use crate::events::{ClientCommand, ClientMessage};
use crate::eviction::{EvictionManager, RateLimiter};
use crate::fetch::{FetchJob, StreamingFetcher};
use crate::http::{CacheMode, Network, Request, Response};
use crate::key::resolve;
use crate::lifecycle::{
    ActivationReport, ControllerHost, InstallReport, LifecycleController, LifecycleState,
};
use crate::manifest::Manifest;
use crate::notify::{ClientNotifier, ClientRegistry, DeliveryReport};
use crate::partition::{PartitionNames, PartitionStore};
use crate::router::{RequestRouter, Route};
use crate::strategy::StrategyEngine;

/// Outcome of fetching every missing manifest resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub already_cached: usize,
    pub failed: usize,
}

/// Size of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub name: String,
    pub entries: usize,
    pub bytes: u64,
}

/// Outcome of an explicit runtime maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub trimmed: usize,
}

/// Collaborators supplied by the host
pub struct ProxyHost {
    pub store: Arc<dyn PartitionStore>,
    pub network: Arc<dyn Network>,
    pub clients: Arc<dyn ClientRegistry>,
    pub controller: Arc<dyn ControllerHost>,
}

pub struct CacheProxy {
    config: ProxyConfig,
    names: PartitionNames,
    manifest: Arc<Manifest>,
    store: Arc<dyn PartitionStore>,
    notifier: Arc<ClientNotifier>,
    fetcher: Arc<StreamingFetcher>,
    eviction: Arc<EvictionManager>,
    router: RequestRouter,
    strategies: StrategyEngine,
    lifecycle: LifecycleController,
}

impl CacheProxy {
    pub fn new(config: ProxyConfig, manifest: Manifest, host: ProxyHost) -> Self {
        let names = config.partition_names();
        let manifest = Arc::new(manifest.with_index_aliases(&config.index_aliases));

        let notifier = Arc::new(ClientNotifier::new(host.clients));
        let fetcher = Arc::new(StreamingFetcher::new(
            host.network,
            Arc::clone(&notifier),
            config.retry.clone(),
        ));
        let eviction = Arc::new(EvictionManager::new(
            config.runtime_ttl,
            config.runtime_max_entries,
            Arc::new(RateLimiter::new(config.expiry_interval)),
        ));

        let router = RequestRouter::new(&config, Arc::clone(&manifest));
        let strategies = StrategyEngine::new(
            Arc::clone(&host.store),
            names.clone(),
            Arc::clone(&manifest),
            Arc::clone(&fetcher),
            Arc::clone(&notifier),
            Arc::clone(&eviction),
            config.offline_fallback_key(),
        );
        let lifecycle = LifecycleController::new(
            Arc::clone(&host.store),
            names.clone(),
            Arc::clone(&manifest),
            config.origin.clone(),
            Arc::clone(&fetcher),
            host.controller,
        );

        Self {
            config,
            names,
            manifest,
            store: host.store,
            notifier,
            fetcher,
            eviction,
            router,
            strategies,
            lifecycle,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn names(&self) -> &PartitionNames {
        &self.names
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Stage the configured version.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn install(&self) -> Result<InstallReport, CacheError> {
        self.lifecycle.install().await
    }

    /// Promote the staged version and tell every client about it.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn activate(&self) -> Result<ActivationReport, CacheError> {
        let report = self.lifecycle.activate().await?;
        self.notifier
            .broadcast(ClientMessage::VersionActivated {
                version: self.config.version.clone(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(report)
    }

    /// Answer an intercepted request. Always settles into a response.
    pub async fn handle_fetch(&self, request: Request) -> Response {
        let route = self.router.classify(&request);
        debug!(url = %request.url, route = route.name(), "Routing request");

        match route {
            Route::PassThrough | Route::NetworkOnly => self.strategies.pass_through(&request).await,
            Route::CacheFirst { key } => self.strategies.cache_first(&request, &key).await,
            Route::OnlineFirst { key } => self.strategies.online_first(&request, &key).await,
            Route::Runtime { key } => self.strategies.runtime(&request, &key).await,
        }
    }

    /// Handle a client command. Fire-and-forget: failures are only logged.
    pub async fn handle_message(&self, command: ClientCommand) {
        debug!(?command, "Client command");
        match command {
            ClientCommand::SkipWaiting => self.lifecycle.skip_waiting().await,
            ClientCommand::DownloadOffline => {
                if let Err(e) = self.download_offline().await {
                    warn!(error = %e, "Offline download failed");
                }
            }
        }
    }

    /// Fetch every manifest resource missing from the content partition.
    pub async fn download_offline(&self) -> Result<DownloadReport, CacheError> {
        let content = self
            .store
            .open(&self.names.content)
            .await
            .map_err(|e| CacheError::Partition {
                name: self.names.content.clone(),
                reason: e.to_string(),
            })?;
        let cached: HashSet<String> = content.keys().await?.into_iter().collect();

        let missing: Vec<_> = self
            .manifest
            .iter()
            .filter(|(key, _)| !cached.contains(*key))
            .collect();
        info!(missing = missing.len(), cached = cached.len(), "Downloading offline resources");

        let results = join_all(missing.iter().map(|(key, entry)| {
            let content = Arc::clone(&content);
            async move {
                let url = resolve(&self.config.origin, key)?;
                let request = Request::get(url).with_cache_mode(CacheMode::Reload);
                let job = FetchJob::new(request, content, key.as_str())
                    .with_meta(Some((*entry).clone()))
                    .require_stored();
                let response = self.fetcher.fetch(job).await?;
                response.body.drain().await?;
                Ok::<_, CacheError>(())
            }
        }))
        .await;

        let mut report = DownloadReport {
            already_cached: self.manifest.len() - missing.len(),
            ..DownloadReport::default()
        };
        for ((key, _), result) in missing.iter().zip(results) {
            match result {
                Ok(()) => report.downloaded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(key = %key, error = %e, "Failed to download resource");
                }
            }
        }
        Ok(report)
    }

    /// Post a message to every client.
    pub async fn broadcast(&self, message: ClientMessage) -> DeliveryReport {
        self.notifier.broadcast(message).await
    }

    /// Entry count and size of every partition in the store.
    pub async fn partition_stats(&self) -> Result<Vec<PartitionStats>, CacheError> {
        let mut stats = Vec::new();
        for name in self.store.list().await? {
            let partition = self.store.open(&name).await?;
            let entries = partition.entries().await?;
            stats.push(PartitionStats {
                name,
                entries: entries.len(),
                bytes: entries.iter().map(|e| e.size).sum(),
            });
        }
        Ok(stats)
    }

    /// Expire and trim the runtime partition, ignoring the rate limit.
    pub async fn sweep(&self) -> Result<SweepReport, CacheError> {
        let runtime = self.store.open(&self.names.runtime).await?;
        let expired = self.eviction.expire(runtime.as_ref(), Utc::now()).await?;
        let trimmed = self.eviction.trim(runtime.as_ref()).await?;
        info!(expired, trimmed, "Runtime sweep complete");
        Ok(SweepReport { expired, trimmed })
    }
}
