//! # Lifecycle Controller
//!
//! Installs a manifest version into a staging partition and activates it by
//! promoting staged resources into the live content partition. Activation
//! either completes every step or rolls back to an empty cache, so the
//! content partition never mixes two versions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use futures::{StreamExt, TryStreamExt, stream};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::CacheError;
use crate::fetch::{FetchJob, StreamingFetcher};
use crate::http::{CacheMode, Request};
use crate::key::{resolve, strip_search};
use crate::manifest::Manifest;
use crate::partition::{
    MatchOptions, Partition, PartitionNames, PartitionStore, ResponseHead, StoredResponse,
};

/// Key of the persisted manifest inside the manifest partition
pub const MANIFEST_KEY: &str = "__manifest__";

/// Staged entries copied into content at once during promotion
const PROMOTE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Installing,
    /// Staging is complete and waits for activation
    Staged,
    Activating,
    Active,
    /// Install or activation failed; a new install may start
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Installing => "installing",
            LifecycleState::Staged => "staged",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Controls the host runtime the proxy is installed into
#[async_trait]
pub trait ControllerHost: Send + Sync {
    /// Supersede any instance still waiting to activate
    async fn skip_waiting(&self);

    /// Start controlling every open client without a reload
    async fn claim_clients(&self);
}

/// Host without waiting instances or clients to claim
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

#[async_trait]
impl ControllerHost for NoopHost {
    async fn skip_waiting(&self) {}

    async fn claim_clients(&self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Resources fetched into staging
    pub staged: usize,
    /// Resources kept from the live content partition
    pub reused: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Partitions of other versions that were removed
    pub removed_partitions: Vec<String>,
    /// Content entries discarded by the manifest diff
    pub deleted: usize,
    /// Staged entries copied into content
    pub promoted: usize,
}

pub struct LifecycleController {
    store: Arc<dyn PartitionStore>,
    names: PartitionNames,
    manifest: Arc<Manifest>,
    origin: Url,
    fetcher: Arc<StreamingFetcher>,
    host: Arc<dyn ControllerHost>,
    state: RwLock<LifecycleState>,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn PartitionStore>,
        names: PartitionNames,
        manifest: Arc<Manifest>,
        origin: Url,
        fetcher: Arc<StreamingFetcher>,
        host: Arc<dyn ControllerHost>,
    ) -> Self {
        Self {
            store,
            names,
            manifest,
            origin,
            fetcher,
            host,
            state: RwLock::new(LifecycleState::Idle),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        debug!(from = %previous, to = %state, "Lifecycle state changed");
    }

    /// Move to `next` if the current state allows `operation`.
    fn begin(
        &self,
        operation: &'static str,
        allowed: impl Fn(LifecycleState) -> bool,
        next: LifecycleState,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write();
        if !allowed(*state) {
            warn!(operation, state = %*state, "Rejected lifecycle transition");
            return Err(CacheError::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        debug!(from = %*state, to = %next, "Lifecycle state changed");
        *state = next;
        Ok(())
    }

    pub async fn skip_waiting(&self) {
        self.host.skip_waiting().await;
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

    /// The manifest persisted by the last successful activation.
    ///
    /// An absent manifest reads as an empty one.
    pub async fn previous_manifest(&self) -> Result<Manifest, CacheError> {
        let partition = self.open(&self.names.manifest).await?;
        load_manifest(partition.as_ref()).await
    }

    /// Manifest keys whose resource can be kept from the live content partition
    pub async fn reusable_keys(&self) -> Result<HashSet<String>, CacheError> {
        let previous = match self.previous_manifest().await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "Unreadable previous manifest, staging everything");
                Manifest::default()
            }
        };
        let content = self.open(&self.names.content).await?;
        let cached: HashSet<String> = content.keys().await?.into_iter().collect();

        Ok(self
            .manifest
            .iter()
            .map(|(key, _)| key)
            .filter(|key| self.manifest.unchanged_since(&previous, key) && cached.contains(*key))
            .cloned()
            .collect())
    }

    /// Fetch every new or changed manifest resource into the staging partition.
    ///
    /// A single failed resource fails the whole install and drops staging.
    ///
    /// Rejected while another install or an activation is running.
    pub async fn install(&self) -> Result<InstallReport, CacheError> {
        self.begin(
            "install",
            |state| !matches!(state, LifecycleState::Installing | LifecycleState::Activating),
            LifecycleState::Installing,
        )?;
        self.host.skip_waiting().await;

        match self.stage().await {
            Ok(report) => {
                self.set_state(LifecycleState::Staged);
                info!(
                    version_partition = %self.names.staging,
                    staged = report.staged,
                    reused = report.reused,
                    "Install complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Install failed, discarding staging");
                if let Err(delete_err) = self.store.delete(&self.names.staging).await {
                    warn!(error = %delete_err, "Failed to delete staging partition");
                }
                self.set_state(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    async fn stage(&self) -> Result<InstallReport, CacheError> {
        let reusable = self.reusable_keys().await?;
        let staging = self.open(&self.names.staging).await?;

        let pending: Vec<_> = self
            .manifest
            .iter()
            .filter(|(key, _)| !reusable.contains(*key))
            .collect();
        debug!(pending = pending.len(), reused = reusable.len(), "Staging resources");

        try_join_all(pending.iter().map(|(key, entry)| {
            let staging = Arc::clone(&staging);
            async move {
                let url = resolve(&self.origin, key).map_err(|e| CacheError::staging(*key, e))?;
                let request = Request::get(url).with_cache_mode(CacheMode::Reload);
                let job = FetchJob::new(request, staging, key.as_str())
                    .with_meta(Some((*entry).clone()))
                    .require_stored();

                let response = self
                    .fetcher
                    .fetch(job)
                    .await
                    .map_err(|e| CacheError::staging(*key, e))?;
                response
                    .body
                    .drain()
                    .await
                    .map_err(|e| CacheError::staging(*key, e))?;
                Ok::<_, CacheError>(())
            }
        }))
        .await?;

        Ok(InstallReport {
            staged: pending.len(),
            reused: reusable.len(),
        })
    }

    /// Promote the staged version. On failure every version-bound partition
    /// is deleted so the next install starts from scratch.
    ///
    /// Only a fully staged version can be activated.
    pub async fn activate(&self) -> Result<ActivationReport, CacheError> {
        self.begin(
            "activate",
            |state| state == LifecycleState::Staged,
            LifecycleState::Activating,
        )?;

        match self.promote().await {
            Ok(report) => {
                self.host.claim_clients().await;
                self.set_state(LifecycleState::Active);
                info!(
                    removed_partitions = report.removed_partitions.len(),
                    deleted = report.deleted,
                    promoted = report.promoted,
                    "Activation complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Activation failed, rolling back");
                self.rollback().await;
                self.set_state(LifecycleState::Failed);
                Err(CacheError::Activation(e.to_string()))
            }
        }
    }

    async fn promote(&self) -> Result<ActivationReport, CacheError> {
        let removed_partitions = self.collect_garbage().await?;

        let (content, staging, manifest_store) = futures::try_join!(
            self.open(&self.names.content),
            self.open(&self.names.staging),
            self.open(&self.names.manifest),
        )?;

        let previous = load_manifest(manifest_store.as_ref()).await?;

        // Keep only what is byte-identical between both versions
        let stale: Vec<String> = content
            .keys()
            .await?
            .into_iter()
            .filter(|key| !self.manifest.unchanged_since(&previous, strip_search(key)))
            .collect();
        try_join_all(stale.iter().map(|key| content.delete(key))).await?;

        let staged = staging.keys().await?;
        stream::iter(staged.iter().cloned())
            .map(|key: String| {
                let content = Arc::clone(&content);
                let staging = Arc::clone(&staging);
                async move {
                    match staging.get(&key, MatchOptions::default()).await? {
                        Some(response) => content.put(&key, response).await,
                        None => Ok(()),
                    }
                }
            })
            .buffer_unordered(PROMOTE_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await?;

        let manifest_json = self.manifest.to_json()?;
        let head = ResponseHead::ok().with_header("Content-Type", "application/json");
        manifest_store
            .put(
                MANIFEST_KEY,
                StoredResponse::new(head, manifest_json).with_fetched_at(Utc::now()),
            )
            .await?;
        self.store.delete(&self.names.staging).await?;

        Ok(ActivationReport {
            removed_partitions,
            deleted: stale.len(),
            promoted: staged.len(),
        })
    }

    async fn collect_garbage(&self) -> Result<Vec<String>, CacheError> {
        let stale: Vec<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|name| !self.names.is_allowed(name))
            .collect();

        try_join_all(stale.iter().map(|name| self.store.delete(name))).await?;
        if !stale.is_empty() {
            debug!(partitions = ?stale, "Deleted partitions of other versions");
        }
        Ok(stale)
    }

    async fn rollback(&self) {
        let names = [&self.names.content, &self.names.staging, &self.names.manifest];
        let results = join_all(names.iter().map(|name| self.store.delete(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!(partition = %name, error = %e, "Failed to delete partition during rollback");
            }
        }
    }
}

async fn load_manifest(partition: &dyn Partition) -> Result<Manifest, CacheError> {
    match partition.get(MANIFEST_KEY, MatchOptions::default()).await? {
        Some(stored) => Manifest::from_json(&stored.body),
        None => Ok(Manifest::default()),
    }
}
