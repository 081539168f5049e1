use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use precache_engine::{CacheProxy, ControllerHost, Request};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::utils::format_bytes;

/// Controller host for a one-shot process; no other instance can be waiting
pub struct CliHost;

#[async_trait]
impl ControllerHost for CliHost {
    async fn skip_waiting(&self) {
        debug!("No waiting instance to supersede");
    }

    async fn claim_clients(&self) {
        debug!("Claiming the terminal client");
    }
}

pub struct CommandExecutor {
    proxy: Arc<CacheProxy>,
}

impl CommandExecutor {
    pub fn new(proxy: Arc<CacheProxy>) -> Self {
        Self { proxy }
    }

    pub async fn install(&self, stage_only: bool) -> Result<(), AppError> {
        if self.proxy.manifest().is_empty() {
            return Err(AppError::InvalidInput(
                "install needs a non-empty manifest (--manifest)".to_string(),
            ));
        }

        let report = self.proxy.install().await?;
        info!(
            staged = report.staged,
            reused = report.reused,
            "Version {} staged",
            self.proxy.config().version
        );

        if stage_only {
            info!("Leaving the staged version waiting (--stage-only)");
            return Ok(());
        }

        let report = self.proxy.activate().await?;
        info!(
            promoted = report.promoted,
            deleted = report.deleted,
            removed = ?report.removed_partitions,
            "Version {} is live",
            self.proxy.config().version
        );
        Ok(())
    }

    pub async fn get(&self, path: &str, navigate: bool, output: Option<&Path>) -> Result<(), AppError> {
        let url = self.proxy.config().origin.join(path.trim_start_matches('/'))?;
        let request = if navigate {
            Request::navigate(url)
        } else {
            Request::get(url)
        };

        let route = self.proxy.router().classify(&request);
        info!(path, route = route.name(), "Requesting resource");

        let response = self.proxy.handle_fetch(request).await;
        let status = response.status;
        if !response.is_success() {
            return Err(AppError::Request {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| AppError::Cache(e.into()))?;

        match output {
            Some(output) => {
                let mut file = tokio::fs::File::create(output).await?;
                file.write_all(&body).await?;
                file.flush().await?;
                info!(
                    "Saved {} ({}) to {}",
                    path,
                    format_bytes(body.len() as u64),
                    output.display()
                );
            }
            None => info!("{} {} ({})", status, path, format_bytes(body.len() as u64)),
        }
        Ok(())
    }

    pub async fn download_offline(&self) -> Result<(), AppError> {
        let report = self.proxy.download_offline().await?;
        info!(
            downloaded = report.downloaded,
            already_cached = report.already_cached,
            failed = report.failed,
            "Offline download finished"
        );
        if report.failed > 0 {
            warn!("{} resources could not be downloaded", report.failed);
        }
        Ok(())
    }

    pub async fn partitions(&self, json: bool) -> Result<(), AppError> {
        let stats = self.proxy.partition_stats().await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }

        if stats.is_empty() {
            println!("No partitions found");
            return Ok(());
        }

        let names = self.proxy.names();
        for stat in &stats {
            let role = if stat.name == names.content {
                "content"
            } else if stat.name == names.staging {
                "staging"
            } else if stat.name == names.manifest {
                "manifest"
            } else if stat.name == names.runtime {
                "runtime"
            } else {
                "foreign"
            };
            println!(
                "{:<40} {:<9} {:>6} entries {:>12}",
                stat.name,
                role,
                stat.entries,
                format_bytes(stat.bytes)
            );
        }
        Ok(())
    }

    pub async fn sweep(&self) -> Result<(), AppError> {
        let report = self.proxy.sweep().await?;
        info!(
            expired = report.expired,
            trimmed = report.trimmed,
            "Runtime partition swept"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use precache_engine::test_utils::{MockNetwork, StaticRegistry};
    use precache_engine::{Manifest, MemoryStore, ProxyConfig, ProxyHost, ResourceEntry};
    use std::time::Duration;
    use url::Url;

    fn executor(network: Arc<MockNetwork>, manifest: Manifest) -> CommandExecutor {
        let config = ProxyConfig::builder()
            .with_prefix("cli")
            .with_version("1")
            .with_origin(Url::parse("https://app.test/").unwrap())
            .with_retry_delay(Duration::from_millis(1))
            .build();
        let proxy = CacheProxy::new(
            config,
            manifest,
            ProxyHost {
                store: Arc::new(MemoryStore::new()),
                network,
                clients: StaticRegistry::empty(),
                controller: Arc::new(CliHost),
            },
        );
        CommandExecutor::new(Arc::new(proxy))
    }

    fn manifest() -> Manifest {
        Manifest::new([("main.js".to_string(), ResourceEntry::new("main", Some(4), "h1"))])
    }

    #[tokio::test]
    async fn test_install_then_get_offline() {
        let network = MockNetwork::new();
        network.serve("/main.js", b"main");
        let executor = executor(network.clone(), manifest());

        executor.install(false).await.unwrap();
        network.set_offline(true);

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("main.js");
        executor.get("/main.js", false, Some(&output)).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"main");
    }

    #[tokio::test]
    async fn test_install_requires_manifest() {
        let executor = executor(MockNetwork::new(), Manifest::default());
        assert!(matches!(
            executor.install(false).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_get_reports_error_status() {
        let network = MockNetwork::new();
        let executor = executor(network, manifest());

        let err = executor.get("missing.txt", false, None).await.unwrap_err();
        assert!(matches!(err, AppError::Request { status: 404, .. }));
    }
}
