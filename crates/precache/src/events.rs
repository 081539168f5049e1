//! Messages exchanged with connected clients.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::ResourceEntry;

/// Where a resource was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressSource {
    Cache,
    Network,
}

/// Download progress of one resource
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub resource_path: String,
    pub resource_meta: Option<ResourceEntry>,
    pub source: ProgressSource,
    /// Integer percent, 0..=100
    pub progress: u8,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        resource_path: impl Into<String>,
        resource_meta: Option<ResourceEntry>,
        source: ProgressSource,
        progress: u8,
    ) -> Self {
        Self {
            resource_path: resource_path.into(),
            resource_meta,
            source,
            progress: progress.min(100),
            timestamp: Utc::now(),
        }
    }

    /// A resource answered from a partition
    pub fn from_cache(resource_path: impl Into<String>, resource_meta: Option<ResourceEntry>) -> Self {
        Self::new(resource_path, resource_meta, ProgressSource::Cache, 100)
    }
}

/// Outbound message posted to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    ResourceProgress(ProgressEvent),
    /// A new version finished activating
    #[serde(rename_all = "camelCase")]
    VersionActivated {
        version: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ProgressEvent> for ClientMessage {
    fn from(event: ProgressEvent) -> Self {
        ClientMessage::ResourceProgress(event)
    }
}

/// Inbound command sent by a client. Fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ClientCommand {
    /// Activate a waiting version right away
    #[serde(rename = "skipWaiting", alias = "skip-waiting")]
    SkipWaiting,
    /// Fetch every manifest resource not yet cached
    #[serde(rename = "downloadOffline", alias = "download-all-offline-resources")]
    DownloadOffline,
}

impl FromStr for ClientCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "skipWaiting" | "skip-waiting" => Ok(ClientCommand::SkipWaiting),
            "downloadOffline" | "download-all-offline-resources" => {
                Ok(ClientCommand::DownloadOffline)
            }
            other => Err(format!("unknown client command '{other}'")),
        }
    }
}
