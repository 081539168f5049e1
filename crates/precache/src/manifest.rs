//! # Resource Manifest
//!
//! The manifest is produced by the application's build step and maps every
//! canonical resource path to its display name, size and content hash.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::{canonical_key, canonical_path};

/// Metadata for one pre-cacheable resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Human readable name shown in progress reports
    #[serde(default)]
    pub name: String,
    /// Size of the resource in bytes, if known at build time
    #[serde(default)]
    pub size: Option<u64>,
    /// Content hash; a change means the cached copy is stale
    pub hash: String,
}

impl ResourceEntry {
    pub fn new(name: impl Into<String>, size: Option<u64>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            hash: hash.into(),
        }
    }
}

/// Snapshot of every resource of one application version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    resources: BTreeMap<String, ResourceEntry>,
}

impl Manifest {
    /// Build a manifest, normalizing every path into the canonical key space.
    pub fn new(resources: impl IntoIterator<Item = (String, ResourceEntry)>) -> Self {
        Self {
            resources: resources
                .into_iter()
                .map(|(path, entry)| (canonical_path(&path), entry))
                .collect(),
        }
    }

    /// Re-key index aliases onto the root key.
    pub fn with_index_aliases(self, index_aliases: &[String]) -> Self {
        Self {
            resources: self
                .resources
                .into_iter()
                .map(|(key, entry)| (canonical_key(&key, index_aliases), entry))
                .collect(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CacheError> {
        let raw: BTreeMap<String, ResourceEntry> = serde_json::from_slice(bytes)
            .map_err(|e| CacheError::Manifest(format!("failed to parse manifest: {e}")))?;
        Ok(Self::new(raw))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Load a manifest JSON file from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Self::from_json(&bytes)
    }

    pub fn get(&self, key: &str) -> Option<&ResourceEntry> {
        self.resources.get(key)
    }

    pub fn hash(&self, key: &str) -> Option<&str> {
        self.resources.get(key).map(|entry| entry.hash.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.resources.contains_key(key)
    }

    /// Whether `key` is present in both manifests with the same hash.
    pub fn unchanged_since(&self, previous: &Manifest, key: &str) -> bool {
        match (previous.hash(key), self.hash(key)) {
            (Some(old), Some(new)) => old == new,
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceEntry)> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
