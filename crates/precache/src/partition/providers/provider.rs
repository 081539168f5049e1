//! # Partition Provider
//!
//! Traits every partition backend implements.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::partition::types::{EntryMeta, MatchOptions, PartitionResult, ResponseHead, StoredResponse};

/// A store of named partitions
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Open a partition, creating it if it does not exist
    async fn open(&self, name: &str) -> PartitionResult<Arc<dyn Partition>>;

    /// Delete a partition and everything in it. Returns whether it existed.
    async fn delete(&self, name: &str) -> PartitionResult<bool>;

    /// Names of all existing partitions
    async fn list(&self) -> PartitionResult<Vec<String>>;

    async fn has(&self, name: &str) -> PartitionResult<bool> {
        Ok(self.list().await?.iter().any(|n| n == name))
    }
}

/// A named key-value store of responses
#[async_trait]
pub trait Partition: Send + Sync {
    fn name(&self) -> &str;

    /// Look up a stored response
    async fn get(&self, key: &str, options: MatchOptions)
    -> PartitionResult<Option<StoredResponse>>;

    /// Store a complete response, replacing any previous entry for `key`
    async fn put(&self, key: &str, response: StoredResponse) -> PartitionResult<()>;

    /// Start an incremental write. Nothing is visible until the writer commits.
    async fn writer(&self, key: &str, head: ResponseHead) -> PartitionResult<Box<dyn EntryWriter>>;

    /// Remove an entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> PartitionResult<bool>;

    /// All entries in enumeration (insertion) order
    async fn entries(&self) -> PartitionResult<Vec<EntryMeta>>;

    async fn keys(&self) -> PartitionResult<Vec<String>> {
        Ok(self.entries().await?.into_iter().map(|e| e.key).collect())
    }

    async fn len(&self) -> PartitionResult<usize> {
        Ok(self.entries().await?.len())
    }
}

/// Incremental writer for one partition entry
#[async_trait]
pub trait EntryWriter: Send {
    async fn write(&mut self, chunk: &Bytes) -> PartitionResult<()>;

    /// Make the entry visible, stamped with its fetch time
    async fn commit(&mut self, fetched_at: DateTime<Utc>) -> PartitionResult<()>;

    /// Discard everything written so far
    async fn abort(&mut self) -> PartitionResult<()>;
}
