//! # Memory Partition Provider
//!
//! In-process partitions. Used by tests and by hosts that do not need
//! entries to outlive the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::key::strip_search;
use crate::partition::providers::{EntryWriter, Partition, PartitionStore};
use crate::partition::types::{EntryMeta, MatchOptions, PartitionResult, ResponseHead, StoredResponse};

#[derive(Clone)]
struct MemoryEntry {
    response: StoredResponse,
    sequence: u64,
}

struct PartitionInner {
    name: String,
    entries: RwLock<HashMap<String, MemoryEntry>>,
    sequence: AtomicU64,
}

impl PartitionInner {
    fn insert(&self, key: &str, response: StoredResponse) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .insert(key.to_string(), MemoryEntry { response, sequence });
    }
}

/// A partition held in memory
#[derive(Clone)]
pub struct MemoryPartition {
    inner: Arc<PartitionInner>,
}

impl MemoryPartition {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(PartitionInner {
                name: name.to_string(),
                entries: RwLock::new(HashMap::new()),
                sequence: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait]
impl Partition for MemoryPartition {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(
        &self,
        key: &str,
        options: MatchOptions,
    ) -> PartitionResult<Option<StoredResponse>> {
        let entries = self.inner.entries.read();
        if let Some(entry) = entries.get(key) {
            return Ok(Some(entry.response.clone()));
        }
        if !options.ignore_search {
            return Ok(None);
        }

        // Newest entry whose path matches wins
        let wanted = strip_search(key);
        Ok(entries
            .iter()
            .filter(|(k, _)| strip_search(k) == wanted)
            .max_by_key(|(_, e)| e.sequence)
            .map(|(_, e)| e.response.clone()))
    }

    async fn put(&self, key: &str, response: StoredResponse) -> PartitionResult<()> {
        self.inner.insert(key, response);
        Ok(())
    }

    async fn writer(&self, key: &str, head: ResponseHead) -> PartitionResult<Box<dyn EntryWriter>> {
        Ok(Box::new(MemoryEntryWriter {
            partition: Arc::clone(&self.inner),
            key: key.to_string(),
            head,
            buffer: Some(BytesMut::new()),
        }))
    }

    async fn delete(&self, key: &str) -> PartitionResult<bool> {
        Ok(self.inner.entries.write().remove(key).is_some())
    }

    async fn entries(&self) -> PartitionResult<Vec<EntryMeta>> {
        let mut entries: Vec<EntryMeta> = self
            .inner
            .entries
            .read()
            .iter()
            .map(|(key, entry)| EntryMeta {
                key: key.clone(),
                head: entry.response.head.clone(),
                fetched_at: entry.response.fetched_at,
                sequence: entry.sequence,
                size: entry.response.body.len() as u64,
            })
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn len(&self) -> PartitionResult<usize> {
        Ok(self.inner.entries.read().len())
    }
}

struct MemoryEntryWriter {
    partition: Arc<PartitionInner>,
    key: String,
    head: ResponseHead,
    buffer: Option<BytesMut>,
}

#[async_trait]
impl EntryWriter for MemoryEntryWriter {
    async fn write(&mut self, chunk: &Bytes) -> PartitionResult<()> {
        match self.buffer.as_mut() {
            Some(buffer) => {
                buffer.extend_from_slice(chunk);
                Ok(())
            }
            None => Err(std::io::Error::other("entry writer already finished")),
        }
    }

    async fn commit(&mut self, fetched_at: DateTime<Utc>) -> PartitionResult<()> {
        let Some(buffer) = self.buffer.take() else {
            return Err(std::io::Error::other("entry writer already finished"));
        };
        let response = StoredResponse::new(self.head.clone(), buffer.freeze())
            .with_fetched_at(fetched_at);
        self.partition.insert(&self.key, response);
        Ok(())
    }

    async fn abort(&mut self) -> PartitionResult<()> {
        self.buffer = None;
        Ok(())
    }
}

/// [`PartitionStore`] keeping every partition in memory
#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<BTreeMap<String, MemoryPartition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PartitionStore for MemoryStore {
    async fn open(&self, name: &str) -> PartitionResult<Arc<dyn Partition>> {
        if let Some(partition) = self.partitions.read().get(name) {
            return Ok(Arc::new(partition.clone()));
        }

        let partition = self
            .partitions
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(partition = name, "Created memory partition");
                MemoryPartition::new(name)
            })
            .clone();
        Ok(Arc::new(partition))
    }

    async fn delete(&self, name: &str) -> PartitionResult<bool> {
        Ok(self.partitions.write().remove(name).is_some())
    }

    async fn list(&self) -> PartitionResult<Vec<String>> {
        Ok(self.partitions.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &'static str) -> StoredResponse {
        StoredResponse::new(ResponseHead::ok(), Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn test_open_is_lazy_and_shared() {
        let store = MemoryStore::new();
        assert!(store.list().await.unwrap().is_empty());

        let a = store.open("p").await.unwrap();
        a.put("k", response("v")).await.unwrap();

        let b = store.open("p").await.unwrap();
        assert!(b.get("k", MatchOptions::default()).await.unwrap().is_some());
        assert_eq!(store.list().await.unwrap(), vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_partition_drops_entries() {
        let store = MemoryStore::new();
        store.open("p").await.unwrap().put("k", response("v")).await.unwrap();

        assert!(store.delete("p").await.unwrap());
        assert!(!store.delete("p").await.unwrap());

        let reopened = store.open("p").await.unwrap();
        assert_eq!(reopened.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ignore_search_prefers_newest_variant() {
        let store = MemoryStore::new();
        let p = store.open("p").await.unwrap();
        p.put("main.js?v=1", response("one")).await.unwrap();
        p.put("main.js?v=2", response("two")).await.unwrap();

        assert!(p.get("main.js", MatchOptions::default()).await.unwrap().is_none());
        let hit = p
            .get("main.js?v=3", MatchOptions::ignoring_search())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_writer_is_invisible_until_commit() {
        let store = MemoryStore::new();
        let p = store.open("p").await.unwrap();

        let mut writer = p.writer("k", ResponseHead::ok()).await.unwrap();
        writer.write(&Bytes::from_static(b"he")).await.unwrap();
        writer.write(&Bytes::from_static(b"llo")).await.unwrap();
        assert!(p.get("k", MatchOptions::default()).await.unwrap().is_none());

        let now = Utc::now();
        writer.commit(now).await.unwrap();
        let stored = p.get("k", MatchOptions::default()).await.unwrap().unwrap();
        assert_eq!(stored.body, Bytes::from_static(b"hello"));
        assert_eq!(stored.fetched_at, Some(now));
        assert!(writer.commit(now).await.is_err());
    }

    #[tokio::test]
    async fn test_aborted_writer_leaves_no_entry() {
        let store = MemoryStore::new();
        let p = store.open("p").await.unwrap();

        let mut writer = p.writer("k", ResponseHead::ok()).await.unwrap();
        writer.write(&Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await.unwrap();
        assert_eq!(p.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entries_follow_insertion_order() {
        let store = MemoryStore::new();
        let p = store.open("p").await.unwrap();
        for key in ["c", "a", "b"] {
            p.put(key, response("x")).await.unwrap();
        }
        assert_eq!(p.keys().await.unwrap(), vec!["c", "a", "b"]);

        // Overwriting moves the key to the back
        p.put("c", response("y")).await.unwrap();
        assert_eq!(p.keys().await.unwrap(), vec!["a", "b", "c"]);
    }
}
