//! # File Partition Provider
//!
//! Durable partitions on the local filesystem. Each partition is a
//! directory under the store root; each entry is a `.meta` JSON sidecar
//! named after the SHA-256 of its key, pointing at a body file unique to
//! the write that produced it. Writes land in temporary files; renaming the
//! sidecar into place commits the entry, so concurrent writers of one key
//! resolve to a single complete version.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, warn};

use crate::key::strip_search;
use crate::partition::providers::{EntryWriter, Partition, PartitionStore};
use crate::partition::types::{EntryMeta, MatchOptions, PartitionResult, ResponseHead, StoredResponse};

const META_EXTENSION: &str = "meta";
const BODY_EXTENSION: &str = "body";
const TEMP_EXTENSION: &str = "tmp";

/// Attempts to read an entry whose body was superseded mid-read
const READ_ATTEMPTS: usize = 3;

fn entry_stem(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn valid_partition_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Metadata sidecar as stored on disk. `body` names the body file of this
/// version of the entry, so renaming the sidecar commits head and body together.
#[derive(Debug, Serialize, Deserialize)]
struct DiskMeta {
    #[serde(flatten)]
    meta: EntryMeta,
    body: String,
}

async fn read_meta(path: &Path) -> Option<DiskMeta> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to read entry metadata file");
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to parse entry metadata");
            None
        }
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Body file of one pending write
struct PendingBody {
    /// Final file name inside the partition directory
    name: String,
    temp: PathBuf,
}

/// Directory and counters shared by a partition and its in-flight writers
struct PartitionDir {
    name: String,
    dir: PathBuf,
    sequence: AtomicU64,
    file_counter: AtomicU64,
    /// Serializes commits and deletes of the same entry
    entry_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PartitionDir {
    fn meta_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{stem}.{META_EXTENSION}"))
    }

    fn temp_path(&self, stem: &str, suffix: &str) -> PathBuf {
        let n = self.file_counter.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{stem}.{n}.{suffix}.{TEMP_EXTENSION}"))
    }

    fn pending_body(&self, stem: &str) -> PendingBody {
        let n = self.file_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{stem}.{n}.{BODY_EXTENSION}");
        let temp = self.dir.join(format!("{name}.{TEMP_EXTENSION}"));
        PendingBody { name, temp }
    }

    fn entry_lock(&self, stem: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.entry_locks.lock().entry(stem.to_string()).or_default())
    }

    fn release_entry_lock(&self, stem: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.entry_locks.lock();
        drop(lock);
        if locks.get(stem).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(stem);
        }
    }

    async fn read_entry(&self, stem: &str) -> PartitionResult<Option<StoredResponse>> {
        for _ in 0..READ_ATTEMPTS {
            let Some(disk) = read_meta(&self.meta_path(stem)).await else {
                return Ok(None);
            };

            match fs::read(self.dir.join(&disk.body)).await {
                Ok(body) => {
                    return Ok(Some(StoredResponse {
                        head: disk.meta.head,
                        body: Bytes::from(body),
                        fetched_at: disk.meta.fetched_at,
                    }));
                }
                // Superseded by a newer commit since the sidecar was read
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Commit a finished body. The sidecar rename is the commit point; the
    /// body it replaces is removed afterwards.
    async fn install(&self, stem: &str, body: &PendingBody, meta: EntryMeta) -> PartitionResult<()> {
        let disk = DiskMeta {
            meta,
            body: body.name.clone(),
        };
        let meta_json = serde_json::to_vec(&disk).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize entry metadata: {e}"),
            )
        })?;

        let body_path = self.dir.join(&body.name);
        if let Err(e) = fs::rename(&body.temp, &body_path).await {
            warn!(from = ?body.temp, to = ?body_path, error = %e, "Failed to rename temporary body file");
            let _ = fs::remove_file(&body.temp).await;
            return Err(e);
        }

        let temp_meta = self.temp_path(stem, META_EXTENSION);
        if let Err(e) = fs::write(&temp_meta, &meta_json).await {
            warn!(path = ?temp_meta, error = %e, "Failed to write entry metadata file");
            let _ = fs::remove_file(&temp_meta).await;
            let _ = fs::remove_file(&body_path).await;
            return Err(e);
        }

        let lock = self.entry_lock(stem);
        let result = {
            let _guard = lock.lock().await;
            self.swap_meta(stem, &temp_meta, &body_path).await
        };
        self.release_entry_lock(stem, lock);
        result
    }

    async fn swap_meta(&self, stem: &str, temp_meta: &Path, body_path: &Path) -> PartitionResult<()> {
        let meta_path = self.meta_path(stem);
        let previous = read_meta(&meta_path).await;

        if let Err(e) = fs::rename(temp_meta, &meta_path).await {
            warn!(from = ?temp_meta, to = ?meta_path, error = %e, "Failed to rename temporary metadata file");
            let _ = fs::remove_file(temp_meta).await;
            let _ = fs::remove_file(body_path).await;
            return Err(e);
        }

        if let Some(previous) = previous {
            if let Err(e) = remove_if_exists(&self.dir.join(&previous.body)).await {
                warn!(partition = %self.name, error = %e, "Failed to remove superseded body file");
            }
        }
        Ok(())
    }

    async fn remove_entry(&self, stem: &str) -> PartitionResult<bool> {
        let lock = self.entry_lock(stem);
        let result = {
            let _guard = lock.lock().await;
            let meta_path = self.meta_path(stem);
            match read_meta(&meta_path).await {
                Some(disk) => match remove_if_exists(&meta_path).await {
                    Ok(()) => remove_if_exists(&self.dir.join(&disk.body)).await.map(|_| true),
                    Err(e) => Err(e),
                },
                None => remove_if_exists(&meta_path).await.map(|_| false),
            }
        };
        self.release_entry_lock(stem, lock);
        result
    }

    fn next_meta(
        &self,
        key: &str,
        head: ResponseHead,
        fetched_at: Option<DateTime<Utc>>,
        size: u64,
    ) -> EntryMeta {
        EntryMeta {
            key: key.to_string(),
            head,
            fetched_at,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            size,
        }
    }

    async fn entries(&self) -> PartitionResult<Vec<EntryMeta>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            if let Some(disk) = read_meta(&path).await {
                entries.push(disk.meta);
            }
        }

        entries.sort_by_key(|meta| meta.sequence);
        Ok(entries)
    }
}

/// A partition stored in one directory
#[derive(Clone)]
pub struct FilePartition {
    inner: Arc<PartitionDir>,
}

impl FilePartition {
    async fn open(name: &str, dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir).await?;

        let inner = PartitionDir {
            name: name.to_string(),
            dir,
            sequence: AtomicU64::new(0),
            file_counter: AtomicU64::new(0),
            entry_locks: Mutex::new(HashMap::new()),
        };

        // Continue numbering after the newest entry already on disk
        let next = inner
            .entries()
            .await?
            .last()
            .map_or(0, |meta| meta.sequence + 1);
        inner.sequence.store(next, Ordering::Relaxed);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

#[async_trait]
impl Partition for FilePartition {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(
        &self,
        key: &str,
        options: MatchOptions,
    ) -> PartitionResult<Option<StoredResponse>> {
        if let Some(hit) = self.inner.read_entry(&entry_stem(key)).await? {
            return Ok(Some(hit));
        }
        if !options.ignore_search {
            return Ok(None);
        }

        let wanted = strip_search(key);
        let newest = self
            .inner
            .entries()
            .await?
            .into_iter()
            .filter(|meta| strip_search(&meta.key) == wanted)
            .max_by_key(|meta| meta.sequence);

        match newest {
            Some(meta) => self.inner.read_entry(&entry_stem(&meta.key)).await,
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, response: StoredResponse) -> PartitionResult<()> {
        let stem = entry_stem(key);
        let body = self.inner.pending_body(&stem);

        if let Err(e) = fs::write(&body.temp, &response.body).await {
            warn!(path = ?body.temp, error = %e, "Failed to write entry body file");
            let _ = fs::remove_file(&body.temp).await;
            return Err(e);
        }

        let meta = self.inner.next_meta(
            key,
            response.head,
            response.fetched_at,
            response.body.len() as u64,
        );
        self.inner.install(&stem, &body, meta).await?;

        debug!(partition = %self.inner.name, key, "Stored entry");
        Ok(())
    }

    async fn writer(&self, key: &str, head: ResponseHead) -> PartitionResult<Box<dyn EntryWriter>> {
        let stem = entry_stem(key);
        let body = self.inner.pending_body(&stem);
        let file = fs::File::create(&body.temp).await?;

        Ok(Box::new(FileEntryWriter {
            partition: Arc::clone(&self.inner),
            key: key.to_string(),
            stem,
            head,
            body,
            file: Some(file),
            written: 0,
        }))
    }

    async fn delete(&self, key: &str) -> PartitionResult<bool> {
        let stem = entry_stem(key);
        self.inner.remove_entry(&stem).await.inspect_err(|e| {
            warn!(partition = %self.inner.name, key, error = %e, "Failed to remove entry");
        })
    }

    async fn entries(&self) -> PartitionResult<Vec<EntryMeta>> {
        self.inner.entries().await
    }
}

struct FileEntryWriter {
    partition: Arc<PartitionDir>,
    key: String,
    stem: String,
    head: ResponseHead,
    body: PendingBody,
    file: Option<fs::File>,
    written: u64,
}

#[async_trait]
impl EntryWriter for FileEntryWriter {
    async fn write(&mut self, chunk: &Bytes) -> PartitionResult<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("entry writer already finished"));
        };
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(&mut self, fetched_at: DateTime<Utc>) -> PartitionResult<()> {
        let Some(mut file) = self.file.take() else {
            return Err(io::Error::other("entry writer already finished"));
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let meta = self
            .partition
            .next_meta(&self.key, self.head.clone(), Some(fetched_at), self.written);
        self.partition.install(&self.stem, &self.body, meta).await?;

        debug!(partition = %self.partition.name, key = %self.key, bytes = self.written, "Committed streamed entry");
        Ok(())
    }

    async fn abort(&mut self) -> PartitionResult<()> {
        if self.file.take().is_some() {
            remove_if_exists(&self.body.temp).await?;
        }
        Ok(())
    }
}

impl Drop for FileEntryWriter {
    fn drop(&mut self) {
        // Dropped mid-stream without commit or abort
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.body.temp);
        }
    }
}

/// [`PartitionStore`] persisting every partition under a root directory
pub struct FileStore {
    root: PathBuf,
    partitions: Mutex<HashMap<String, FilePartition>>,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, name: &str) -> io::Result<PathBuf> {
        if !valid_partition_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid partition name '{name}'"),
            ));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl PartitionStore for FileStore {
    async fn open(&self, name: &str) -> PartitionResult<Arc<dyn Partition>> {
        if let Some(existing) = self.partitions.lock().get(name) {
            return Ok(Arc::new(existing.clone()));
        }

        let dir = self.partition_dir(name)?;
        let opened = FilePartition::open(name, dir).await?;
        // A concurrent open may have won the race; keep the first one
        let partition = self
            .partitions
            .lock()
            .entry(name.to_string())
            .or_insert(opened)
            .clone();
        Ok(Arc::new(partition))
    }

    async fn delete(&self, name: &str) -> PartitionResult<bool> {
        let dir = self.partition_dir(name)?;
        self.partitions.lock().remove(name);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(partition = name, "Deleted partition directory");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(partition = name, error = %e, "Failed to delete partition directory");
                Err(e)
            }
        }
    }

    async fn list(&self) -> PartitionResult<Vec<String>> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if valid_partition_name(name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
