//! Accumulated source code with memory/disk spillover and deduplication.
//!
//! Paths map to content-addressed blobs. A blob is stored once no matter how
//! many paths reference it. Blobs stay in memory until the resident total
//! crosses `memory_threshold_bytes`; past that, the least-recently-accessed
//! blobs are written to `<spill_dir>/<hash[0..2]>/<hash>` and dropped from
//! memory. Reads rehydrate spilled blobs transparently.
//!
//! A spilled payload is written once and kept until `clear()`, so spilling a
//! blob again after rehydration only drops the memory copy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::collab::SourceFiles;
use crate::errors::StoreError;
use crate::util::{is_safe_relative_path, sanitize_path_component};

/// SHA-256 of a file's content, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(content: &str) -> Self {
        Self(hex::encode(Sha256::digest(content.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative location of the spilled payload.
    fn spill_path(&self) -> PathBuf {
        let prefix = &self.0[..self.0.len().min(2)];
        PathBuf::from(prefix).join(&self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFile {
    pub path: String,
    pub content: String,
    pub content_hash: ContentHash,
}

impl CodeFile {
    pub fn new(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.to_string(),
            content_hash: ContentHash::of(content),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Resident payload bytes allowed before spilling to disk
    pub memory_threshold_bytes: usize,
    /// Root directory for spilled payloads
    pub spill_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: 8 * 1024 * 1024,
            spill_dir: PathBuf::from(".forge/spill"),
        }
    }
}

/// What a `put` did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Immutable view of every file in a store at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSnapshot {
    files: SourceFiles,
}

impl CodeSnapshot {
    pub fn new(files: SourceFiles) -> Self {
        Self { files }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn files(&self) -> &SourceFiles {
        &self.files
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.values().map(String::len).sum()
    }
}

/// Result of merging a snapshot into a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: usize,
    /// Features that previously owned an updated path (excluding the merging owner)
    pub displaced_owners: BTreeSet<String>,
}

impl MergeReport {
    pub fn changed(&self) -> usize {
        self.inserted.len() + self.updated.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub files: usize,
    pub unique_blobs: usize,
    pub resident_bytes: usize,
    pub spilled_blobs: usize,
    /// Sum of file sizes as seen by readers (duplicates counted per path)
    pub logical_bytes: usize,
    pub dedup_hits: u64,
}

#[derive(Debug)]
struct Blob {
    resident: Option<Arc<str>>,
    spilled: Option<PathBuf>,
    size: usize,
    refs: usize,
    last_access: AtomicU64,
    /// First path stored with this content, for error context.
    origin: String,
}

#[derive(Debug)]
struct PathEntry {
    hash: ContentHash,
    owner: Option<String>,
}

#[derive(Debug, Default)]
struct StoreInner {
    paths: BTreeMap<String, PathEntry>,
    blobs: HashMap<ContentHash, Blob>,
    resident_bytes: usize,
    dedup_hits: u64,
}

/// Thread-safe code store shared across feature workers.
#[derive(Debug)]
pub struct CodeStore {
    config: StoreConfig,
    inner: RwLock<StoreInner>,
    clock: AtomicU64,
}

impl Default for CodeStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl CodeStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(StoreInner::default()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A fresh store for one feature's accumulation across retries. Spills
    /// under `<spill_dir>/features/<id>` so features never share spill files.
    pub fn scoped(&self, feature_id: &str) -> CodeStore {
        CodeStore::new(StoreConfig {
            memory_threshold_bytes: self.config.memory_threshold_bytes,
            spill_dir: self
                .config
                .spill_dir
                .join("features")
                .join(sanitize_path_component(feature_id)),
        })
    }

    /// Store `content` at `path` with no owning feature.
    pub async fn put(&self, path: &str, content: &str) -> Result<PutOutcome, StoreError> {
        self.put_owned(path, content, None).await.map(|(outcome, _)| outcome)
    }

    /// Store `content` at `path` on behalf of `owner`.
    pub async fn put_as(
        &self,
        owner: &str,
        path: &str,
        content: &str,
    ) -> Result<PutOutcome, StoreError> {
        self.put_owned(path, content, Some(owner))
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Store every file on behalf of `owner`. Returns how many paths changed.
    pub async fn put_files(&self, owner: &str, files: &SourceFiles) -> Result<usize, StoreError> {
        let mut changed = 0;
        for (path, content) in files {
            if self.put_as(owner, path, content).await? != PutOutcome::Unchanged {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Returns the outcome and the previous owner of the path, if any.
    async fn put_owned(
        &self,
        path: &str,
        content: &str,
        owner: Option<&str>,
    ) -> Result<(PutOutcome, Option<String>), StoreError> {
        let hash = ContentHash::of(content);
        let now = self.tick();
        let mut inner = self.inner.write().await;

        let (outcome, previous_owner) = match inner.paths.get_mut(path) {
            Some(entry) if entry.hash == hash => {
                let previous = entry.owner.clone();
                if let Some(owner) = owner {
                    entry.owner = Some(owner.to_string());
                }
                return Ok((PutOutcome::Unchanged, previous));
            }
            Some(entry) => {
                let old_hash = std::mem::replace(&mut entry.hash, hash.clone());
                let previous = std::mem::replace(&mut entry.owner, owner.map(String::from));
                Self::release(&mut inner, &old_hash).await;
                (PutOutcome::Updated, previous)
            }
            None => {
                inner.paths.insert(
                    path.to_string(),
                    PathEntry {
                        hash: hash.clone(),
                        owner: owner.map(String::from),
                    },
                );
                (PutOutcome::Inserted, None)
            }
        };

        let size = content.len();
        match inner.blobs.get_mut(&hash) {
            Some(blob) => {
                blob.refs += 1;
                blob.last_access.store(now, Ordering::Relaxed);
                inner.dedup_hits += 1;
                tracing::debug!(path, hash = %hash, "deduplicated file content");
            }
            None => {
                inner.blobs.insert(
                    hash,
                    Blob {
                        resident: Some(Arc::from(content)),
                        spilled: None,
                        size,
                        refs: 1,
                        last_access: AtomicU64::new(now),
                        origin: path.to_string(),
                    },
                );
                inner.resident_bytes += size;
            }
        }

        self.enforce_threshold(&mut inner).await?;
        Ok((outcome, previous_owner))
    }

    /// Drop one reference to a blob, deleting it (and its spill file) at zero.
    async fn release(inner: &mut StoreInner, hash: &ContentHash) {
        let Some(blob) = inner.blobs.get_mut(hash) else {
            return;
        };
        blob.refs -= 1;
        if blob.refs > 0 {
            return;
        }
        if let Some(blob) = inner.blobs.remove(hash) {
            if blob.resident.is_some() {
                inner.resident_bytes -= blob.size;
            }
            if let Some(location) = blob.spilled {
                tokio::fs::remove_file(&location).await.ok();
            }
        }
    }

    /// Spill least-recently-accessed resident blobs until under the threshold.
    async fn enforce_threshold(&self, inner: &mut StoreInner) -> Result<(), StoreError> {
        while inner.resident_bytes > self.config.memory_threshold_bytes {
            let victim = inner
                .blobs
                .iter()
                .filter(|(_, blob)| blob.resident.is_some())
                .min_by_key(|(_, blob)| blob.last_access.load(Ordering::Relaxed))
                .map(|(hash, _)| hash.clone());

            let Some(hash) = victim else {
                break;
            };
            self.spill(inner, &hash).await?;
        }
        Ok(())
    }

    async fn spill(&self, inner: &mut StoreInner, hash: &ContentHash) -> Result<(), StoreError> {
        let Some(blob) = inner.blobs.get_mut(hash) else {
            return Ok(());
        };
        let Some(content) = blob.resident.clone() else {
            return Ok(());
        };

        if blob.spilled.is_none() {
            let location = self.config.spill_dir.join(hash.spill_path());
            if let Some(parent) = location.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::SpillDirectory {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            tokio::fs::write(&location, content.as_bytes())
                .await
                .map_err(|source| StoreError::SpillFailed {
                    file: blob.origin.clone(),
                    location: location.clone(),
                    source,
                })?;
            tracing::debug!(file = %blob.origin, location = %location.display(), bytes = blob.size, "spilled blob to disk");
            blob.spilled = Some(location);
        }

        blob.resident = None;
        let size = blob.size;
        inner.resident_bytes -= size;
        Ok(())
    }

    /// Read a file, rehydrating it from disk if it was spilled.
    pub async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        let now = self.tick();
        let hash = {
            let inner = self.inner.read().await;
            let Some(entry) = inner.paths.get(path) else {
                return Ok(None);
            };
            let Some(blob) = inner.blobs.get(&entry.hash) else {
                return Ok(None);
            };
            blob.last_access.store(now, Ordering::Relaxed);
            if let Some(content) = &blob.resident {
                return Ok(Some(content.to_string()));
            }
            entry.hash.clone()
        };

        let mut inner = self.inner.write().await;
        let content = {
            let Some(blob) = inner.blobs.get_mut(&hash) else {
                return Ok(None);
            };
            if let Some(content) = &blob.resident {
                // Rehydrated by a concurrent reader.
                return Ok(Some(content.to_string()));
            }
            let Some(location) = blob.spilled.clone() else {
                return Ok(None);
            };
            let content = tokio::fs::read_to_string(&location).await.map_err(|source| {
                StoreError::RehydrateFailed {
                    file: path.to_string(),
                    location: location.clone(),
                    source,
                }
            })?;
            tracing::debug!(file = path, location = %location.display(), "rehydrated blob from disk");
            blob.resident = Some(Arc::from(content.as_str()));
            blob.last_access.store(self.tick(), Ordering::Relaxed);
            content
        };
        inner.resident_bytes += content.len();

        self.enforce_threshold(&mut inner).await?;
        Ok(Some(content))
    }

    /// Owning feature of a path, if it was stored on behalf of one.
    pub async fn owner(&self, path: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.paths.get(path).and_then(|e| e.owner.clone())
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.inner.read().await.paths.contains_key(path)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.paths.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every file at this point in time. Spilled blobs are read from disk
    /// without being made resident again.
    pub async fn snapshot(&self) -> Result<CodeSnapshot, StoreError> {
        let inner = self.inner.read().await;
        let mut files = SourceFiles::new();
        let mut loaded: HashMap<&ContentHash, String> = HashMap::new();

        for (path, entry) in &inner.paths {
            let Some(blob) = inner.blobs.get(&entry.hash) else {
                continue;
            };
            let content = match (&blob.resident, &blob.spilled) {
                (Some(content), _) => content.to_string(),
                (None, Some(location)) => match loaded.get(&entry.hash) {
                    Some(content) => content.clone(),
                    None => {
                        let content = tokio::fs::read_to_string(location).await.map_err(
                            |source| StoreError::RehydrateFailed {
                                file: path.clone(),
                                location: location.clone(),
                                source,
                            },
                        )?;
                        loaded.insert(&entry.hash, content.clone());
                        content
                    }
                },
                (None, None) => continue,
            };
            files.insert(path.clone(), content);
        }

        Ok(CodeSnapshot { files })
    }

    /// Merge a snapshot produced by `owner` into this store. Paths whose
    /// content changes are reported along with their previous owners.
    pub async fn merge(
        &self,
        snapshot: &CodeSnapshot,
        owner: &str,
    ) -> Result<MergeReport, StoreError> {
        let mut report = MergeReport::default();

        for (path, content) in snapshot.files() {
            let (outcome, previous) = self.put_owned(path, content, Some(owner)).await?;
            match outcome {
                PutOutcome::Inserted => report.inserted.push(path.clone()),
                PutOutcome::Updated => {
                    report.updated.push(path.clone());
                    if let Some(previous) = previous
                        && previous != owner
                    {
                        tracing::warn!(
                            path = %path,
                            previous_owner = %previous,
                            owner,
                            "merge overwrote file owned by another feature"
                        );
                        report.displaced_owners.insert(previous);
                    }
                }
                PutOutcome::Unchanged => report.unchanged += 1,
            }
        }

        Ok(report)
    }

    /// Write every file under `dir`. Rejects absolute paths and paths that
    /// would escape `dir`. Returns the number of files written.
    pub async fn persist(&self, dir: &Path) -> Result<usize, StoreError> {
        let snapshot = self.snapshot().await?;

        if let Some(bad) = snapshot.paths().find(|p| !is_safe_relative_path(p)) {
            return Err(StoreError::UnsafePath(bad.to_string()));
        }

        for (path, content) in snapshot.files() {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::SnapshotFailed {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            tokio::fs::write(&target, content)
                .await
                .map_err(|source| StoreError::SnapshotFailed {
                    path: target.clone(),
                    source,
                })?;
        }

        tracing::info!(dir = %dir.display(), files = snapshot.len(), "persisted code snapshot");
        Ok(snapshot.len())
    }

    /// Remove every file, in memory and on disk.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let spilled: Vec<PathBuf> = inner
            .blobs
            .values()
            .filter_map(|b| b.spilled.clone())
            .collect();
        *inner = StoreInner::default();
        drop(inner);

        for location in spilled {
            match tokio::fs::remove_file(&location).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::SpillFailed {
                        file: location.display().to_string(),
                        location,
                        source,
                    });
                }
            }
            if let Some(parent) = location.parent() {
                // Only succeeds once the prefix directory is empty.
                tokio::fs::remove_dir(parent).await.ok();
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        let logical_bytes = inner
            .paths
            .values()
            .filter_map(|e| inner.blobs.get(&e.hash).map(|b| b.size))
            .sum();

        StoreStats {
            files: inner.paths.len(),
            unique_blobs: inner.blobs.len(),
            resident_bytes: inner.resident_bytes,
            spilled_blobs: inner.blobs.values().filter(|b| b.resident.is_none()).count(),
            logical_bytes,
            dedup_hits: inner.dedup_hits,
        }
    }
}
