//! Bounded, disk-backed content cache.
//!
//! Cached bytes live in files under the cache directory, named by the
//! fingerprint of the resource they came from.  The in-memory index tracks
//! size, age and recency for every entry:
//!
//! - entries older than the TTL are misses and are dropped lazily on lookup;
//! - an insert that would exceed the capacity first evicts entries in
//!   ascending last-access order until the new entry fits;
//! - backing-store failures never surface to callers: a failed read is a
//!   miss, a failed removal leaves a stray file behind.
//!
//! The index mutex is only held for bookkeeping, never across file I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::errors::FsResult;
use crate::locator::{RemoteIdentity, is_same_or_under};

/// Default capacity: 100 MiB.
pub const DEFAULT_CAPACITY: u64 = 100 * 1024 * 1024;

/// Default entry lifetime: one hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Stable cache key for a remote resource: SHA-256 over the identity key and
/// the remote path.
pub fn fingerprint(identity: &RemoteIdentity, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.key().as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: String,
    path: String,
    /// Backing file; unique per insert so a replaced entry never shares it.
    file: PathBuf,
    byte_size: u64,
    created: Instant,
    /// Logical access clock; larger means more recently used.
    last_access: u64,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    clock: u64,
    /// Bumped by every invalidation.
    epoch: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Index {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.total_bytes -= entry.byte_size;
        Some(entry)
    }

    /// Remove `fingerprint` only while it is still backed by `file`.
    fn remove_backed_by(&mut self, fingerprint: &str, file: &Path) -> bool {
        match self.entries.get(fingerprint) {
            Some(entry) if entry.file == file => self.remove(fingerprint).is_some(),
            _ => false,
        }
    }

    /// Fingerprint of the least recently accessed entry.
    fn coldest(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(fp, _)| fp.clone())
    }

    /// Remove every entry matching `doomed` and return their backing files.
    fn remove_where(&mut self, doomed: impl Fn(&CacheEntry) -> bool) -> Vec<PathBuf> {
        let fps: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| doomed(e))
            .map(|(fp, _)| fp.clone())
            .collect();
        fps.iter()
            .filter_map(|fp| self.remove(fp))
            .map(|e| e.file)
            .collect()
    }
}

enum Lookup {
    Missing,
    Expired(PathBuf),
    Live(PathBuf),
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

// ---------------------------------------------------------------------------
// ContentCache
// ---------------------------------------------------------------------------

/// The cache.
///
/// Readers that fetch from the remote race with writers that invalidate.
/// A reader takes [`ContentCache::epoch`] before fetching and stores the
/// result with [`ContentCache::put_if_unchanged`]; any invalidation in
/// between makes that store a no-op, so bytes fetched before a mutation
/// never land in the cache after it.
pub struct ContentCache {
    dir: PathBuf,
    capacity: u64,
    ttl: Duration,
    index: Mutex<Index>,
    file_seq: AtomicU64,
}

impl ContentCache {
    /// Create a cache backed by `dir` (created if missing).
    pub fn new(dir: impl Into<PathBuf>, capacity: u64, ttl: Duration) -> FsResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            capacity,
            ttl,
            index: Mutex::new(Index::default()),
            file_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current invalidation epoch.
    pub fn epoch(&self) -> u64 {
        self.index().epoch
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn backing_file(&self, fingerprint: &str) -> Option<PathBuf> {
        self.index().entries.get(fingerprint).map(|e| e.file.clone())
    }

    async fn remove_backing(&self, file: &Path) {
        if let Err(e) = tokio::fs::remove_file(file).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(file = %file.display(), error = %e, "cache: failed to remove backing file");
        }
    }

    async fn remove_all(&self, files: Vec<PathBuf>) {
        for file in files {
            self.remove_backing(&file).await;
        }
    }

    /// Look up `fingerprint`.  Expired or unreadable entries are misses and
    /// are dropped from the index.
    pub async fn get(&self, fingerprint: &str) -> Option<Bytes> {
        let lookup = {
            let mut index = self.index();
            let ttl = self.ttl;
            let tick = index.tick();
            let lookup = match index.entries.get_mut(fingerprint) {
                None => Lookup::Missing,
                Some(entry) if entry.created.elapsed() > ttl => Lookup::Expired(entry.file.clone()),
                Some(entry) => {
                    entry.last_access = tick;
                    Lookup::Live(entry.file.clone())
                }
            };
            match &lookup {
                Lookup::Missing => index.misses += 1,
                Lookup::Expired(_) => {
                    index.remove(fingerprint);
                    index.misses += 1;
                }
                Lookup::Live(_) => {}
            }
            lookup
        };

        let file = match lookup {
            Lookup::Missing => return None,
            Lookup::Expired(file) => {
                tracing::debug!(%fingerprint, "cache: entry expired");
                self.remove_backing(&file).await;
                return None;
            }
            Lookup::Live(file) => file,
        };

        match tokio::fs::read(&file).await {
            Ok(data) => {
                self.index().hits += 1;
                Some(Bytes::from(data))
            }
            Err(e) => {
                tracing::warn!(%fingerprint, error = %e, "cache: backing file unreadable, dropping entry");
                let mut index = self.index();
                index.remove_backed_by(fingerprint, &file);
                index.misses += 1;
                None
            }
        }
    }

    /// Store `data` under `fingerprint`, replacing any previous entry and
    /// evicting least recently used entries until it fits.
    ///
    /// Data larger than the whole capacity is not cached; any previous entry
    /// for the fingerprint is dropped instead.
    pub async fn put(&self, fingerprint: &str, identity: &RemoteIdentity, path: &str, data: &[u8]) {
        let epoch = self.epoch();
        self.put_if_unchanged(epoch, fingerprint, identity, path, data)
            .await;
    }

    /// Like [`put`](Self::put), but only if nothing was invalidated since
    /// `epoch` was taken.  Returns whether the entry was stored.
    pub async fn put_if_unchanged(
        &self,
        epoch: u64,
        fingerprint: &str,
        identity: &RemoteIdentity,
        path: &str,
        data: &[u8],
    ) -> bool {
        let size = data.len() as u64;
        if size > self.capacity {
            tracing::debug!(%fingerprint, bytes = size, "cache: entry exceeds capacity, not cached");
            let old = self.index().remove(fingerprint);
            if let Some(old) = old {
                self.remove_backing(&old.file).await;
            }
            return false;
        }

        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        let file = self.dir.join(format!("{fingerprint}.{seq}"));
        if let Err(e) = tokio::fs::write(&file, data).await {
            tracing::warn!(%fingerprint, error = %e, "cache: failed to store entry");
            self.remove_backing(&file).await;
            return false;
        }

        let victims = {
            let mut index = self.index();
            if index.epoch != epoch {
                None
            } else {
                let mut victims: Vec<PathBuf> =
                    index.remove(fingerprint).map(|old| old.file).into_iter().collect();
                while index.total_bytes + size > self.capacity {
                    let Some(coldest) = index.coldest() else {
                        break;
                    };
                    if let Some(evicted) = index.remove(&coldest) {
                        index.evictions += 1;
                        tracing::debug!(fingerprint = %coldest, "cache: evicted");
                        victims.push(evicted.file);
                    }
                }
                let tick = index.tick();
                index.entries.insert(
                    fingerprint.to_string(),
                    CacheEntry {
                        identity: identity.key(),
                        path: path.to_string(),
                        file: file.clone(),
                        byte_size: size,
                        created: Instant::now(),
                        last_access: tick,
                    },
                );
                index.total_bytes += size;
                Some(victims)
            }
        };

        match victims {
            Some(victims) => {
                self.remove_all(victims).await;
                true
            }
            None => {
                tracing::debug!(%fingerprint, "cache: invalidated while fetching, not cached");
                self.remove_backing(&file).await;
                false
            }
        }
    }

    /// Drop the entry for `fingerprint`, if any.
    pub async fn invalidate(&self, fingerprint: &str) {
        let removed = {
            let mut index = self.index();
            index.epoch += 1;
            index.remove(fingerprint)
        };
        if let Some(entry) = removed {
            self.remove_backing(&entry.file).await;
        }
    }

    /// Drop every entry of `identity` whose path is `path` or lies under it.
    pub async fn invalidate_under(&self, identity: &RemoteIdentity, path: &str) {
        let key = identity.key();
        let doomed = {
            let mut index = self.index();
            index.epoch += 1;
            index.remove_where(|e| e.identity == key && is_same_or_under(&e.path, path))
        };
        self.remove_all(doomed).await;
    }

    /// Drop entries that have outlived the TTL.
    pub async fn purge_expired(&self) {
        let ttl = self.ttl;
        let expired = self.index().remove_where(|e| e.created.elapsed() > ttl);
        self.remove_all(expired).await;
    }

    /// Drop every entry and any stray files left in the cache directory.
    pub async fn clear(&self) {
        {
            let mut index = self.index();
            index.epoch += 1;
            index.entries.clear();
            index.total_bytes = 0;
        }
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "cache: cannot list cache dir");
                return;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::warn!(file = %entry.path().display(), error = %e, "cache: failed to remove file");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.index();
        CacheStats {
            entries: index.entries.len(),
            bytes: index.total_bytes,
            capacity: self.capacity,
            hits: index.hits,
            misses: index.misses,
            evictions: index.evictions,
        }
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.index().entries.contains_key(fingerprint)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
