//! Remote filesystem bridge.
//!
//! [`RemoteFs`] implements the generic filesystem contract (stat, list,
//! read, write, delete, rename, mkdir) on top of the other components:
//!
//! - the [`ConnectionManager`] supplies a ready session per identity;
//! - the [`ContentCache`] short-circuits repeated reads and is invalidated
//!   by every mutation;
//! - the [`Compressor`] encodes written payloads according to the
//!   [`CompressionPolicy`] and decodes tagged payloads on read;
//! - large payloads go through the chunked [`Transfer`] paths.
//!
//! Every operation re-resolves its session.  A `NetworkFailure` surfacing
//! from an operation is reported to the manager, which drops the session so
//! the next call reconnects.
//!
//! Streamed uploads go to a unique sibling of the target and are moved over
//! it once complete, so concurrent writers never interleave inside one
//! file.  Compression work on large payloads runs on the blocking pool.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::cache::{ContentCache, fingerprint};
use crate::compression::{self, Algorithm, CompressionPolicy, Compressor, HEADER_MAGIC};
use crate::connection::{ConnectionManager, Session};
use crate::errors::{FsError, FsResult};
use crate::locator::{ResourceHandle, join_path};
use crate::streaming::{self, Transfer};
use crate::transport::{DirEntry, FileKind, FileStat};

/// Payloads at least this large are compressed off the async workers.
pub const BLOCKING_CODEC_THRESHOLD: usize = 256 * 1024;

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// A fresh sibling of `path` to stream an upload into.
fn staging_path(path: &str) -> String {
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{path}.rfs-tmp-{}-{seq}", std::process::id())
}

/// Run codec work on the blocking pool.
async fn offload<T, F>(work: F) -> FsResult<T>
where
    F: FnOnce() -> FsResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) => Err(FsError::Io(Arc::new(std::io::Error::other(e)))),
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tunables for [`RemoteFs`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeConfig {
    pub compression_threshold: usize,
    pub compression_policy: CompressionPolicy,
    pub chunk_size: usize,
    /// Payloads larger than this are transferred in chunks.
    pub large_file_threshold: u64,
    /// Fail a recursive delete when a child disappears mid-traversal.
    pub strict_recursive_delete: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            compression_threshold: compression::DEFAULT_THRESHOLD,
            compression_policy: CompressionPolicy::default(),
            chunk_size: streaming::DEFAULT_CHUNK_SIZE,
            large_file_threshold: crate::config::DEFAULT_LARGE_FILE_THRESHOLD,
            strict_recursive_delete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Create the file if it does not exist.
    pub create: bool,
    /// Replace the file if it exists.
    pub overwrite: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            create: true,
            overwrite: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenameOptions {
    pub overwrite: bool,
}

// ---------------------------------------------------------------------------
// RemoteFs
// ---------------------------------------------------------------------------

pub struct RemoteFs {
    manager: Arc<ConnectionManager>,
    cache: Arc<ContentCache>,
    compressor: Compressor,
    config: BridgeConfig,
}

impl RemoteFs {
    pub fn new(
        manager: Arc<ConnectionManager>,
        cache: Arc<ContentCache>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            manager,
            cache,
            compressor: Compressor::new(config.compression_threshold),
            config,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// A transfer with the configured chunk size, no progress and no
    /// cancellation.
    pub fn transfer(&self) -> Transfer<'static> {
        Transfer::new(self.config.chunk_size)
    }

    /// Report connection loss to the manager before handing the result back.
    async fn settle<T>(&self, session: &Arc<Session>, result: FsResult<T>) -> FsResult<T> {
        if let Err(e) = &result
            && e.is_connection_loss()
        {
            self.manager.mark_failed(session, e.clone()).await;
        }
        result
    }

    fn tolerates_missing(&self, err: &FsError) -> bool {
        !self.config.strict_recursive_delete && matches!(err, FsError::NotFound(_))
    }

    // -----------------------------------------------------------------------
    // stat / list
    // -----------------------------------------------------------------------

    pub async fn stat(&self, handle: &ResourceHandle) -> FsResult<FileStat> {
        let session = self.manager.acquire(&handle.identity).await?;
        debug!(identity = %handle.identity, path = %handle.path, "stat");
        let result = session.stat(&handle.path).await;
        self.settle(&session, result).await
    }

    /// Entries of a directory, in whatever order the remote returns them.
    pub async fn list(&self, handle: &ResourceHandle) -> FsResult<Vec<DirEntry>> {
        let session = self.manager.acquire(&handle.identity).await?;
        debug!(identity = %handle.identity, path = %handle.path, "list");
        let result = session.list(&handle.path).await.map(|entries| {
            entries
                .into_iter()
                .filter(|e| e.name != "." && e.name != "..")
                .collect()
        });
        self.settle(&session, result).await
    }

    // -----------------------------------------------------------------------
    // read
    // -----------------------------------------------------------------------

    pub async fn read(&self, handle: &ResourceHandle) -> FsResult<Bytes> {
        self.read_with(handle, &self.transfer()).await
    }

    /// Read a file, serving from the cache when possible.  `transfer`
    /// controls progress and cancellation if the file is streamed.
    pub async fn read_with(
        &self,
        handle: &ResourceHandle,
        transfer: &Transfer<'_>,
    ) -> FsResult<Bytes> {
        let fp = fingerprint(&handle.identity, &handle.path);
        if let Some(bytes) = self.cache.get(&fp).await {
            debug!(identity = %handle.identity, path = %handle.path, bytes = bytes.len(), "cache hit");
            return Ok(bytes);
        }

        let session = self.manager.acquire(&handle.identity).await?;
        // A mutation finishing while we fetch must win over what we fetched.
        let epoch = self.cache.epoch();
        let result = self.fetch(&session, handle, transfer).await;
        let plain = self.settle(&session, result).await?;

        self.cache
            .put_if_unchanged(epoch, &fp, &handle.identity, &handle.path, &plain)
            .await;
        Ok(plain)
    }

    async fn fetch(
        &self,
        session: &Session,
        handle: &ResourceHandle,
        transfer: &Transfer<'_>,
    ) -> FsResult<Bytes> {
        let path = handle.path.as_str();
        let stat = session.stat(path).await?;
        if stat.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        let raw = if stat.size > self.config.large_file_threshold {
            debug!(identity = %handle.identity, path, bytes = stat.size, "streaming read");
            let started = Instant::now();
            let mut source = session.open_read(path).await?;
            let data = transfer
                .read_streamed(&mut source)
                .await
                .map_err(|e| e.on_remote(&handle.identity.key()))?;
            session.record(data.len() as u64, started.elapsed());
            data
        } else {
            debug!(identity = %handle.identity, path, bytes = stat.size, "read");
            session.read(path).await?
        };

        if !raw.starts_with(&HEADER_MAGIC) {
            return Ok(raw);
        }
        if raw.len() < BLOCKING_CODEC_THRESHOLD {
            return Ok(Bytes::from(self.compressor.decode(&raw, None)?));
        }
        let compressor = self.compressor.clone();
        let plain = offload(move || compressor.decode(&raw, None)).await?;
        Ok(Bytes::from(plain))
    }

    // -----------------------------------------------------------------------
    // write
    // -----------------------------------------------------------------------

    pub async fn write(
        &self,
        handle: &ResourceHandle,
        data: Bytes,
        options: WriteOptions,
    ) -> FsResult<()> {
        self.write_with(handle, data, options, &self.transfer()).await
    }

    /// Write a file.  The create/overwrite constraints are checked before any
    /// bytes are sent.
    pub async fn write_with(
        &self,
        handle: &ResourceHandle,
        data: Bytes,
        options: WriteOptions,
        transfer: &Transfer<'_>,
    ) -> FsResult<()> {
        let fp = fingerprint(&handle.identity, &handle.path);
        let session = self.manager.acquire(&handle.identity).await?;
        let result = self.send(&session, handle, &data, options, transfer).await;
        // Whatever the remote holds now, the cached copy is stale.
        self.cache.invalidate(&fp).await;
        self.settle(&session, result).await
    }

    /// Check the create/overwrite constraints against the remote target.
    async fn check_target(
        &self,
        session: &Session,
        path: &str,
        options: WriteOptions,
    ) -> FsResult<()> {
        match session.stat(path).await {
            Ok(stat) if stat.is_dir() => Err(FsError::IsADirectory(path.to_string())),
            Ok(_) if !options.overwrite => Err(FsError::AlreadyExists(path.to_string())),
            Ok(_) => Ok(()),
            Err(FsError::NotFound(_)) if !options.create => Err(FsError::NotFound(path.to_string())),
            Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send(
        &self,
        session: &Session,
        handle: &ResourceHandle,
        data: &Bytes,
        options: WriteOptions,
        transfer: &Transfer<'_>,
    ) -> FsResult<()> {
        let path = handle.path.as_str();
        self.check_target(session, path, options).await?;

        let (algorithm, encoded) = self.encode(data).await?;
        if algorithm != Algorithm::None {
            debug!(
                path,
                %algorithm,
                plain = data.len(),
                encoded = encoded.len(),
                "compressed payload"
            );
        }

        if encoded.len() as u64 > self.config.large_file_threshold {
            let staged = staging_path(path);
            debug!(identity = %handle.identity, path, staged, bytes = encoded.len(), "streaming write");
            let started = Instant::now();
            let streamed = async {
                let mut sink = session.open_write(&staged).await?;
                transfer
                    .write_streamed(&mut sink, &encoded)
                    .await
                    .map_err(|e| e.on_remote(&handle.identity.key()))
            }
            .await;
            self.commit_staged(session, &staged, path, streamed).await?;
            session.record(encoded.len() as u64, started.elapsed());
            Ok(())
        } else {
            debug!(identity = %handle.identity, path, bytes = encoded.len(), "write");
            session.write(path, encoded).await
        }
    }

    /// Pick an algorithm per the policy and encode `data` with it.
    async fn encode(&self, data: &Bytes) -> FsResult<(Algorithm, Bytes)> {
        let compressor = self.compressor.clone();
        let policy = self.config.compression_policy;
        let large = data.len() >= BLOCKING_CODEC_THRESHOLD;
        let data = data.clone();
        let work = move || -> FsResult<(Algorithm, Bytes)> {
            let algorithm = policy.choose(&compressor, &data);
            let encoded = compressor.encode(&data, Some(algorithm))?;
            Ok((algorithm, Bytes::from(encoded)))
        };
        if large {
            offload(work).await
        } else {
            work()
        }
    }

    /// Move a fully streamed sibling over `path`, or clean it up if the
    /// stream failed.
    async fn commit_staged<T>(
        &self,
        session: &Session,
        staged: &str,
        path: &str,
        streamed: FsResult<T>,
    ) -> FsResult<T> {
        let committed = match streamed {
            Ok(value) => session.replace(staged, path).await.map(|()| value),
            Err(e) => Err(e),
        };
        if committed.is_err()
            && let Err(e) = session.unlink(staged).await
            && !matches!(e, FsError::NotFound(_))
        {
            warn!(path = %staged, error = %e, "failed to remove staged upload");
        }
        committed
    }

    // -----------------------------------------------------------------------
    // delete
    // -----------------------------------------------------------------------

    pub async fn delete(&self, handle: &ResourceHandle, options: DeleteOptions) -> FsResult<()> {
        if handle.path == "/" {
            return Err(FsError::PermissionDenied("/".to_string()));
        }
        let session = self.manager.acquire(&handle.identity).await?;
        let result = self.remove(&session, &handle.path, options).await;
        self.cache
            .invalidate_under(&handle.identity, &handle.path)
            .await;
        self.settle(&session, result).await
    }

    async fn remove(&self, session: &Session, path: &str, options: DeleteOptions) -> FsResult<()> {
        let stat = session.stat(path).await?;
        match stat.kind {
            FileKind::File => session.unlink(path).await,
            FileKind::Directory if !options.recursive => session.rmdir(path).await,
            FileKind::Directory => self.remove_tree(session, path.to_string()).await,
        }
    }

    /// Post-order removal: subdirectories first, then files, then the
    /// directory itself, so `rmdir` only ever sees an empty directory.
    fn remove_tree<'a>(&'a self, session: &'a Session, dir: String) -> BoxFuture<'a, FsResult<()>> {
        async move {
            let entries = match session.list(&dir).await {
                Ok(entries) => entries,
                Err(e) if self.tolerates_missing(&e) => return Ok(()),
                Err(e) => return Err(e),
            };
            let (dirs, files): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .filter(|e| e.name != "." && e.name != "..")
                .partition(|e| e.kind == FileKind::Directory);

            for entry in dirs {
                self.remove_tree(session, join_path(&dir, &entry.name))
                    .await?;
            }
            for entry in files {
                let child = join_path(&dir, &entry.name);
                match session.unlink(&child).await {
                    Ok(()) => {}
                    Err(e) if self.tolerates_missing(&e) => {
                        debug!(path = %child, "already gone");
                    }
                    Err(e) => return Err(e),
                }
            }
            match session.rmdir(&dir).await {
                Err(e) if self.tolerates_missing(&e) => Ok(()),
                other => other,
            }
        }
        .boxed()
    }

    // -----------------------------------------------------------------------
    // rename / mkdir
    // -----------------------------------------------------------------------

    pub async fn rename(
        &self,
        from: &ResourceHandle,
        to: &ResourceHandle,
        options: RenameOptions,
    ) -> FsResult<()> {
        if from.identity != to.identity {
            return Err(FsError::InvalidLocator(format!(
                "cannot rename across endpoints: {from} -> {to}"
            )));
        }
        let session = self.manager.acquire(&from.identity).await?;
        let result = self.move_path(&session, &from.path, &to.path, options).await;
        self.cache.invalidate_under(&from.identity, &from.path).await;
        self.cache.invalidate_under(&to.identity, &to.path).await;
        self.settle(&session, result).await
    }

    async fn move_path(
        &self,
        session: &Session,
        from: &str,
        to: &str,
        options: RenameOptions,
    ) -> FsResult<()> {
        session.stat(from).await?;
        if from == to {
            return Ok(());
        }
        match session.stat(to).await {
            Ok(_) if !options.overwrite => return Err(FsError::AlreadyExists(to.to_string())),
            Ok(target) if target.is_dir() => session.rmdir(to).await?,
            Ok(_) => session.unlink(to).await?,
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!(from, to, "rename");
        session.rename(from, to).await
    }

    pub async fn mkdir(&self, handle: &ResourceHandle) -> FsResult<()> {
        let session = self.manager.acquire(&handle.identity).await?;
        let path = handle.path.as_str();
        let result = match session.mkdir(path).await {
            // SFTP v3 servers report an existing target as a generic failure.
            Err(FsError::Remote(msg)) => match session.stat(path).await {
                Ok(_) => Err(FsError::AlreadyExists(path.to_string())),
                Err(_) => Err(FsError::Remote(msg)),
            },
            other => other,
        };
        self.settle(&session, result).await
    }

    // -----------------------------------------------------------------------
    // Local files
    // -----------------------------------------------------------------------

    /// Stream a remote file into `local`, bypassing cache and compression.
    /// Returns the number of bytes copied.
    pub async fn read_to(
        &self,
        handle: &ResourceHandle,
        local: &Path,
        transfer: &Transfer<'_>,
    ) -> FsResult<u64> {
        let session = self.manager.acquire(&handle.identity).await?;
        let result = async {
            let stat = session.stat(&handle.path).await?;
            if stat.is_dir() {
                return Err(FsError::IsADirectory(handle.path.clone()));
            }
            let started = Instant::now();
            let mut source = session.open_read(&handle.path).await?;
            let mut file = tokio::fs::File::create(local).await?;
            let copied = transfer
                .copy_streamed(&mut source, &mut file)
                .await
                .map_err(|e| e.on_remote(&handle.identity.key()))?;
            session.record(copied, started.elapsed());
            Ok(copied)
        }
        .await;
        self.settle(&session, result).await
    }

    /// Stream `local` into a remote file, bypassing compression.  Returns
    /// the number of bytes copied.
    pub async fn write_from(
        &self,
        handle: &ResourceHandle,
        local: &Path,
        options: WriteOptions,
        transfer: &Transfer<'_>,
    ) -> FsResult<u64> {
        let mut file = tokio::fs::File::open(local).await?;
        let session = self.manager.acquire(&handle.identity).await?;
        let result = async {
            self.check_target(&session, &handle.path, options).await?;
            let staged = staging_path(&handle.path);
            let started = Instant::now();
            let streamed = async {
                let mut sink = session.open_write(&staged).await?;
                transfer
                    .copy_streamed(&mut file, &mut sink)
                    .await
                    .map_err(|e| e.on_remote(&handle.identity.key()))
            }
            .await;
            let copied = self
                .commit_staged(&session, &staged, &handle.path, streamed)
                .await?;
            session.record(copied, started.elapsed());
            Ok(copied)
        }
        .await;
        self.cache
            .invalidate(&fingerprint(&handle.identity, &handle.path))
            .await;
        if let Err(e) = &result {
            warn!(path = %handle.path, error = %e, "upload failed");
        }
        self.settle(&session, result).await
    }
}
