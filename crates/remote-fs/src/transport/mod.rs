//! Transport traits.
//!
//! A [`Transport`] opens authenticated channels to a [`RemoteIdentity`]; each
//! channel is a [`FileSession`] exposing the file-subprotocol primitives the
//! bridge composes.  The callback/event style of the underlying protocol is
//! hidden behind one awaitable method per primitive, plus an event channel
//! for lifecycle notifications (ready, error, end).
//!
//! Two implementations ship with the crate: [`sftp::SftpTransport`] (system
//! OpenSSH + the SFTP subsystem) and [`memory::MemoryTransport`] (an
//! in-process filesystem used by tests and demos).

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::errors::{FsError, FsResult};
use crate::locator::RemoteIdentity;

pub mod memory;
pub mod sftp;

// ---------------------------------------------------------------------------
// Types returned by session operations
// ---------------------------------------------------------------------------

/// The kind of a remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    File,
    Directory,
}

/// Metadata for a remote path returned by [`FileSession::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// A single entry returned by [`FileSession::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// How to authenticate a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// Whatever the SSH agent / `~/.ssh/config` offers.
    #[default]
    Agent,
    /// A specific private key file.
    KeyFile(PathBuf),
}

/// Lifecycle notifications emitted by a live channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Ready,
    Error(FsError),
    End,
}

/// A byte stream read from the remote in chunks.
pub type ChunkSource = Pin<Box<dyn AsyncRead + Send>>;

/// A byte sink written to the remote in chunks.  `poll_write` returning
/// `Pending` is the remote's backpressure; `shutdown` commits the file.
pub type ChunkSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A freshly connected channel: the session plus its lifecycle events.
pub struct Connection {
    pub session: Arc<dyn FileSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Opens authenticated channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate.  Failures should be
    /// [`FsError::AuthenticationFailed`] or [`FsError::NetworkFailure`].
    async fn connect(
        &self,
        identity: &RemoteIdentity,
        credentials: &Credentials,
    ) -> FsResult<Connection>;
}

/// The file-subprotocol primitives of one live channel, keyed by absolute
/// remote path strings.
#[async_trait]
pub trait FileSession: Send + Sync {
    async fn stat(&self, path: &str) -> FsResult<FileStat>;

    /// List a directory.  Order is whatever the remote returns.
    async fn list(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// Read an entire file in one round trip.
    async fn read(&self, path: &str) -> FsResult<Bytes>;

    /// Open a file for chunked reading.
    async fn open_read(&self, path: &str) -> FsResult<ChunkSource>;

    /// Write `data` to a file, creating or truncating it, in one round trip.
    async fn write(&self, path: &str, data: Bytes) -> FsResult<()>;

    /// Open a file for chunked writing, creating or truncating it.
    async fn open_write(&self, path: &str) -> FsResult<ChunkSink>;

    /// Rename; fails if `to` already exists.
    async fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// Move file `from` over `to`, replacing `to` if it exists.  Readers of
    /// `to` see either its old contents or all of `from`, never a mix.
    async fn replace(&self, from: &str, to: &str) -> FsResult<()>;

    /// Remove a file.
    async fn unlink(&self, path: &str) -> FsResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &str) -> FsResult<()>;

    async fn mkdir(&self, path: &str) -> FsResult<()>;

    /// Release the underlying channel.  Idempotent.
    async fn close(&self);

    /// A human-readable description of this channel, for diagnostics.
    fn description(&self) -> String;
}
