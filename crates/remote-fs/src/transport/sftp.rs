//! SFTP transport.
//!
//! Uses the [`openssh`] crate (which shells out to the system's OpenSSH
//! binary) for session management and [`openssh_sftp_client`] for the SFTP
//! subsystem.  Every [`FileSession`] primitive maps onto one SFTP request.
//!
//! This gives us:
//!
//! - Full `~/.ssh/config` support
//! - SSH agent authentication
//! - `ControlMaster` multiplexing
//! - Binary-safe transfers with no shell quoting
//!
//! A keepalive task checks the master connection with [`Session::check`] and
//! reports a dead link on the channel's event stream, so the connection
//! manager can mark the session disconnected without waiting for the next
//! failing operation.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use openssh::{KnownHosts, Session, SessionBuilder};
use openssh_sftp_client::file::TokioCompatFile;
use openssh_sftp_client::{Sftp, SftpOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ChunkSink, ChunkSource, Connection, Credentials, DirEntry, FileKind, FileSession, FileStat,
    Transport, TransportEvent,
};
use crate::errors::{FsError, FsResult};
use crate::locator::RemoteIdentity;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Connects through the system `ssh` binary and opens the SFTP subsystem.
#[derive(Debug, Clone)]
pub struct SftpTransport {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl SftpTransport {
    pub fn new(connect_timeout: Duration, keepalive: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive,
        }
    }
}

impl Default for SftpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(15))
    }
}

/// Connect failures are either authentication or network problems.
fn connect_error(identity: &RemoteIdentity, err: impl std::fmt::Display) -> FsError {
    let key = identity.key();
    match FsError::from_transport(&key, "", &err) {
        e @ FsError::AuthenticationFailed { .. } => e,
        _ => FsError::NetworkFailure {
            identity: key,
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl Transport for SftpTransport {
    async fn connect(
        &self,
        identity: &RemoteIdentity,
        credentials: &Credentials,
    ) -> FsResult<Connection> {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Accept)
            .user(identity.username().to_string())
            .port(identity.port())
            .connect_timeout(self.connect_timeout)
            .server_alive_interval(self.keepalive);
        if let Credentials::KeyFile(path) = credentials {
            builder.keyfile(path);
        }

        debug!(identity = %identity, "opening ssh session");
        let session = builder
            .connect(identity.host())
            .await
            .map_err(|e| connect_error(identity, e))?;
        let session = Arc::new(session);

        let sftp = Sftp::from_clonable_session(Arc::clone(&session), SftpOptions::default())
            .await
            .map_err(|e| connect_error(identity, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Ready);

        let shutdown = CancellationToken::new();
        tokio::spawn(keepalive(
            Arc::clone(&session),
            identity.key(),
            self.keepalive,
            tx,
            shutdown.clone(),
        ));

        Ok(Connection {
            session: Arc::new(SftpSession {
                identity: identity.key(),
                session,
                sftp,
                closed: AtomicBool::new(false),
                shutdown,
            }),
            events: rx,
        })
    }
}

/// Probe the master connection until it dies or the session is closed.
async fn keepalive(
    session: Arc<Session>,
    identity: String,
    interval: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = events.send(TransportEvent::End);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = session.check().await {
            warn!(identity = %identity, error = %e, "ssh keepalive failed");
            let _ = events.send(TransportEvent::Error(FsError::NetworkFailure {
                identity,
                reason: e.to_string(),
            }));
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SftpSession {
    identity: String,
    /// Kept alive for the lifetime of the SFTP channel.
    #[allow(dead_code)]
    session: Arc<Session>,
    sftp: Sftp,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl SftpSession {
    fn ensure_open(&self) -> FsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(FsError::NotConnected(self.identity.clone()))
        } else {
            Ok(())
        }
    }

    fn classify(&self, path: &str, err: openssh_sftp_client::Error) -> FsError {
        FsError::from_transport(&self.identity, path, err)
    }
}

/// SFTP v3 has no "file exists" status; servers answer `SSH_FX_FAILURE`.
fn is_generic_failure(err: &FsError) -> bool {
    matches!(err, FsError::Remote(msg) if msg.to_ascii_lowercase().contains("failure"))
}

/// A generic rename failure means an occupied target only when the target
/// is known to exist; anything else (missing parent, cross-device) stays as
/// reported.
fn rename_error(err: FsError, to: &str, target_exists: bool) -> FsError {
    if target_exists && is_generic_failure(&err) {
        FsError::AlreadyExists(to.to_string())
    } else {
        err
    }
}

fn kind_of(file_type: Option<openssh_sftp_client::metadata::FileType>) -> FileKind {
    match file_type {
        Some(t) if t.is_dir() => FileKind::Directory,
        _ => FileKind::File,
    }
}

#[async_trait]
impl FileSession for SftpSession {
    async fn stat(&self, path: &str) -> FsResult<FileStat> {
        self.ensure_open()?;
        let meta = self
            .sftp
            .fs()
            .metadata(path)
            .await
            .map_err(|e| self.classify(path, e))?;
        let missing = |field: &str| FsError::MalformedResponse(format!("stat {path}: no {field}"));
        let kind = meta
            .file_type()
            .map(|t| kind_of(Some(t)))
            .ok_or_else(|| missing("file type"))?;
        let size = match (kind, meta.len()) {
            (_, Some(len)) => len,
            (FileKind::Directory, None) => 0,
            (FileKind::File, None) => return Err(missing("size")),
        };
        let modified = meta
            .modified()
            .map(|t| t.as_system_time())
            .ok_or_else(|| missing("modification time"))?;
        Ok(FileStat {
            kind,
            size,
            modified,
        })
    }

    async fn list(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        self.ensure_open()?;
        let dir = self
            .sftp
            .fs()
            .open_dir(path)
            .await
            .map_err(|e| self.classify(path, e))?;

        let mut stream = pin!(dir.read_dir());
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            let entry = entry.map_err(|e| self.classify(path, e))?;
            let name = entry.filename().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            entries.push(DirEntry {
                name,
                kind: kind_of(entry.file_type()),
            });
        }
        Ok(entries)
    }

    async fn read(&self, path: &str) -> FsResult<Bytes> {
        self.ensure_open()?;
        let data = self
            .sftp
            .fs()
            .read(path)
            .await
            .map_err(|e| self.classify(path, e))?;
        Ok(data.freeze())
    }

    async fn open_read(&self, path: &str) -> FsResult<ChunkSource> {
        self.ensure_open()?;
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| self.classify(path, e))?;
        Ok(Box::pin(TokioCompatFile::from(file)))
    }

    async fn write(&self, path: &str, data: Bytes) -> FsResult<()> {
        self.ensure_open()?;
        self.sftp
            .fs()
            .write(path, &data[..])
            .await
            .map_err(|e| self.classify(path, e))
    }

    async fn open_write(&self, path: &str) -> FsResult<ChunkSink> {
        self.ensure_open()?;
        let file = self
            .sftp
            .options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| self.classify(path, e))?;
        Ok(Box::pin(TokioCompatFile::from(file)))
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.ensure_open()?;
        let err = match self.sftp.fs().rename(from, to).await {
            Ok(()) => return Ok(()),
            Err(e) => self.classify(from, e),
        };
        let target_exists = is_generic_failure(&err) && self.sftp.fs().metadata(to).await.is_ok();
        Err(rename_error(err, to, target_exists))
    }

    async fn replace(&self, from: &str, to: &str) -> FsResult<()> {
        self.ensure_open()?;
        // Without posix-rename the server refuses to rename onto an existing
        // file, so the old target has to go first.
        if !self.sftp.support_posix_rename() {
            match self
                .sftp
                .fs()
                .remove_file(to)
                .await
                .map_err(|e| self.classify(to, e))
            {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.sftp
            .fs()
            .rename(from, to)
            .await
            .map_err(|e| self.classify(from, e))
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        self.ensure_open()?;
        self.sftp
            .fs()
            .remove_file(path)
            .await
            .map_err(|e| self.classify(path, e))
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        self.ensure_open()?;
        self.sftp
            .fs()
            .remove_dir(path)
            .await
            .map_err(|e| self.classify(path, e))
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        self.ensure_open()?;
        self.sftp
            .fs()
            .create_dir(path)
            .await
            .map_err(|e| self.classify(path, e))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(identity = %self.identity, "closing sftp session");
            self.shutdown.cancel();
        }
    }

    fn description(&self) -> String {
        format!("ssh+sftp:{}", self.identity)
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        // `Sftp::close` and `Session::close` consume their receivers and are
        // async; dropping them tears down the subsystem and the ControlMaster.
        self.shutdown.cancel();
    }
}
