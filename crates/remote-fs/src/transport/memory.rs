//! In-process transport backed by an in-memory tree.
//!
//! Behaves like a small SFTP server: `rename` refuses to replace, `rmdir`
//! refuses non-empty directories, and streamed writes only land when the
//! sink is shut down (the target is truncated when the sink is opened).
//! With [`MemoryTransport::with_write_through`] every accepted chunk lands
//! at its offset immediately instead, the way SFTP writes do.  Sinks accept
//! a bounded number of bytes per `poll_write` and stall every other call,
//! so writers see real backpressure.
//!
//! Test hooks: credential checks, unknown hosts (connection refused),
//! [`MemoryTransport::kill`] to drop live sessions, per-primitive call
//! counters, a log of refused `rmdir` calls,
//! [`MemoryTransport::vanish_after_list`] to make an entry disappear right
//! after its directory is listed, and [`MemoryTransport::hold_reads`] to
//! delay the reply to a whole-file read.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Semaphore, mpsc};

use super::{
    ChunkSink, ChunkSource, Connection, Credentials, DirEntry, FileKind, FileSession, FileStat,
    Transport, TransportEvent,
};
use crate::errors::{FsError, FsResult};
use crate::locator::{RemoteIdentity, parent_dir};

/// Bytes moved per `poll_read` / accepted per `poll_write`.
const DEFAULT_IO_CHUNK: usize = 64 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    File { data: Bytes, modified: SystemTime },
    Dir { modified: SystemTime },
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    vanish: HashMap<String, Vec<String>>,
    held_reads: HashMap<String, Arc<Semaphore>>,
    rejected_rmdirs: Vec<String>,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node::Dir {
                modified: SystemTime::now(),
            },
        );
        Self {
            nodes,
            vanish: HashMap::new(),
            held_reads: HashMap::new(),
            rejected_rmdirs: Vec::new(),
        }
    }
}

fn child_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{dir}/")
    }
}

impl Tree {
    fn children(&self, dir: &str) -> Vec<(String, FileKind)> {
        let prefix = child_prefix(dir);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| p.len() > prefix.len() && !p[prefix.len()..].contains('/'))
            .map(|(p, node)| {
                let kind = match node {
                    Node::File { .. } => FileKind::File,
                    Node::Dir { .. } => FileKind::Directory,
                };
                (p[prefix.len()..].to_string(), kind)
            })
            .collect()
    }

    fn require_parent_dir(&self, path: &str) -> FsResult<()> {
        let parent = parent_dir(path).unwrap_or("/");
        match self.nodes.get(parent) {
            Some(Node::Dir { .. }) => Ok(()),
            _ => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn put_file(&mut self, path: &str, data: Bytes) -> FsResult<()> {
        self.require_parent_dir(path)?;
        if let Some(Node::Dir { .. }) = self.nodes.get(path) {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        self.nodes.insert(
            path.to_string(),
            Node::File {
                data,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn mkdir_all(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.nodes
                .entry(current.clone())
                .or_insert_with(|| Node::Dir {
                    modified: SystemTime::now(),
                });
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct SessionLink {
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

struct Host {
    credentials: Credentials,
    tree: Mutex<Tree>,
    sessions: Mutex<Vec<SessionLink>>,
}

#[derive(Default)]
struct Shared {
    hosts: Mutex<HashMap<String, Arc<Host>>>,
    ops: Mutex<HashMap<&'static str, usize>>,
    connects: AtomicUsize,
}

impl Shared {
    fn count(&self, op: &'static str) {
        *lock(&self.ops).entry(op).or_insert(0) += 1;
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// An in-memory [`Transport`].  Clones share the same hosts and counters.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    io_chunk: usize,
    write_through: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            io_chunk: DEFAULT_IO_CHUNK,
            write_through: false,
        }
    }

    /// Bytes moved per read call / accepted per write call on streams.
    pub fn with_io_chunk(mut self, io_chunk: usize) -> Self {
        self.io_chunk = io_chunk.max(1);
        self
    }

    /// Land streamed chunks in the target as they are accepted.
    pub fn with_write_through(mut self) -> Self {
        self.write_through = true;
        self
    }

    /// Register a reachable host that accepts `credentials`.
    pub fn add_host(&self, identity: &RemoteIdentity, credentials: Credentials) {
        lock(&self.shared.hosts).insert(
            identity.key(),
            Arc::new(Host {
                credentials,
                tree: Mutex::new(Tree::default()),
                sessions: Mutex::new(Vec::new()),
            }),
        );
    }

    fn host(&self, identity: &RemoteIdentity) -> Option<Arc<Host>> {
        lock(&self.shared.hosts).get(&identity.key()).cloned()
    }

    /// Create a file (and any missing parent directories).
    pub fn seed_file(&self, identity: &RemoteIdentity, path: &str, data: impl Into<Bytes>) {
        if let Some(host) = self.host(identity) {
            let mut tree = lock(&host.tree);
            if let Some(parent) = parent_dir(path) {
                tree.mkdir_all(parent);
            }
            tree.nodes.insert(
                path.to_string(),
                Node::File {
                    data: data.into(),
                    modified: SystemTime::now(),
                },
            );
        }
    }

    /// Create a directory (and any missing parents).
    pub fn seed_dir(&self, identity: &RemoteIdentity, path: &str) {
        if let Some(host) = self.host(identity) {
            lock(&host.tree).mkdir_all(path);
        }
    }

    /// Raw contents of a remote file, bypassing any session.
    pub fn file(&self, identity: &RemoteIdentity, path: &str) -> Option<Bytes> {
        let host = self.host(identity)?;
        let tree = lock(&host.tree);
        match tree.nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, identity: &RemoteIdentity, path: &str) -> bool {
        self.host(identity)
            .map(|host| lock(&host.tree).nodes.contains_key(path))
            .unwrap_or(false)
    }

    /// Remove `child` from `dir` right after the next listing of `dir`.
    pub fn vanish_after_list(&self, identity: &RemoteIdentity, dir: &str, child: &str) {
        if let Some(host) = self.host(identity) {
            lock(&host.tree)
                .vanish
                .entry(dir.to_string())
                .or_default()
                .push(child.to_string());
        }
    }

    /// Make whole-file reads of `path` take their snapshot and then wait for
    /// a permit on the returned semaphore before replying.
    pub fn hold_reads(&self, identity: &RemoteIdentity, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        if let Some(host) = self.host(identity) {
            lock(&host.tree)
                .held_reads
                .insert(path.to_string(), Arc::clone(&gate));
        }
        gate
    }

    /// Directories whose removal was refused because they were not empty.
    pub fn rejected_rmdirs(&self, identity: &RemoteIdentity) -> Vec<String> {
        self.host(identity)
            .map(|host| lock(&host.tree).rejected_rmdirs.clone())
            .unwrap_or_default()
    }

    /// Drop every live session to `identity` as if the network went away.
    pub fn kill(&self, identity: &RemoteIdentity) {
        if let Some(host) = self.host(identity) {
            for link in lock(&host.sessions).drain(..) {
                link.alive.store(false, Ordering::SeqCst);
                let _ = link.events.send(TransportEvent::Error(FsError::NetworkFailure {
                    identity: identity.key(),
                    reason: "connection lost".to_string(),
                }));
            }
        }
    }

    /// How many times primitive `op` was called across all sessions.
    pub fn op_count(&self, op: &str) -> usize {
        lock(&self.shared.ops).get(op).copied().unwrap_or(0)
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        identity: &RemoteIdentity,
        credentials: &Credentials,
    ) -> FsResult<Connection> {
        let host = self.host(identity).ok_or_else(|| FsError::NetworkFailure {
            identity: identity.key(),
            reason: "connection refused".to_string(),
        })?;
        if host.credentials != *credentials {
            return Err(FsError::AuthenticationFailed {
                identity: identity.key(),
                reason: "permission denied (publickey)".to_string(),
            });
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Ready);
        lock(&host.sessions).push(SessionLink {
            alive: Arc::clone(&alive),
            events: tx.clone(),
        });
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Connection {
            session: Arc::new(MemorySession {
                identity: identity.key(),
                host,
                shared: Arc::clone(&self.shared),
                alive,
                events: tx,
                io_chunk: self.io_chunk,
                write_through: self.write_through,
            }),
            events: rx,
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySession
// ---------------------------------------------------------------------------

struct MemorySession {
    identity: String,
    host: Arc<Host>,
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    io_chunk: usize,
    write_through: bool,
}

impl MemorySession {
    fn enter(&self, op: &'static str) -> FsResult<MutexGuard<'_, Tree>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(FsError::NetworkFailure {
                identity: self.identity.clone(),
                reason: "connection lost".to_string(),
            });
        }
        self.shared.count(op);
        Ok(lock(&self.host.tree))
    }
}

#[async_trait]
impl FileSession for MemorySession {
    async fn stat(&self, path: &str) -> FsResult<FileStat> {
        let tree = self.enter("stat")?;
        match tree.nodes.get(path) {
            Some(Node::File { data, modified }) => Ok(FileStat {
                kind: FileKind::File,
                size: data.len() as u64,
                modified: *modified,
            }),
            Some(Node::Dir { modified }) => Ok(FileStat {
                kind: FileKind::Directory,
                size: 0,
                modified: *modified,
            }),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    async fn list(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let mut tree = self.enter("list")?;
        match tree.nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(FsError::Remote(format!("not a directory: {path}")));
            }
            None => return Err(FsError::NotFound(path.to_string())),
        }
        let entries = tree
            .children(path)
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect();

        if let Some(doomed) = tree.vanish.remove(path) {
            let prefix = child_prefix(path);
            for child in doomed {
                let full = format!("{prefix}{child}");
                let nested = format!("{full}/");
                tree.nodes
                    .retain(|p, _| *p != full && !p.starts_with(&nested));
            }
        }
        Ok(entries)
    }

    async fn read(&self, path: &str) -> FsResult<Bytes> {
        let (reply, gate) = {
            let tree = self.enter("read")?;
            let reply = match tree.nodes.get(path) {
                Some(Node::File { data, .. }) => Ok(data.clone()),
                Some(Node::Dir { .. }) => Err(FsError::IsADirectory(path.to_string())),
                None => Err(FsError::NotFound(path.to_string())),
            };
            (reply, tree.held_reads.get(path).cloned())
        };
        if let Some(gate) = gate {
            // A closed gate releases everyone.
            let _ = gate.acquire().await;
        }
        reply
    }

    async fn open_read(&self, path: &str) -> FsResult<ChunkSource> {
        let data = {
            let tree = self.enter("open_read")?;
            match tree.nodes.get(path) {
                Some(Node::File { data, .. }) => data.clone(),
                Some(Node::Dir { .. }) => return Err(FsError::IsADirectory(path.to_string())),
                None => return Err(FsError::NotFound(path.to_string())),
            }
        };
        Ok(Box::pin(MemorySource {
            data,
            pos: 0,
            io_chunk: self.io_chunk,
            alive: Arc::clone(&self.alive),
        }))
    }

    async fn write(&self, path: &str, data: Bytes) -> FsResult<()> {
        let mut tree = self.enter("write")?;
        tree.put_file(path, data)
    }

    async fn open_write(&self, path: &str) -> FsResult<ChunkSink> {
        {
            let mut tree = self.enter("open_write")?;
            tree.put_file(path, Bytes::new())?;
        }
        Ok(Box::pin(MemorySink {
            host: Arc::clone(&self.host),
            path: path.to_string(),
            buf: Vec::new(),
            offset: 0,
            write_through: self.write_through,
            io_chunk: self.io_chunk,
            stall: false,
            alive: Arc::clone(&self.alive),
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let mut tree = self.enter("rename")?;
        if !tree.nodes.contains_key(from) {
            return Err(FsError::NotFound(from.to_string()));
        }
        if tree.nodes.contains_key(to) {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        tree.require_parent_dir(to)?;

        let nested = format!("{from}/");
        let moved: Vec<(String, Node)> = tree
            .nodes
            .iter()
            .filter(|(p, _)| p.as_str() == from || p.starts_with(&nested))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();
        for (old, node) in moved {
            tree.nodes.remove(&old);
            let new = format!("{to}{}", &old[from.len()..]);
            tree.nodes.insert(new, node);
        }
        Ok(())
    }

    async fn replace(&self, from: &str, to: &str) -> FsResult<()> {
        let mut tree = self.enter("replace")?;
        let node = match tree.nodes.get(from) {
            Some(node @ Node::File { .. }) => node.clone(),
            Some(Node::Dir { .. }) => return Err(FsError::IsADirectory(from.to_string())),
            None => return Err(FsError::NotFound(from.to_string())),
        };
        if let Some(Node::Dir { .. }) = tree.nodes.get(to) {
            return Err(FsError::IsADirectory(to.to_string()));
        }
        tree.require_parent_dir(to)?;
        tree.nodes.remove(from);
        tree.nodes.insert(to.to_string(), node);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        let mut tree = self.enter("unlink")?;
        match tree.nodes.get(path) {
            Some(Node::File { .. }) => {
                tree.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(FsError::IsADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let mut tree = self.enter("rmdir")?;
        match tree.nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(FsError::Remote(format!("not a directory: {path}")));
            }
            None => return Err(FsError::NotFound(path.to_string())),
        }
        if !tree.children(path).is_empty() {
            tree.rejected_rmdirs.push(path.to_string());
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }
        tree.nodes.remove(path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        let mut tree = self.enter("mkdir")?;
        if tree.nodes.contains_key(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        tree.require_parent_dir(path)?;
        tree.nodes.insert(
            path.to_string(),
            Node::Dir {
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::End);
        }
    }

    fn description(&self) -> String {
        format!("memory:{}", self.identity)
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

fn connection_lost() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection lost")
}

struct MemorySource {
    data: Bytes,
    pos: usize,
    io_chunk: usize,
    alive: Arc<AtomicBool>,
}

impl AsyncRead for MemorySource {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.alive.load(Ordering::SeqCst) {
            return Poll::Ready(Err(connection_lost()));
        }
        let remaining = this.data.len() - this.pos;
        let n = remaining.min(buf.remaining()).min(this.io_chunk);
        buf.put_slice(&this.data[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

struct MemorySink {
    host: Arc<Host>,
    path: String,
    buf: Vec<u8>,
    /// Next write position in write-through mode.
    offset: usize,
    write_through: bool,
    io_chunk: usize,
    stall: bool,
    alive: Arc<AtomicBool>,
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.alive.load(Ordering::SeqCst) {
            return Poll::Ready(Err(connection_lost()));
        }
        if this.stall {
            this.stall = false;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        this.stall = true;
        let n = data.len().min(this.io_chunk);
        if !this.write_through {
            this.buf.extend_from_slice(&data[..n]);
            return Poll::Ready(Ok(n));
        }

        let mut tree = lock(&this.host.tree);
        let mut contents = match tree.nodes.get(&this.path) {
            Some(Node::File { data: existing, .. }) => existing.to_vec(),
            _ => Vec::new(),
        };
        let end = this.offset + n;
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[this.offset..end].copy_from_slice(&data[..n]);
        this.offset = end;
        let written = tree
            .put_file(&this.path, Bytes::from(contents))
            .map(|()| n)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()));
        Poll::Ready(written)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.alive.load(Ordering::SeqCst) {
            return Poll::Ready(Err(connection_lost()));
        }
        if this.write_through {
            return Poll::Ready(Ok(()));
        }
        let data = Bytes::from(std::mem::take(&mut this.buf));
        let mut tree = lock(&this.host.tree);
        let committed = tree
            .put_file(&this.path, data)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()));
        Poll::Ready(committed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn identity() -> RemoteIdentity {
        RemoteIdentity::new("myvm", 22, "admin")
    }

    async fn session(transport: &MemoryTransport) -> Arc<dyn FileSession> {
        transport
            .connect(&identity(), &Credentials::Agent)
            .await
            .unwrap()
            .session
    }

    #[tokio::test]
    async fn unknown_host_is_network_failure() {
        let transport = MemoryTransport::new();
        let err = transport
            .connect(&identity(), &Credentials::Agent)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FsError::NetworkFailure { .. }));
    }

    #[tokio::test]
    async fn wrong_credentials_are_rejected() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::KeyFile("/keys/good".into()));
        let err = transport
            .connect(&identity(), &Credentials::KeyFile("/keys/bad".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FsError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        transport.seed_file(&identity(), "/srv/a.txt", "a");
        transport.seed_file(&identity(), "/srv/sub/b.txt", "b");
        transport.seed_file(&identity(), "/srvx/c.txt", "c");

        let mut names: Vec<_> = session(&transport)
            .await
            .list("/srv")
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            names,
            vec![
                ("a.txt".to_string(), FileKind::File),
                ("sub".to_string(), FileKind::Directory)
            ]
        );
    }

    #[tokio::test]
    async fn rmdir_refuses_non_empty_directories() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        transport.seed_file(&identity(), "/srv/a.txt", "a");

        let err = session(&transport).await.rmdir("/srv").await.unwrap_err();
        assert!(matches!(err, FsError::DirectoryNotEmpty(_)));
        assert_eq!(transport.rejected_rmdirs(&identity()), vec!["/srv".to_string()]);
    }

    #[tokio::test]
    async fn rename_moves_subtrees_and_refuses_to_replace() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        transport.seed_file(&identity(), "/a/x/y.txt", "y");
        transport.seed_file(&identity(), "/taken", "t");
        let s = session(&transport).await;

        s.rename("/a", "/b").await.unwrap();
        assert_eq!(transport.file(&identity(), "/b/x/y.txt").unwrap(), "y");
        assert!(!transport.exists(&identity(), "/a/x"));
        assert!(matches!(
            s.rename("/b", "/taken").await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn streams_commit_on_shutdown() {
        let transport = MemoryTransport::new().with_io_chunk(3);
        transport.add_host(&identity(), Credentials::Agent);
        transport.seed_file(&identity(), "/f", "old contents");
        let s = session(&transport).await;

        let mut sink = s.open_write("/f").await.unwrap();
        sink.write_all(b"new contents").await.unwrap();
        assert_eq!(transport.file(&identity(), "/f").unwrap(), "");
        sink.shutdown().await.unwrap();
        assert_eq!(transport.file(&identity(), "/f").unwrap(), "new contents");

        let mut out = Vec::new();
        s.open_read("/f").await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"new contents");
    }

    #[tokio::test]
    async fn write_through_sinks_land_chunks_immediately() {
        let transport = MemoryTransport::new().with_io_chunk(4).with_write_through();
        transport.add_host(&identity(), Credentials::Agent);
        transport.seed_file(&identity(), "/f", "old contents");
        let s = session(&transport).await;

        let mut sink = s.open_write("/f").await.unwrap();
        sink.write_all(b"abcdefgh").await.unwrap();
        assert_eq!(transport.file(&identity(), "/f").unwrap(), "abcdefgh");
        sink.write_all(b"ij").await.unwrap();
        sink.shutdown().await.unwrap();
        assert_eq!(transport.file(&identity(), "/f").unwrap(), "abcdefghij");
    }

    #[tokio::test]
    async fn held_reads_reply_with_their_snapshot() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        transport.seed_file(&identity(), "/f", "before");
        let gate = transport.hold_reads(&identity(), "/f");
        let s = session(&transport).await;

        let reading = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.read("/f").await }
        });
        while transport.op_count("read") == 0 {
            tokio::task::yield_now().await;
        }
        s.write("/f", Bytes::from_static(b"after")).await.unwrap();
        assert!(!reading.is_finished());

        gate.add_permits(1);
        assert_eq!(reading.await.unwrap().unwrap(), "before");
        assert_eq!(transport.file(&identity(), "/f").unwrap(), "after");
    }

    #[tokio::test]
    async fn replace_overwrites_files_but_not_directories() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        transport.seed_file(&identity(), "/f.tmp", "new");
        transport.seed_file(&identity(), "/f", "old");
        transport.seed_dir(&identity(), "/d");
        let s = session(&transport).await;

        s.replace("/f.tmp", "/f").await.unwrap();
        assert_eq!(transport.file(&identity(), "/f").unwrap(), "new");
        assert!(!transport.exists(&identity(), "/f.tmp"));

        transport.seed_file(&identity(), "/g", "g");
        assert!(matches!(
            s.replace("/g", "/d").await,
            Err(FsError::IsADirectory(_))
        ));
        assert_eq!(transport.op_count("replace"), 2);
    }

    #[tokio::test]
    async fn killed_sessions_fail_and_emit_events() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        let mut conn = transport.connect(&identity(), &Credentials::Agent).await.unwrap();
        assert!(matches!(conn.events.recv().await, Some(TransportEvent::Ready)));

        transport.kill(&identity());
        assert!(matches!(
            conn.events.recv().await,
            Some(TransportEvent::Error(FsError::NetworkFailure { .. }))
        ));
        assert!(matches!(
            conn.session.stat("/").await,
            Err(FsError::NetworkFailure { .. })
        ));
    }
}
