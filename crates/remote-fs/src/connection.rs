//! Connection manager: one session per remote identity.
//!
//! Sessions are pooled by the normalized identity key.  [`ConnectionManager::acquire`]
//! reuses a ready pooled session or connects a fresh one; every pooled
//! session has a watcher task that listens to the transport's lifecycle
//! events and drops the session from the pool when the channel ends or
//! errors.  Dead sessions fail fast with [`FsError::NotConnected`].
//!
//! Lifecycle changes are published on a broadcast channel
//! ([`ConnectionManager::subscribe`]) so an outer reconnect policy can react
//! to drops and failed connects.
//!
//! The pool mutex is never held across an `.await`; after a connect
//! completes the pool is re-checked before the new session is inserted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::errors::{FsError, FsResult};
use crate::locator::RemoteIdentity;
use crate::transport::{
    ChunkSink, ChunkSource, Credentials, DirEntry, FileSession, FileStat, Transport,
    TransportEvent,
};

/// Capacity of the lifecycle notification channel.
const EVENT_CAPACITY: usize = 64;

/// Weight of the newest sample in the rolling transfer rate.
const RATE_SMOOTHING: f64 = 0.2;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
        }
    }
}

/// Accumulated usage counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    pub operations: u64,
    pub bytes_transferred: u64,
    /// Exponentially smoothed bytes per second over recent transfers.
    pub transfer_rate: f64,
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    last_error: Option<FsError>,
    stats: SessionStats,
}

/// A live, authenticated channel bound to one [`RemoteIdentity`].
///
/// Owned by the [`ConnectionManager`]; callers hold an `Arc<Session>` only
/// for the duration of an operation.
pub struct Session {
    identity: RemoteIdentity,
    created_at: SystemTime,
    channel: Arc<dyn FileSession>,
    status: Mutex<Status>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("created_at", &self.created_at)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn connecting(identity: RemoteIdentity, channel: Arc<dyn FileSession>) -> Self {
        Self {
            identity,
            created_at: SystemTime::now(),
            channel,
            status: Mutex::new(Status {
                state: SessionState::Connecting,
                last_error: None,
                stats: SessionStats::default(),
            }),
        }
    }

    pub fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        lock(&self.status).state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn last_error(&self) -> Option<FsError> {
        lock(&self.status).last_error.clone()
    }

    pub fn stats(&self) -> SessionStats {
        lock(&self.status).stats
    }

    pub fn description(&self) -> String {
        self.channel.description()
    }

    fn set_ready(&self) {
        lock(&self.status).state = SessionState::Ready;
    }

    /// Move to `Disconnected`.  Returns `false` if it already was.
    fn set_disconnected(&self, error: Option<FsError>) -> bool {
        let mut status = lock(&self.status);
        if status.state == SessionState::Disconnected {
            return false;
        }
        status.state = SessionState::Disconnected;
        if error.is_some() {
            status.last_error = error;
        }
        true
    }

    /// The underlying channel, or `NotConnected` if the session is dead.
    fn channel(&self) -> FsResult<&Arc<dyn FileSession>> {
        if self.is_ready() {
            Ok(&self.channel)
        } else {
            Err(FsError::NotConnected(self.identity.key()))
        }
    }

    /// Count one operation moving `bytes` bytes in `elapsed`.
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let mut status = lock(&self.status);
        let stats = &mut status.stats;
        stats.operations += 1;
        stats.bytes_transferred += bytes;
        let secs = elapsed.as_secs_f64();
        if bytes > 0 && secs > 0.0 {
            let sample = bytes as f64 / secs;
            stats.transfer_rate = if stats.transfer_rate == 0.0 {
                sample
            } else {
                RATE_SMOOTHING * sample + (1.0 - RATE_SMOOTHING) * stats.transfer_rate
            };
        }
    }

    // -- operations ----------------------------------------------------------

    pub async fn stat(&self, path: &str) -> FsResult<FileStat> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.stat(path).await;
        self.record(0, started.elapsed());
        result
    }

    pub async fn list(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.list(path).await;
        self.record(0, started.elapsed());
        result
    }

    pub async fn read(&self, path: &str) -> FsResult<Bytes> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.read(path).await;
        let bytes = result.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        self.record(bytes, started.elapsed());
        result
    }

    /// Open a chunked reader.  The caller records the transferred bytes.
    pub async fn open_read(&self, path: &str) -> FsResult<ChunkSource> {
        self.channel()?.open_read(path).await
    }

    pub async fn write(&self, path: &str, data: Bytes) -> FsResult<()> {
        let channel = self.channel()?;
        let started = Instant::now();
        let bytes = data.len() as u64;
        let result = channel.write(path, data).await;
        self.record(if result.is_ok() { bytes } else { 0 }, started.elapsed());
        result
    }

    /// Open a chunked writer.  The caller records the transferred bytes.
    pub async fn open_write(&self, path: &str) -> FsResult<ChunkSink> {
        self.channel()?.open_write(path).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.rename(from, to).await;
        self.record(0, started.elapsed());
        result
    }

    pub async fn replace(&self, from: &str, to: &str) -> FsResult<()> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.replace(from, to).await;
        self.record(0, started.elapsed());
        result
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.unlink(path).await;
        self.record(0, started.elapsed());
        result
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.rmdir(path).await;
        self.record(0, started.elapsed());
        result
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<()> {
        let channel = self.channel()?;
        let started = Instant::now();
        let result = channel.mkdir(path).await;
        self.record(0, started.elapsed());
        result
    }
}

/// A point-in-time snapshot of a pooled session, for display.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub identity: RemoteIdentity,
    pub state: SessionState,
    pub created_at: SystemTime,
    pub last_error: Option<FsError>,
    pub stats: SessionStats,
    pub description: String,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        let status = lock(&session.status);
        Self {
            identity: session.identity.clone(),
            state: status.state,
            created_at: session.created_at,
            last_error: status.last_error.clone(),
            stats: status.stats,
            description: session.channel.description(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        identity: RemoteIdentity,
    },
    /// A session ended or a connect attempt failed.  `error` is `None` for
    /// an orderly release.
    Disconnected {
        identity: RemoteIdentity,
        error: Option<FsError>,
    },
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type Pool = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// A connect attempt that has not returned yet.
struct Pending {
    id: u64,
    identity: RemoteIdentity,
    started: SystemTime,
}

/// Removes its attempt from the pending list when the connect finishes,
/// fails or is abandoned.
struct PendingGuard<'a> {
    pending: &'a Mutex<Vec<Pending>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).retain(|p| p.id != self.id);
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    pool: Pool,
    credentials: Mutex<HashMap<String, Credentials>>,
    default_credentials: Credentials,
    current: Mutex<Option<RemoteIdentity>>,
    last: Mutex<Option<RemoteIdentity>>,
    pending: Mutex<Vec<Pending>>,
    pending_seq: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            pool: Arc::new(Mutex::new(HashMap::new())),
            credentials: Mutex::new(HashMap::new()),
            default_credentials: Credentials::default(),
            current: Mutex::new(None),
            last: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            pending_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Credentials used for identities without registered ones.
    pub fn with_default_credentials(mut self, credentials: Credentials) -> Self {
        self.default_credentials = credentials;
        self
    }

    /// Register the credentials used when connecting to `identity`.
    pub fn set_credentials(&self, identity: &RemoteIdentity, credentials: Credentials) {
        lock(&self.credentials).insert(identity.key(), credentials);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Identity of the most recently used ready session.
    pub fn current(&self) -> Option<RemoteIdentity> {
        lock(&self.current).clone()
    }

    /// Identity of the most recent `acquire` attempt, successful or not.
    pub fn last(&self) -> Option<RemoteIdentity> {
        lock(&self.last).clone()
    }

    /// Snapshots of every pooled session, plus identities with a connect in
    /// flight and nothing pooled yet (state [`SessionState::Connecting`]).
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = lock(&self.pool)
            .values()
            .map(|s| SessionInfo::from(s.as_ref()))
            .collect();
        for pending in lock(&self.pending).iter() {
            let key = pending.identity.key();
            if infos.iter().any(|i| i.identity.key() == key) {
                continue;
            }
            infos.push(SessionInfo {
                identity: pending.identity.clone(),
                state: SessionState::Connecting,
                created_at: pending.started,
                last_error: None,
                stats: SessionStats::default(),
                description: format!("connecting to {}", pending.identity),
            });
        }
        infos.sort_by_key(|i| i.identity.key());
        infos
    }

    fn begin_connect(&self, identity: &RemoteIdentity) -> PendingGuard<'_> {
        let id = self.pending_seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).push(Pending {
            id,
            identity: identity.clone(),
            started: SystemTime::now(),
        });
        PendingGuard {
            pending: &self.pending,
            id,
        }
    }

    /// Return a ready session for `identity`, connecting if necessary.
    pub async fn acquire(&self, identity: &RemoteIdentity) -> FsResult<Arc<Session>> {
        let key = identity.key();
        *lock(&self.last) = Some(identity.clone());

        if let Some(session) = self.pooled(&key) {
            *lock(&self.current) = Some(identity.clone());
            return Ok(session);
        }

        let credentials = lock(&self.credentials)
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.default_credentials.clone());

        info!(identity = %identity, "connecting");
        let attempt = self.begin_connect(identity);
        let connected = self.transport.connect(identity, &credentials).await;
        drop(attempt);
        let connection = match connected {
            Ok(c) => c,
            Err(e) => {
                let err = match e {
                    e @ (FsError::AuthenticationFailed { .. } | FsError::NetworkFailure { .. }) => e,
                    other => FsError::NetworkFailure {
                        identity: key.clone(),
                        reason: other.to_string(),
                    },
                };
                warn!(identity = %identity, error = %err, "connect failed");
                lock(&self.pool).remove(&key);
                let _ = self.events.send(ConnectionEvent::Disconnected {
                    identity: identity.clone(),
                    error: Some(err.clone()),
                });
                return Err(err);
            }
        };

        let session = Arc::new(Session::connecting(identity.clone(), connection.session));

        // Another task may have connected while we were waiting.
        let winner = {
            let mut pool = lock(&self.pool);
            match pool.get(&key) {
                Some(existing) if existing.is_ready() => Some(Arc::clone(existing)),
                _ => {
                    session.set_ready();
                    pool.insert(key.clone(), Arc::clone(&session));
                    None
                }
            }
        };
        if let Some(existing) = winner {
            debug!(identity = %identity, "discarding duplicate connection");
            session.set_disconnected(None);
            session.channel.close().await;
            *lock(&self.current) = Some(identity.clone());
            return Ok(existing);
        }

        self.watch(Arc::clone(&session), connection.events);
        *lock(&self.current) = Some(identity.clone());
        let _ = self.events.send(ConnectionEvent::Connected {
            identity: identity.clone(),
        });
        Ok(session)
    }

    /// End the session for `identity`, if any.  Idempotent.
    pub async fn release(&self, identity: &RemoteIdentity) {
        let removed = lock(&self.pool).remove(&identity.key());
        if let Some(session) = removed {
            self.teardown(&session).await;
        }
    }

    /// End every pooled session.
    pub async fn dispose(&self) {
        let sessions: Vec<Arc<Session>> = lock(&self.pool).drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.teardown(&session).await;
        }
    }

    /// Report that `session` hit a fatal error mid-operation.
    pub async fn mark_failed(&self, session: &Arc<Session>, error: FsError) {
        warn!(identity = %session.identity, error = %error, "dropping failed session");
        drop_session(&self.pool, &self.events, session, Some(error));
        session.channel.close().await;
    }

    fn pooled(&self, key: &str) -> Option<Arc<Session>> {
        let mut pool = lock(&self.pool);
        match pool.get(key) {
            Some(session) if session.is_ready() => Some(Arc::clone(session)),
            Some(_) => {
                pool.remove(key);
                None
            }
            None => None,
        }
    }

    async fn teardown(&self, session: &Arc<Session>) {
        info!(identity = %session.identity, "disconnecting");
        if session.set_disconnected(None) {
            let _ = self.events.send(ConnectionEvent::Disconnected {
                identity: session.identity.clone(),
                error: None,
            });
        }
        session.channel.close().await;
    }

    /// Follow the transport's lifecycle events for a pooled session.
    fn watch(&self, session: Arc<Session>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let pool = Arc::clone(&self.pool);
        let notify = self.events.clone();
        tokio::spawn(async move {
            let error = loop {
                match events.recv().await {
                    Some(TransportEvent::Ready) => continue,
                    Some(TransportEvent::Error(e)) => break Some(e),
                    Some(TransportEvent::End) | None => break None,
                }
            };
            if session.is_ready() {
                warn!(identity = %session.identity, "session ended by transport");
            }
            drop_session(&pool, &notify, &session, error);
        });
    }
}

/// Mark `session` disconnected, remove it from the pool if it is still the
/// pooled one, and notify subscribers once.
fn drop_session(
    pool: &Mutex<HashMap<String, Arc<Session>>>,
    notify: &broadcast::Sender<ConnectionEvent>,
    session: &Arc<Session>,
    error: Option<FsError>,
) {
    {
        let mut pool = lock(pool);
        let key = session.identity.key();
        if pool.get(&key).is_some_and(|s| Arc::ptr_eq(s, session)) {
            pool.remove(&key);
        }
    }
    if session.set_disconnected(error.clone()) {
        let _ = notify.send(ConnectionEvent::Disconnected {
            identity: session.identity.clone(),
            error,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;

    fn identity() -> RemoteIdentity {
        RemoteIdentity::new("myvm", 22, "admin")
    }

    fn manager() -> (MemoryTransport, ConnectionManager) {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        let manager = ConnectionManager::new(Arc::new(transport.clone()));
        (transport, manager)
    }

    /// Let the watcher task run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // -- acquire -------------------------------------------------------------

    #[tokio::test]
    async fn acquire_reuses_ready_sessions() {
        let (transport, manager) = manager();
        let a = manager.acquire(&identity()).await.unwrap();
        let b = manager.acquire(&identity()).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(manager.current(), Some(identity()));
        assert_eq!(a.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn failed_connect_is_reported_and_not_pooled() {
        let (_transport, manager) = manager();
        let mut events = manager.subscribe();
        let stranger = RemoteIdentity::new("nowhere", 22, "admin");

        let err = manager.acquire(&stranger).await.err().unwrap();
        assert!(matches!(err, FsError::NetworkFailure { .. }));
        assert!(manager.list().is_empty());
        assert_eq!(manager.last(), Some(stranger.clone()));
        assert_eq!(manager.current(), None);

        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { identity, error } => {
                assert_eq!(identity, stranger);
                assert!(error.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    /// Holds every connect until the test lets it through.
    struct GatedTransport {
        inner: MemoryTransport,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl Transport for GatedTransport {
        async fn connect(
            &self,
            identity: &RemoteIdentity,
            credentials: &Credentials,
        ) -> FsResult<crate::transport::Connection> {
            let _permit = self.gate.acquire().await.map_err(|e| FsError::NetworkFailure {
                identity: identity.key(),
                reason: e.to_string(),
            })?;
            self.inner.connect(identity, credentials).await
        }
    }

    #[tokio::test]
    async fn in_flight_connects_are_listed_as_connecting() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let manager = Arc::new(ConnectionManager::new(Arc::new(GatedTransport {
            inner: transport,
            gate: Arc::clone(&gate),
        })));

        let connecting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire(&identity()).await }
        });
        while manager.list().is_empty() {
            tokio::task::yield_now().await;
        }
        let infos = manager.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].identity, identity());
        assert_eq!(infos[0].state, SessionState::Connecting);

        gate.add_permits(1);
        connecting.await.unwrap().unwrap();
        let infos = manager.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].state, SessionState::Ready);
    }

    #[tokio::test]
    async fn abandoned_connects_leave_nothing_behind() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let manager = Arc::new(ConnectionManager::new(Arc::new(GatedTransport {
            inner: transport,
            gate,
        })));

        let connecting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire(&identity()).await }
        });
        while manager.list().is_empty() {
            tokio::task::yield_now().await;
        }
        connecting.abort();
        assert!(connecting.await.unwrap_err().is_cancelled());
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn registered_credentials_are_used() {
        let transport = MemoryTransport::new();
        let key = Credentials::KeyFile("/keys/id_ed25519".into());
        transport.add_host(&identity(), key.clone());
        let manager = ConnectionManager::new(Arc::new(transport));

        let err = manager.acquire(&identity()).await.err().unwrap();
        assert!(matches!(err, FsError::AuthenticationFailed { .. }));

        manager.set_credentials(&identity(), key);
        assert!(manager.acquire(&identity()).await.is_ok());
    }

    // -- release -------------------------------------------------------------

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_transport, manager) = manager();
        let session = manager.acquire(&identity()).await.unwrap();
        manager.release(&identity()).await;
        manager.release(&identity()).await;

        assert!(manager.list().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            session.stat("/").await,
            Err(FsError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn dispose_releases_everything() {
        let (transport, manager) = manager();
        let other = RemoteIdentity::new("other", 2222, "root");
        transport.add_host(&other, Credentials::Agent);
        manager.acquire(&identity()).await.unwrap();
        manager.acquire(&other).await.unwrap();
        assert_eq!(manager.list().len(), 2);

        manager.dispose().await;
        assert!(manager.list().is_empty());
    }

    // -- transport events ----------------------------------------------------

    #[tokio::test]
    async fn dropped_sessions_fail_fast_and_notify() {
        let (transport, manager) = manager();
        let mut events = manager.subscribe();
        let session = manager.acquire(&identity()).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));

        transport.kill(&identity());
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { error, .. } => {
                assert!(matches!(error, Some(FsError::NetworkFailure { .. })));
            }
            other => panic!("unexpected event {other:?}"),
        }
        settle().await;

        assert!(matches!(
            session.list("/").await,
            Err(FsError::NotConnected(_))
        ));
        assert!(session.last_error().is_some());
        assert!(manager.list().is_empty());

        // The next acquire connects afresh.
        let fresh = manager.acquire(&identity()).await.unwrap();
        assert!(!Arc::ptr_eq(&session, &fresh));
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn mark_failed_drops_the_session() {
        let (_transport, manager) = manager();
        let session = manager.acquire(&identity()).await.unwrap();
        manager
            .mark_failed(
                &session,
                FsError::NetworkFailure {
                    identity: identity().key(),
                    reason: "broken pipe".into(),
                },
            )
            .await;
        assert!(manager.list().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    // -- stats ---------------------------------------------------------------

    #[tokio::test]
    async fn operations_are_counted() {
        let (transport, manager) = manager();
        transport.seed_file(&identity(), "/f", "hello");
        let session = manager.acquire(&identity()).await.unwrap();
        session.stat("/f").await.unwrap();
        session.read("/f").await.unwrap();

        let info = &manager.list()[0];
        assert_eq!(info.stats.operations, 2);
        assert_eq!(info.stats.bytes_transferred, 5);
        assert_eq!(info.state, SessionState::Ready);
    }

    #[tokio::test]
    async fn rate_is_smoothed() {
        let transport = MemoryTransport::new();
        transport.add_host(&identity(), Credentials::Agent);
        let conn = transport
            .connect(&identity(), &Credentials::Agent)
            .await
            .unwrap();
        let session = Session::connecting(identity(), conn.session);
        session.record(1000, Duration::from_secs(1));
        assert_eq!(session.stats().transfer_rate, 1000.0);
        session.record(2000, Duration::from_secs(1));
        assert!((session.stats().transfer_rate - 1200.0).abs() < 1e-9);
    }
}
