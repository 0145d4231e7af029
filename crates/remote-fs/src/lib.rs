//! `remote-fs`: a remote filesystem bridge over SSH/SFTP.
//!
//! Exposes a generic filesystem contract (stat, list, read, write, delete,
//! rename, mkdir) for files living on hosts reachable over SSH:
//!
//! - [`connection`] pools one session per `user@host:port` and tracks its
//!   lifecycle;
//! - [`cache`] keeps recently read files on local disk (LRU + TTL, bounded);
//! - [`compression`] tags written payloads with a self-describing header
//!   (gzip, zstd or xz);
//! - [`streaming`] moves large payloads in chunks with backpressure,
//!   cancellation and progress reporting;
//! - [`bridge`] composes all of the above into [`RemoteFs`].
//!
//! Resources are addressed by locators of the form
//! `sftp://[user@]host[:port]/path`:
//!
//! ```no_run
//! # async fn demo() -> remote_fs::FsResult<()> {
//! use std::sync::Arc;
//! use remote_fs::{Config, ConnectionManager, RemoteFs, ResourceHandle};
//!
//! let config = Config::load(None)?;
//! let manager = ConnectionManager::new(Arc::new(config.sftp_transport()))
//!     .with_default_credentials(config.credentials());
//! let fs = RemoteFs::new(
//!     Arc::new(manager),
//!     Arc::new(config.open_cache()?),
//!     config.bridge_config(),
//! );
//!
//! let handle = ResourceHandle::parse("sftp://admin@myvm/etc/hostname", None)?;
//! let bytes = fs.read(&handle).await?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod cache;
pub mod compression;
pub mod config;
pub mod connection;
pub mod errors;
pub mod locator;
pub mod streaming;
pub mod transport;

pub use bridge::{BridgeConfig, DeleteOptions, RemoteFs, RenameOptions, WriteOptions};
pub use cache::{CacheStats, ContentCache};
pub use compression::{Algorithm, CompressionPolicy, Compressor};
pub use config::Config;
pub use connection::{ConnectionEvent, ConnectionManager, Session, SessionInfo, SessionState};
pub use errors::{FsError, FsResult};
pub use locator::{RemoteIdentity, ResourceHandle};
pub use streaming::Transfer;
pub use transport::{Credentials, DirEntry, FileKind, FileStat};
