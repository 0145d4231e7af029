//! User configuration.
//!
//! Loaded from `$XDG_CONFIG_HOME/remote-fs/config.toml` (or an explicit
//! path).  Every field has a default, so an empty or missing file is a valid
//! configuration:
//!
//! ```toml
//! strict_recursive_delete = false
//!
//! [cache]
//! capacity_bytes = 104857600
//! ttl_secs = 3600
//! # dir = "/var/tmp/remote-fs-cache"
//!
//! [compression]
//! threshold_bytes = 1024
//! policy = "adaptive"        # adaptive | off | gzip | zstd | xz
//!
//! [transfer]
//! chunk_size = 1048576
//! large_file_threshold = 4194304
//!
//! [connection]
//! # default_user = "deploy"
//! # identity_file = "~/.ssh/id_ed25519"
//! connect_timeout_secs = 30
//! keepalive_secs = 15
//! ```
//!
//! `REMOTE_FS_CACHE_DIR` and `REMOTE_FS_CACHE_CAPACITY` override the cache
//! section.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::bridge::BridgeConfig;
use crate::cache::{self, ContentCache};
use crate::compression::{self, CompressionPolicy};
use crate::errors::{FsError, FsResult};
use crate::streaming;
use crate::transport::Credentials;
use crate::transport::sftp::SftpTransport;

pub const ENV_CACHE_DIR: &str = "REMOTE_FS_CACHE_DIR";
pub const ENV_CACHE_CAPACITY: &str = "REMOTE_FS_CACHE_CAPACITY";

/// Transfers above this size are streamed: 4 MiB.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub capacity_bytes: u64,
    pub ttl_secs: u64,
    /// Backing store directory; `<temp>/remote-fs-cache` when unset.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: cache::DEFAULT_CAPACITY,
            ttl_secs: cache::DEFAULT_TTL.as_secs(),
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("remote-fs-cache"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionConfig {
    pub threshold_bytes: usize,
    pub policy: CompressionPolicy,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: compression::DEFAULT_THRESHOLD,
            policy: CompressionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub large_file_threshold: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: streaming::DEFAULT_CHUNK_SIZE,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// User for locators that name none.
    pub default_user: Option<String>,
    /// Private key offered instead of the agent's keys.
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_user: None,
            identity_file: None,
            connect_timeout_secs: 30,
            keepalive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache: CacheConfig,
    pub compression: CompressionConfig,
    pub transfer: TransferConfig,
    pub connection: ConnectionConfig,
    /// Fail a recursive delete when a child vanishes mid-traversal.
    pub strict_recursive_delete: bool,
}

impl Config {
    /// `$XDG_CONFIG_HOME/remote-fs/config.toml`, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|base| base.join("remote-fs").join("config.toml"))
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> FsResult<Self> {
        let config: Config = toml::from_str(text).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration.
    ///
    /// An explicit `path` must exist; the default path is optional.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> FsResult<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };
        let mut config = match path {
            Some(path) => {
                debug!(path = %path.display(), "loading config");
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    FsError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `REMOTE_FS_*` overrides looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> FsResult<()> {
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|d| !d.is_empty()) {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(capacity) = lookup(ENV_CACHE_CAPACITY) {
            self.cache.capacity_bytes = capacity.trim().parse().map_err(|_| {
                FsError::Config(format!("{ENV_CACHE_CAPACITY}: not a byte count: '{capacity}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.cache.capacity_bytes == 0 {
            return Err(FsError::Config("cache.capacity_bytes must be positive".into()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(FsError::Config("cache.ttl_secs must be positive".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(FsError::Config("transfer.chunk_size must be positive".into()));
        }
        if self.connection.connect_timeout_secs == 0 {
            return Err(FsError::Config(
                "connection.connect_timeout_secs must be positive".into(),
            ));
        }
        if self.connection.keepalive_secs == 0 {
            return Err(FsError::Config("connection.keepalive_secs must be positive".into()));
        }
        Ok(())
    }

    // -- derived objects -----------------------------------------------------

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            compression_threshold: self.compression.threshold_bytes,
            compression_policy: self.compression.policy,
            chunk_size: self.transfer.chunk_size,
            large_file_threshold: self.transfer.large_file_threshold,
            strict_recursive_delete: self.strict_recursive_delete,
        }
    }

    pub fn open_cache(&self) -> FsResult<ContentCache> {
        ContentCache::new(
            self.cache.dir(),
            self.cache.capacity_bytes,
            Duration::from_secs(self.cache.ttl_secs),
        )
    }

    pub fn credentials(&self) -> Credentials {
        match &self.connection.identity_file {
            Some(path) => Credentials::KeyFile(expand_home(path)),
            None => Credentials::Agent,
        }
    }

    pub fn sftp_transport(&self) -> SftpTransport {
        SftpTransport::new(
            Duration::from_secs(self.connection.connect_timeout_secs),
            Duration::from_secs(self.connection.keepalive_secs),
        )
    }
}

/// Expand a leading `~/` to the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Algorithm;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.capacity_bytes, 100 * 1024 * 1024);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert_eq!(config.compression.threshold_bytes, 1024);
        assert_eq!(config.compression.policy, CompressionPolicy::Adaptive);
        assert_eq!(config.transfer.chunk_size, 1024 * 1024);
        assert_eq!(config.transfer.large_file_threshold, 4 * 1024 * 1024);
        assert!(!config.strict_recursive_delete);
        assert!(config.cache.dir().ends_with("remote-fs-cache"));
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            strict_recursive_delete = true

            [cache]
            capacity_bytes = 2048
            dir = "/var/tmp/rfs"

            [compression]
            policy = "gzip"

            [connection]
            default_user = "deploy"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.capacity_bytes, 2048);
        assert_eq!(config.cache.dir(), PathBuf::from("/var/tmp/rfs"));
        assert_eq!(
            config.compression.policy,
            CompressionPolicy::Fixed(Algorithm::Gzip)
        );
        assert_eq!(config.connection.default_user.as_deref(), Some("deploy"));

        let bridge = config.bridge_config();
        assert!(bridge.strict_recursive_delete);
        assert_eq!(bridge.compression_policy, CompressionPolicy::Fixed(Algorithm::Gzip));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for doc in [
            "[transfer]\nchunk_size = 0",
            "[cache]\ncapacity_bytes = 0",
            "[compression]\npolicy = \"lz4\"",
            "[cache]\nunknown = 1",
            "this is not toml",
        ] {
            assert!(matches!(Config::from_toml(doc), Err(FsError::Config(_))), "{doc}");
        }
    }

    #[test]
    fn environment_overrides_cache_section() {
        let mut config = Config::default();
        config
            .apply_env(|name| match name {
                ENV_CACHE_DIR => Some("/srv/cache".into()),
                ENV_CACHE_CAPACITY => Some("4096".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.cache.dir(), PathBuf::from("/srv/cache"));
        assert_eq!(config.cache.capacity_bytes, 4096);

        let err = config
            .apply_env(|name| (name == ENV_CACHE_CAPACITY).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
    }

    #[test]
    fn identity_file_selects_key_credentials() {
        let mut config = Config::default();
        assert_eq!(config.credentials(), Credentials::Agent);
        config.connection.identity_file = Some(PathBuf::from("/keys/id"));
        assert_eq!(
            config.credentials(),
            Credentials::KeyFile(PathBuf::from("/keys/id"))
        );
    }
}
