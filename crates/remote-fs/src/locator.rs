//! Resource locator parser.
//!
//! Parses locators of the form:
//!
//! ```text
//! sftp://<user>@<host>:<port>/<remote-path>
//! ```
//!
//! `ssh://` is accepted as an alias for `sftp://`.  The user and port are
//! optional; a missing user falls back to the caller-supplied default and a
//! missing port to 22.  IPv6 hosts are written in brackets
//! (`sftp://admin@[::1]:2222/srv`).
//!
//! The parser produces a [`ResourceHandle`]: the [`RemoteIdentity`] that owns
//! the file plus the normalized absolute remote path.

use std::fmt;

use crate::errors::{FsError, FsResult};

/// Port used when a locator does not name one.
pub const DEFAULT_PORT: u16 = 22;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The `(host, port, username)` triple addressing one remote endpoint.
///
/// Used as the connection pool key, in its normalized `username@host:port`
/// string form (see [`RemoteIdentity::key`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteIdentity {
    host: String,
    port: u16,
    username: String,
}

impl RemoteIdentity {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            username: username.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Normalized pool key: `username@host:port`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.username, self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.username, self.host, self.port)
        }
    }
}

/// A remote path plus the identity it resolves against.
///
/// Not persisted; the bridge recomputes it for every call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub identity: RemoteIdentity,
    /// Absolute, normalized remote path (`/` for the root).
    pub path: String,
}

impl ResourceHandle {
    pub fn new(identity: RemoteIdentity, path: &str) -> FsResult<Self> {
        Ok(Self {
            identity,
            path: normalize_path(path)?,
        })
    }

    /// Parse a locator string, using `default_user` when it names none.
    pub fn parse(locator: &str, default_user: Option<&str>) -> FsResult<Self> {
        parse(locator, default_user)
    }

    /// A handle for `name` inside this directory.
    pub fn join(&self, name: &str) -> FsResult<Self> {
        Self::new(self.identity.clone(), &join_path(&self.path, name))
    }

    /// The parent directory, or `None` for `/`.
    pub fn parent(&self) -> Option<Self> {
        parent_dir(&self.path).map(|p| Self {
            identity: self.identity.clone(),
            path: p.to_string(),
        })
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sftp://{}{}", self.identity, self.path)
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Known scheme prefixes.
const KNOWN_SCHEMES: &[&str] = &["sftp://", "ssh://"];

/// Returns `true` if `locator` looks like a remote locator (quick check
/// without full parsing), so callers can bail out early for local paths.
pub fn is_remote_locator(locator: &str) -> bool {
    KNOWN_SCHEMES.iter().any(|scheme| {
        locator.len() > scheme.len()
            && locator
                .get(..scheme.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

/// Split an authority like `user@host:port` into its parts.
fn parse_authority(authority: &str) -> FsResult<(Option<String>, String, Option<u16>)> {
    let (user, remainder) = match authority.rsplit_once('@') {
        Some(("", rest)) => (None, rest),
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, authority),
    };

    let (host, port_str) = if let Some(bracketed) = remainder.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| FsError::InvalidLocator(format!("unclosed '[' in '{authority}'")))?;
        match after {
            "" => (host, None),
            _ => match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(FsError::InvalidLocator(format!(
                        "unexpected '{after}' after IPv6 host"
                    )));
                }
            },
        }
    } else {
        match remainder.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (remainder, None),
        }
    };

    if host.is_empty() {
        return Err(FsError::InvalidLocator(format!(
            "missing host in '{authority}'"
        )));
    }

    let port = port_str
        .map(|p| {
            p.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| FsError::InvalidLocator(format!("invalid port '{p}'")))
        })
        .transpose()?;

    Ok((user, host.to_string(), port))
}

/// Normalize an absolute remote path: collapse duplicate slashes, drop `.`
/// segments, resolve `..` lexically and strip any trailing slash.
pub fn normalize_path(path: &str) -> FsResult<String> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidLocator(format!(
            "remote path must be absolute: '{path}'"
        )));
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Return the parent directory of a normalized remote path, or `None` for `/`.
pub fn parent_dir(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Append `name` to the directory path `dir`.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Whether `path` equals `root` or lies lexically beneath it.
pub fn is_same_or_under(path: &str, root: &str) -> bool {
    if root == "/" {
        return true;
    }
    match path.strip_prefix(root) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse a locator string into a [`ResourceHandle`].
pub fn parse(locator: &str, default_user: Option<&str>) -> FsResult<ResourceHandle> {
    if !is_remote_locator(locator) {
        return Err(FsError::InvalidLocator(format!(
            "expected sftp://[user@]host[:port]/path, got '{locator}'"
        )));
    }
    let scheme_len = locator.find("://").map(|i| i + 3).unwrap_or(0);
    let rest = &locator[scheme_len..];

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (user, host, port) = parse_authority(authority)?;
    let username = user
        .or_else(|| default_user.map(str::to_string))
        .ok_or_else(|| FsError::InvalidLocator(format!("no user in '{locator}' and no default user")))?;

    ResourceHandle::new(
        RemoteIdentity::new(host, port.unwrap_or(DEFAULT_PORT), username),
        path,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- is_remote_locator ---------------------------------------------------

    #[test]
    fn detect_sftp_locator() {
        assert!(is_remote_locator("sftp://myvm/etc/config"));
        assert!(is_remote_locator("SSH://myvm/etc/config"));
    }

    #[test]
    fn reject_local_paths() {
        assert!(!is_remote_locator("/etc/config"));
        assert!(!is_remote_locator("relative/path"));
        assert!(!is_remote_locator("sftp://"));
        assert!(!is_remote_locator(""));
    }

    // -- parse: basic --------------------------------------------------------

    #[test]
    fn parse_full_locator() {
        let h = parse("sftp://admin@myvm:2222/etc/config", None).unwrap();
        assert_eq!(h.identity.username(), "admin");
        assert_eq!(h.identity.host(), "myvm");
        assert_eq!(h.identity.port(), 2222);
        assert_eq!(h.path, "/etc/config");
    }

    #[test]
    fn parse_defaults_port_and_user() {
        let h = parse("sftp://myvm/var/log", Some("deploy")).unwrap();
        assert_eq!(h.identity.key(), "deploy@myvm:22");
        assert_eq!(h.path, "/var/log");
    }

    #[test]
    fn parse_without_path_is_root() {
        let h = parse("ssh://admin@myvm", None).unwrap();
        assert_eq!(h.path, "/");
    }

    #[test]
    fn parse_ipv6_host() {
        let h = parse("sftp://admin@[::1]:2200/srv", None).unwrap();
        assert_eq!(h.identity.host(), "::1");
        assert_eq!(h.identity.port(), 2200);
        assert_eq!(h.identity.key(), "admin@[::1]:2200");
    }

    #[test]
    fn host_is_case_insensitive() {
        let a = parse("sftp://admin@MyVM/x", None).unwrap();
        let b = parse("sftp://admin@myvm/x", None).unwrap();
        assert_eq!(a.identity, b.identity);
    }

    #[test]
    fn parse_normalizes_path() {
        let h = parse("sftp://admin@myvm//a/./b/../c/", None).unwrap();
        assert_eq!(h.path, "/a/c");
    }

    // -- parse: errors -------------------------------------------------------

    #[test]
    fn parse_missing_host() {
        let err = parse("sftp://admin@/etc", None).unwrap_err();
        assert!(matches!(err, FsError::InvalidLocator(_)));
    }

    #[test]
    fn parse_invalid_port() {
        let err = parse("sftp://admin@myvm:notaport/etc", None).unwrap_err();
        assert!(matches!(err, FsError::InvalidLocator(m) if m.contains("notaport")));
        assert!(parse("sftp://admin@myvm:0/etc", None).is_err());
    }

    #[test]
    fn parse_missing_user_without_default() {
        assert!(parse("sftp://myvm/etc", None).is_err());
    }

    #[test]
    fn parse_rejects_other_schemes() {
        assert!(parse("ftp://admin@myvm/etc", None).is_err());
    }

    // -- helpers -------------------------------------------------------------

    #[test]
    fn multibyte_input_is_rejected_not_sliced() {
        for locator in ["ssh:/é/x", "sftpé://h/x", "ééééééé/x", "sftp:/\u{1F600}/x"] {
            assert!(!is_remote_locator(locator), "{locator}");
            assert!(matches!(
                ResourceHandle::parse(locator, Some("u")),
                Err(FsError::InvalidLocator(_))
            ));
        }
        let handle = ResourceHandle::parse("sftp://h/données/é.txt", Some("u")).unwrap();
        assert_eq!(handle.path, "/données/é.txt");
    }

    #[test]
    fn parent_dir_cases() {
        assert_eq!(parent_dir("/"), None);
        assert_eq!(parent_dir("/etc"), Some("/"));
        assert_eq!(parent_dir("/a/b/c/d"), Some("/a/b/c"));
    }

    #[test]
    fn same_or_under() {
        assert!(is_same_or_under("/app", "/app"));
        assert!(is_same_or_under("/app/data/x", "/app"));
        assert!(!is_same_or_under("/application", "/app"));
        assert!(is_same_or_under("/anything", "/"));
    }

    #[test]
    fn join_and_parent_round_trip() {
        let root = parse("sftp://admin@myvm/", None).unwrap();
        let child = root.join("srv").unwrap().join("data.bin").unwrap();
        assert_eq!(child.path, "/srv/data.bin");
        assert_eq!(child.parent().unwrap().path, "/srv");
        assert_eq!(child.to_string(), "sftp://admin@myvm:22/srv/data.bin");
    }
}
