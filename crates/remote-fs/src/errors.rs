use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FsError {
    #[error("no connection to {0}")]
    NotConnected(String),

    #[error("ssh: authentication failed for {identity}: {reason}")]
    AuthenticationFailed { identity: String, reason: String },

    #[error("ssh: network failure on {identity}: {reason}")]
    NetworkFailure { identity: String, reason: String },

    #[error("remote: no such file or directory: {0}")]
    NotFound(String),

    #[error("remote: file exists: {0}")]
    AlreadyExists(String),

    #[error("remote: permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote: is a directory: {0}")]
    IsADirectory(String),

    #[error("remote: directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("malformed response from remote: {0}")]
    MalformedResponse(String),

    #[error("remote: {0}")]
    Remote(String),

    #[error("local i/o: {0}")]
    Io(Arc<std::io::Error>),

    #[error("config: {0}")]
    Config(String),
}

impl FsError {
    /// Classify a transport error message into a more specific `FsError`
    /// when possible.
    ///
    /// `path` is used for path-scoped failures, `identity` for connection
    /// failures.  SFTP status names (`SSH_FX_*`) and the usual OpenSSH /
    /// OpenSSH-server wording are both recognised.
    pub fn from_transport(identity: &str, path: &str, err: impl std::fmt::Display) -> Self {
        let msg = err.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("no such file")
            || lower.contains("not found")
            || lower.contains("does not exist")
            || msg.contains("SSH_FX_NO_SUCH_FILE")
        {
            FsError::NotFound(path.to_string())
        } else if lower.contains("permission denied (publickey")
            || lower.contains("authentication failed")
            || lower.contains("too many authentication failures")
            || lower.contains("host key verification failed")
        {
            FsError::AuthenticationFailed {
                identity: identity.to_string(),
                reason: msg,
            }
        } else if lower.contains("permission denied") || msg.contains("SSH_FX_PERMISSION_DENIED") {
            FsError::PermissionDenied(path.to_string())
        } else if lower.contains("file exists")
            || lower.contains("already exists")
            || msg.contains("SSH_FX_FILE_ALREADY_EXISTS")
        {
            FsError::AlreadyExists(path.to_string())
        } else if lower.contains("not empty") || msg.contains("SSH_FX_DIR_NOT_EMPTY") {
            FsError::DirectoryNotEmpty(path.to_string())
        } else if lower.contains("connection refused")
            || lower.contains("connection timed out")
            || lower.contains("connection reset")
            || lower.contains("connection closed")
            || lower.contains("broken pipe")
            || lower.contains("could not resolve")
            || lower.contains("no route to host")
            || lower.contains("connection lost")
            || msg.contains("SSH_FX_CONNECTION_LOST")
            || msg.contains("SSH_FX_NO_CONNECTION")
        {
            FsError::NetworkFailure {
                identity: identity.to_string(),
                reason: msg,
            }
        } else {
            FsError::Remote(msg)
        }
    }

    /// Whether an external reconnect policy may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FsError::NotConnected(_) | FsError::NetworkFailure { .. }
        )
    }

    /// Whether this error means the session it came from is dead.
    pub(crate) fn is_connection_loss(&self) -> bool {
        matches!(self, FsError::NetworkFailure { .. })
    }

    /// Reclassify a stream I/O error that came off a remote channel.
    ///
    /// Streams only speak `io::Error`; a dropped link must still surface as
    /// [`FsError::NetworkFailure`] so the session gets torn down.
    pub(crate) fn on_remote(self, identity: &str) -> Self {
        match self {
            FsError::Io(err) => {
                use std::io::ErrorKind::*;
                match err.kind() {
                    ConnectionAborted | ConnectionReset | BrokenPipe | NotConnected
                    | UnexpectedEof => FsError::NetworkFailure {
                        identity: identity.to_string(),
                        reason: err.to_string(),
                    },
                    _ => FsError::Io(err),
                }
            }
            other => other,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(Arc::new(err))
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_missing_paths() {
        let err = FsError::from_transport("u@h:22", "/etc/x", "No such file (SSH_FX_NO_SUCH_FILE)");
        assert!(matches!(err, FsError::NotFound(p) if p == "/etc/x"));
    }

    #[test]
    fn publickey_denial_is_authentication() {
        let err = FsError::from_transport("u@h:22", "", "u@h: Permission denied (publickey).");
        assert!(matches!(err, FsError::AuthenticationFailed { .. }));
    }

    #[test]
    fn plain_permission_denial_is_path_scoped() {
        let err = FsError::from_transport("u@h:22", "/root", "Permission denied");
        assert!(matches!(err, FsError::PermissionDenied(p) if p == "/root"));
    }

    #[test]
    fn connection_refused_is_network_failure() {
        let err = FsError::from_transport("u@h:22", "", "ssh: connect to host h port 22: Connection refused");
        assert!(err.is_retryable());
        assert!(err.is_connection_loss());
    }

    #[test]
    fn aborted_streams_become_network_failures() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "connection lost");
        let err = FsError::from(io).on_remote("u@h:22");
        assert!(matches!(err, FsError::NetworkFailure { identity, .. } if identity == "u@h:22"));
        assert!(matches!(FsError::Cancelled.on_remote("u@h:22"), FsError::Cancelled));
    }

    #[test]
    fn unknown_messages_are_preserved() {
        let err = FsError::from_transport("u@h:22", "/x", "quota exceeded");
        assert_eq!(err.to_string(), "remote: quota exceeded");
    }
}
