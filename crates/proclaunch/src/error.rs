//! Error types for the launcher

use proclaunch_protocol::{ProtocolError, Token};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for launcher operations
pub type Result<T> = std::result::Result<T, LauncherError>;

/// Errors raised by the launcher, its socket and the process handles
#[derive(Debug, Error)]
pub enum LauncherError {
    // Lifecycle errors
    /// The listening socket could not be created
    #[error("Failed to listen on {}: {source}", path.display())]
    Listen {
        /// Socket path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The helper executable could not be spawned
    #[error("Failed to start process launcher at {}: {source}", path.display())]
    Spawn {
        /// Helper executable path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The launcher was started or attached twice
    #[error("Process launcher is already running")]
    AlreadyRunning,

    /// The dispatcher thread is gone, so the request could not be delivered
    #[error("Launcher dispatcher thread has exited")]
    DispatcherGone,

    // Precondition violations
    /// A call that would deadlock on the dispatcher thread was made from it
    #[error("{0} must not be called from the launcher dispatcher thread")]
    WrongThread(&'static str),

    /// A token was registered twice
    #[error("Token {0} is already registered")]
    DuplicateToken(Token),

    /// `start` was called on a handle that has already been started
    #[error("Process was already started by this handle")]
    AlreadyStarted,

    /// An operation needs a running process
    #[error("Process is not running")]
    NotRunning,

    // Wrapped errors
    /// Framing or decoding failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LauncherError {
    /// Create a listen error
    pub fn listen(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Listen {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a spawn error
    pub fn spawn(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Spawn {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this error comes from a caller breaking an API precondition
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::WrongThread(_) | Self::DuplicateToken(_) | Self::AlreadyStarted | Self::NotRunning
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_names_path() {
        let err = LauncherError::spawn(
            "/opt/bin/proclaunch-launcher",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert!(
            err.to_string()
                .starts_with("Failed to start process launcher at /opt/bin/proclaunch-launcher")
        );
    }

    #[test]
    fn test_protocol_error_is_transparent() {
        let err: LauncherError = ProtocolError::InvalidPacketSize(2).into();
        assert_eq!(
            err.to_string(),
            "Internal protocol error: invalid packet size 2"
        );
    }

    #[test]
    fn test_precondition_classification() {
        assert!(LauncherError::DuplicateToken(Token::new(1)).is_precondition());
        assert!(LauncherError::WrongThread("register").is_precondition());
        assert!(!LauncherError::DispatcherGone.is_precondition());
    }
}
