//! Error types for the tree watcher.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur in the tree watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Stat failed for a path.
    #[error("failed to stat {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Listing a directory failed.
    #[error("failed to read directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Attaching a native watch failed.
    #[error("failed to watch {}: {source}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Watcher already running.
    #[error("watcher already running for: {}", .0.display())]
    AlreadyWatching(PathBuf),

    /// More events were pending than the queue allows.
    #[error("event queue overflowed: more than {0} pending events")]
    QueueOverflow(usize),

    /// The watch was cancelled through its cancellation token.
    #[error("watch cancelled")]
    Cancelled,

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WatcherError {
    /// The filesystem path this error is about, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Stat { path, .. }
            | Self::ReadDir { path, .. }
            | Self::Watch { path, .. }
            | Self::AlreadyWatching(path) => Some(path.as_path()),
            Self::Notify(err) => err.paths.first().map(PathBuf::as_path),
            _ => None,
        }
    }

    /// Whether the underlying cause is a missing path.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Stat { source, .. }
            | Self::ReadDir { source, .. }
            | Self::Watch { source, .. }
            | Self::Io(source) => source.kind() == io::ErrorKind::NotFound,
            Self::Notify(err) => matches!(err.kind, notify::ErrorKind::PathNotFound),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stat_error_carries_path() {
        let err = WatcherError::Stat {
            path: PathBuf::from("/missing/root"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };

        assert_eq!(err.path(), Some(Path::new("/missing/root")));
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("failed to stat /missing/root"));
    }

    #[test]
    fn test_permission_error_is_not_vanished() {
        let err = WatcherError::ReadDir {
            path: PathBuf::from("/locked"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };

        assert!(!err.is_not_found());
        assert_eq!(WatcherError::Cancelled.path(), None);
    }
}
