//! Error types for the sysroot coordinator

use std::path::PathBuf;

use rost_ipc::{ErrorKind, RemoteError};

/// Failures of the deployment store collaborator
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("deployment store unavailable: {0}")]
    Unavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SysrootError {
    #[error("Invalid osname: {0:?}")]
    InvalidName(String),
    #[error("OS name \"{0}\" not found")]
    NotFound(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sysroot is shutting down")]
    Shutdown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl SysrootError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SysrootError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the cooperative-cancellation outcome of a reload
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SysrootError::Store(StoreError::Cancelled) | SysrootError::Shutdown
        )
    }

    /// Stable discriminator for remote callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            SysrootError::InvalidName(_) => ErrorKind::InvalidName,
            SysrootError::NotFound(_) => ErrorKind::NotFound,
            SysrootError::Io { .. } => ErrorKind::Io,
            SysrootError::Store(_) => ErrorKind::Store,
            SysrootError::Shutdown | SysrootError::Internal(_) => ErrorKind::Unavailable,
        }
    }
}

impl From<&SysrootError> for RemoteError {
    fn from(err: &SysrootError) -> Self {
        RemoteError::new(err.kind(), err.to_string())
    }
}

pub type Result<T, E = SysrootError> = std::result::Result<T, E>;
