//! VFS error types.

use std::io;
use thiserror::Error;

/// VFS error type.
///
/// `PathTraversal` carries no path. The offending input is never echoed
/// back or logged.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path escapes its mount root (security violation).
    #[error("path escapes mount root")]
    PathTraversal,

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Mount is read-only, or the operation is not permitted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Malformed path (NUL bytes, non-UTF-8 input).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Mount definition rejected while building the table.
    #[error("invalid mount: {0}")]
    InvalidMount(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a Forbidden error.
    pub fn forbidden(path: impl Into<String>) -> Self {
        Self::Forbidden(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    /// Create an InvalidMount error.
    pub fn invalid_mount(msg: impl Into<String>) -> Self {
        Self::InvalidMount(msg.into())
    }

    /// Classify an OS error raised while touching `path`.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::NotADirectory => Self::NotADirectory(path.to_string()),
            io::ErrorKind::IsADirectory => Self::IsADirectory(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::Forbidden(path.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Returns true for the security-relevant rejection.
    pub fn is_traversal(&self) -> bool {
        matches!(self, Self::PathTraversal)
    }

    /// HTTP-style status for adapters.
    ///
    /// Traversal, forbidden and malformed paths all surface as 404 so a
    /// client cannot test for the existence of out-of-bounds paths.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PathTraversal
            | Self::NotFound(_)
            | Self::Forbidden(_)
            | Self::InvalidPath(_) => 404,
            Self::NotADirectory(_) | Self::IsADirectory(_) => 400,
            Self::InvalidMount(_) | Self::Io(_) => 500,
        }
    }

    /// Rewrite errors that must not be distinguishable from a missing entry.
    pub fn conceal(self, url_path: &str) -> Self {
        match self {
            Self::PathTraversal | Self::Forbidden(_) | Self::InvalidPath(_) => {
                Self::NotFound(url_path.to_string())
            }
            other => other,
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::PathTraversal => {
                io::Error::new(io::ErrorKind::PermissionDenied, "path escapes mount root")
            }
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::Forbidden(msg) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::InvalidPath(msg) | VfsError::InvalidMount(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            VfsError::Io(e) => e,
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_display_has_no_path() {
        let msg = VfsError::PathTraversal.to_string();
        assert_eq!(msg, "path escapes mount root");
    }

    #[test]
    fn test_conceal_hides_rejections() {
        let err = VfsError::PathTraversal.conceal("/docs/x");
        assert!(matches!(err, VfsError::NotFound(ref p) if p == "/docs/x"));

        let err = VfsError::forbidden("/docs").conceal("/docs");
        assert!(matches!(err, VfsError::NotFound(_)));

        let err = VfsError::is_a_directory("/docs").conceal("/docs");
        assert!(matches!(err, VfsError::IsADirectory(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(VfsError::PathTraversal.status_code(), 404);
        assert_eq!(VfsError::forbidden("x").status_code(), 404);
        assert_eq!(VfsError::not_a_directory("x").status_code(), 400);
        assert_eq!(VfsError::Io(io::Error::other("boom")).status_code(), 500);
    }

    #[test]
    fn test_from_io_classifies_kinds() {
        let err = VfsError::from_io(io::Error::from(io::ErrorKind::NotFound), "/a");
        assert!(matches!(err, VfsError::NotFound(_)));

        let err = VfsError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "/a");
        assert!(matches!(err, VfsError::Forbidden(_)));

        let err = VfsError::from_io(io::Error::other("disk on fire"), "/a");
        assert!(matches!(err, VfsError::Io(_)));
    }
}
