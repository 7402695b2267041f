//! Archive error types.

use std::io;
use thiserror::Error;

use crate::vfs::VfsError;

/// Archive job error type.
///
/// `FileTooLarge` and `ReadFailed` only surface when the job is configured
/// to abort on error; otherwise they become skip records.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A walked or opened path escapes its mount. Aborts the job.
    #[error("archive path escapes mount root")]
    PathTraversal,

    /// A file exceeds the per-file size cap.
    #[error("{path}: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    /// A file or directory could not be read.
    #[error("{path}: read failed: {reason}")]
    ReadFailed { path: String, reason: String },

    /// The output sink failed; the archive is truncated.
    #[error("archive sink closed: {0}")]
    SinkClosed(#[source] io::Error),

    /// The owning request was cancelled.
    #[error("archive cancelled")]
    Cancelled,

    /// The archive root could not be resolved.
    #[error(transparent)]
    Vfs(VfsError),
}

impl ArchiveError {
    /// Rewrite errors for presentation so an escaping or forbidden root
    /// reads as a missing directory.
    pub fn conceal(self, url_path: &str) -> Self {
        match self {
            Self::PathTraversal => Self::Vfs(VfsError::not_found(url_path)),
            Self::Vfs(e) => Self::Vfs(e.conceal(url_path)),
            other => other,
        }
    }
}

impl From<VfsError> for ArchiveError {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::PathTraversal => Self::PathTraversal,
            other => Self::Vfs(other),
        }
    }
}

/// Archive result type.
pub type ArchiveResult<T> = Result<T, ArchiveError>;
