//! Archive job description and results.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::error::ArchiveError;
use crate::vfs::{ResolvedPath, Visibility};

/// Default number of files prepared concurrently per job.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default per-file size cap (256 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;

/// How file data is stored in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression (method 0).
    Stored,
    /// Raw DEFLATE (method 8). Falls back to stored when it does not shrink.
    #[default]
    Deflate,
}

/// Tunables for archive jobs, usually taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveOptions {
    /// Maximum number of files being read/compressed at once.
    pub concurrency: usize,
    /// Files larger than this are skipped.
    pub max_file_size: u64,
    /// Fail the job on the first skipped file instead of continuing.
    pub abort_on_error: bool,
    pub compression: Compression,
    /// Append a manifest entry listing skipped files.
    pub manifest: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            abort_on_error: false,
            compression: Compression::default(),
            manifest: true,
        }
    }
}

/// One archive download's worth of state. Dropped when the request ends.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub(crate) url_path: String,
    pub(crate) root: ResolvedPath,
    pub(crate) visibility: Visibility,
    pub(crate) options: ArchiveOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: ArchiveProgress,
}

impl ArchiveJob {
    /// Tie the job to a request-scoped cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    pub fn root(&self) -> &ResolvedPath {
        &self.root
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// Token that cancels this job when triggered.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Live read counters, shared with the running job.
    pub fn progress(&self) -> &ArchiveProgress {
        &self.progress
    }
}

/// Live counters for one job's file reads.
///
/// Clones share the same counters.
#[derive(Debug, Default, Clone)]
pub struct ArchiveProgress {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    current: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
}

impl ArchiveProgress {
    /// Files being read or encoded right now.
    pub fn in_flight(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    /// Highest `in_flight` value seen so far.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Files whose read has begun.
    pub fn files_started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub(crate) fn enter(&self) -> ReadSlot {
        self.inner.started.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        ReadSlot {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Holds one `in_flight` count until dropped.
pub(crate) struct ReadSlot {
    inner: Arc<Counters>,
}

impl Drop for ReadSlot {
    fn drop(&mut self) {
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Why an entry was left out of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge { size: u64, limit: u64 },
    ReadFailed(String),
    /// Directory is its own ancestor through a symlink.
    Cycle,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, limit } => {
                write!(f, "file too large ({size} bytes, limit {limit})")
            }
            Self::ReadFailed(reason) => write!(f, "read failed: {reason}"),
            Self::Cycle => write!(f, "directory cycle"),
        }
    }
}

/// A skipped archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRecord {
    /// Archive-relative path of the skipped entry.
    pub path: String,
    pub reason: SkipReason,
}

impl SkipRecord {
    pub(crate) fn new(path: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }

    /// The error this skip becomes when the job aborts on error.
    pub fn into_error(self) -> ArchiveError {
        match self.reason {
            SkipReason::TooLarge { size, limit } => ArchiveError::FileTooLarge {
                path: self.path,
                size,
                limit,
            },
            SkipReason::ReadFailed(reason) => ArchiveError::ReadFailed {
                path: self.path,
                reason,
            },
            SkipReason::Cycle => ArchiveError::ReadFailed {
                path: self.path,
                reason: "directory cycle".to_string(),
            },
        }
    }
}

/// Summary of a completed archive job.
#[derive(Debug, Clone, Default)]
pub struct ArchiveReport {
    /// File entries written (excluding the manifest).
    pub files: usize,
    /// Directory entries written.
    pub directories: usize,
    /// Total bytes written to the sink.
    pub bytes_written: u64,
    pub skipped: Vec<SkipRecord>,
    /// Highest number of simultaneous file reads observed.
    pub peak_in_flight: usize,
}

impl ArchiveReport {
    /// Render the skip list as the manifest entry's contents.
    pub fn manifest(&self) -> String {
        let mut out = String::from("The following entries were not included in this archive:\n\n");
        for skip in &self.skipped {
            out.push_str(&format!("{}\t{}\n", skip.path, skip.reason));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_tracks_peak() {
        let progress = ArchiveProgress::default();
        let a = progress.enter();
        let b = progress.enter();
        drop(a);
        let c = progress.enter();
        assert_eq!(progress.peak(), 2);
        drop(b);
        drop(c);
        let _d = progress.enter();
        assert_eq!(progress.peak(), 2);
        assert_eq!(progress.in_flight(), 1);
        assert_eq!(progress.files_started(), 4);
    }

    #[test]
    fn test_progress_clones_share_counters() {
        let progress = ArchiveProgress::default();
        let observer = progress.clone();
        let slot = progress.enter();
        assert_eq!(observer.in_flight(), 1);
        drop(slot);
        assert_eq!(observer.in_flight(), 0);
        assert_eq!(observer.files_started(), 1);
    }
}
