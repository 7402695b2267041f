//! Streaming ZIP archives of VFS subtrees.
//!
//! An [`ArchiveJob`] is created per download request and consumed by
//! [`ArchiveStreamer::run`], which:
//!
//! 1. lists the subtree depth-first through [`VirtualFs`] (failing closed on
//!    symlinks that leave their mount),
//! 2. prepares up to `concurrency` files at once (open, read, CRC, deflate)
//!    on spawned tasks, so reads keep going while the sink applies
//!    backpressure,
//! 3. writes entries strictly in listing order from a single writer, holding
//!    early completions in ordered slots until their turn.
//!
//! Oversized and unreadable files are skipped and reported; traversal,
//! sink failure and cancellation end the job.

mod container;
mod entry;
mod error;
mod job;
mod walk;

pub use container::{Method, ZipEntry, ZipWriter};
pub use error::{ArchiveError, ArchiveResult};
pub use job::{
    ArchiveJob, ArchiveOptions, ArchiveProgress, ArchiveReport, Compression, DEFAULT_CONCURRENCY,
    DEFAULT_MAX_FILE_SIZE, SkipReason, SkipRecord,
};

use std::collections::HashSet;
use std::io;
use std::time::SystemTime;

use futures::FutureExt;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};

use crate::vfs::{VfsError, VirtualFs, Visibility, guard};
use entry::{Prepared, Preparer};

/// Content type for archive responses.
pub const CONTENT_TYPE: &str = "application/zip";

/// Name of the trailing entry listing skipped files.
pub const MANIFEST_NAME: &str = "_SKIPPED.txt";

/// Download file name for a job: the directory name plus `.zip`.
pub fn suggested_file_name(job: &ArchiveJob) -> String {
    let base = guard::clean_segments(&job.url_path)
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| job.root.mount().display_name().to_string());
    let base: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '"' | '/' | '\\') {
                '_'
            } else {
                c
            }
        })
        .collect();
    format!("{base}.zip")
}

/// Builds and runs archive jobs against one [`VirtualFs`].
#[derive(Debug, Clone)]
pub struct ArchiveStreamer {
    vfs: VirtualFs,
    options: ArchiveOptions,
}

impl ArchiveStreamer {
    pub fn new(vfs: VirtualFs, options: ArchiveOptions) -> Self {
        Self { vfs, options }
    }

    /// Default options applied to new jobs.
    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// Create a job for the directory at `url_path`.
    pub async fn job(&self, url_path: &str, visibility: Visibility) -> ArchiveResult<ArchiveJob> {
        let root = self.vfs.resolve(url_path).await?;
        if !self.vfs.stat(url_path).await?.is_dir {
            return Err(VfsError::not_a_directory(url_path).into());
        }
        Ok(ArchiveJob {
            url_path: url_path.to_string(),
            root,
            visibility,
            options: self.options.clone(),
            cancel: CancellationToken::new(),
            progress: ArchiveProgress::default(),
        })
    }

    /// Stream the job's subtree as a ZIP archive into `sink`.
    ///
    /// On success the sink has been flushed but not shut down. On error the
    /// archive is truncated; if the error is `PathTraversal` from the
    /// listing phase nothing has been written.
    pub async fn run<W>(&self, job: ArchiveJob, sink: W) -> ArchiveResult<ArchiveReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        // A child token lets a sink failure stop this job's reads without
        // cancelling the caller's request token.
        let cancel = job.cancel.child_token();
        let result = self.write_archive(&job, &cancel, sink).await;
        if let Err(e) = &result {
            cancel.cancel();
            match e {
                ArchiveError::PathTraversal => {
                    warn!(mount = job.root.mount().name(), "archive aborted: path escapes mount")
                }
                other => warn!(path = %job.url_path, error = %other, "archive aborted"),
            }
        }
        result
    }

    async fn write_archive<W>(
        &self,
        job: &ArchiveJob,
        cancel: &CancellationToken,
        sink: W,
    ) -> ArchiveResult<ArchiveReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        info!(path = %job.url_path, concurrency = job.options.concurrency, "archive started");

        let items = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            items = walk::enumerate(&self.vfs, job) => items?,
        };

        let preparer = Preparer {
            vfs: self.vfs.clone(),
            options: job.options.clone(),
            cancel: cancel.clone(),
            progress: job.progress.clone(),
        };
        let limit = job.options.concurrency.max(1);
        // Dropping the stream aborts every task still running.
        let prepared = stream::iter(items)
            .map(|item| {
                let name = item.name().to_string();
                let task = tokio::spawn(preparer.clone().prepare(item));
                AbortOnDropHandle::new(task).map(move |joined| match joined {
                    Ok(outcome) => outcome,
                    Err(e) => Ok(entry::read_failed(name, e.to_string())),
                })
            })
            .buffered(limit);

        let mut writer = ZipWriter::new(sink);
        let mut report = ArchiveReport::default();
        write_in_order(prepared, &mut writer, &mut report, job, cancel).await?;

        if job.options.manifest && !report.skipped.is_empty() {
            let manifest = ZipEntry::file(
                manifest_name(&writer),
                SystemTime::now(),
                report.manifest().into_bytes(),
                Compression::Stored,
            )
            .map_err(sink_closed)?;
            write_entry(&mut writer, &manifest, cancel).await?;
        }

        let (_, total) = writer.finish().await.map_err(sink_closed)?;
        report.bytes_written = total;
        report.peak_in_flight = job.progress.peak();

        info!(
            path = %job.url_path,
            files = report.files,
            directories = report.directories,
            skipped = report.skipped.len(),
            bytes = report.bytes_written,
            "archive finished"
        );
        Ok(report)
    }
}

/// Single writer: consume prepared entries in listing order.
async fn write_in_order<S, W>(
    prepared: S,
    writer: &mut ZipWriter<W>,
    report: &mut ArchiveReport,
    job: &ArchiveJob,
    cancel: &CancellationToken,
) -> ArchiveResult<()>
where
    S: Stream<Item = ArchiveResult<Prepared>>,
    W: AsyncWrite + Unpin,
{
    let mut prepared = std::pin::pin!(prepared);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            next = prepared.next() => next,
        };
        let Some(outcome) = next else {
            return Ok(());
        };

        match outcome? {
            Prepared::Entry(entry) => {
                write_entry(writer, &entry, cancel).await?;
                if entry.is_dir {
                    report.directories += 1;
                } else {
                    report.files += 1;
                }
            }
            Prepared::Skipped(record) => {
                warn!(entry = %record.path, reason = %record.reason, "skipping archive entry");
                if job.options.abort_on_error {
                    return Err(record.into_error());
                }
                report.skipped.push(record);
            }
        }
    }
}

async fn write_entry<W>(
    writer: &mut ZipWriter<W>,
    entry: &ZipEntry,
    cancel: &CancellationToken,
) -> ArchiveResult<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ArchiveError::Cancelled),
        written = writer.write_entry(entry) => written.map_err(sink_closed),
    }
}

fn sink_closed(err: io::Error) -> ArchiveError {
    ArchiveError::SinkClosed(err)
}

/// Pick a manifest name that does not collide with an archived entry.
fn manifest_name<W: AsyncWrite + Unpin>(writer: &ZipWriter<W>) -> String {
    let taken: HashSet<&str> = writer.names().collect();
    let mut name = MANIFEST_NAME.to_string();
    while taken.contains(name.as_str()) {
        name.insert(0, '_');
    }
    name
}
