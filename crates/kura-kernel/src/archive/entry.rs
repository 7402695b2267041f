//! Per-file work: open through the VFS, read under the size cap, encode.

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::container::ZipEntry;
use super::error::{ArchiveError, ArchiveResult};
use super::job::{ArchiveOptions, ArchiveProgress, SkipReason, SkipRecord};
use super::walk::WalkItem;
use crate::vfs::{VfsError, VirtualFs};

const READ_CHUNK: usize = 64 * 1024;

/// Outcome of preparing one walk item.
#[derive(Debug)]
pub(crate) enum Prepared {
    Entry(ZipEntry),
    Skipped(SkipRecord),
}

/// Shared inputs for every preparation in one job.
#[derive(Clone)]
pub(crate) struct Preparer {
    pub(crate) vfs: VirtualFs,
    pub(crate) options: ArchiveOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: ArchiveProgress,
}

impl Preparer {
    /// Turn a walk item into a writable entry or a skip record.
    ///
    /// Fails only for job-ending conditions: a path escaping its mount or
    /// cancellation.
    pub(crate) async fn prepare(self, item: WalkItem) -> ArchiveResult<Prepared> {
        match item {
            WalkItem::Dir { name, modified } => {
                Ok(Prepared::Entry(ZipEntry::directory(name, modified)))
            }
            WalkItem::Skipped(record) => Ok(Prepared::Skipped(record)),
            WalkItem::File { url, name, info } => {
                let limit = self.options.max_file_size;
                if info.size > limit {
                    return Ok(Prepared::Skipped(SkipRecord::new(
                        name,
                        SkipReason::TooLarge { size: info.size, limit },
                    )));
                }
                self.prepare_file(&url, name).await
            }
        }
    }

    async fn prepare_file(&self, url: &str, name: String) -> ArchiveResult<Prepared> {
        if self.cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let _slot = self.progress.enter();
        let limit = self.options.max_file_size;

        let mut open = match self.vfs.open(url).await {
            Ok(open) => open,
            Err(VfsError::PathTraversal) => return Err(ArchiveError::PathTraversal),
            Err(e) => return Ok(read_failed(name, e.to_string())),
        };

        let mut contents = Vec::with_capacity(open.info.size.min(limit) as usize);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let n = match open.file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Ok(read_failed(name, e.to_string())),
            };
            // The file may have grown since it was listed.
            if (contents.len() + n) as u64 > limit {
                return Ok(Prepared::Skipped(SkipRecord::new(
                    name,
                    SkipReason::TooLarge {
                        size: (contents.len() + n) as u64,
                        limit,
                    },
                )));
            }
            contents.extend_from_slice(&chunk[..n]);
        }

        let modified = open.info.modified;
        let compression = self.options.compression;
        let entry_name = name.clone();
        let encoded = tokio::task::spawn_blocking(move || {
            ZipEntry::file(name, modified, contents, compression)
        })
        .await;

        match encoded {
            Ok(Ok(entry)) => {
                debug!(entry = %entry.name, size = entry.uncompressed_size, "prepared");
                Ok(Prepared::Entry(entry))
            }
            Ok(Err(e)) => Ok(read_failed(entry_name, e.to_string())),
            Err(join) => Ok(read_failed(entry_name, join.to_string())),
        }
    }
}

pub(crate) fn read_failed(name: String, reason: String) -> Prepared {
    Prepared::Skipped(SkipRecord::new(name, SkipReason::ReadFailed(reason)))
}
