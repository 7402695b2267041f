//! Depth-first enumeration of an archive root.
//!
//! The whole tree is listed before the first byte is written, so a symlink
//! escaping its mount aborts the job with an empty sink.

use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, warn};

use super::error::{ArchiveError, ArchiveResult};
use super::job::{ArchiveJob, SkipReason, SkipRecord};
use crate::vfs::{FileInfo, Listing, UnlistedReason, VfsError, VirtualFs, guard};

/// One step of the walk, in archive order.
#[derive(Debug)]
pub(crate) enum WalkItem {
    Dir { name: String, modified: SystemTime },
    File { url: String, name: String, info: FileInfo },
    Skipped(SkipRecord),
}

impl WalkItem {
    /// Archive path of the item.
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Dir { name, .. } | Self::File { name, .. } => name,
            Self::Skipped(record) => &record.path,
        }
    }
}

struct Pending {
    url: String,
    name: String,
    kind: PendingKind,
    depth: usize,
}

enum PendingKind {
    Entry(FileInfo),
    Unlisted(UnlistedReason),
}

/// List everything under the job root in depth-first pre-order.
///
/// Children are visited in name order, so two walks of an unchanged tree
/// yield identical sequences.
pub(crate) async fn enumerate(vfs: &VirtualFs, job: &ArchiveJob) -> ArchiveResult<Vec<WalkItem>> {
    let base = normalized_url(&job.url_path);
    let mut items = Vec::new();
    let mut ancestors: Vec<PathBuf> = vec![job.root.real_path().to_path_buf()];
    let mut stack = Vec::new();

    let children = vfs.read_dir_strict(&base, job.visibility).await?;
    push_children(&mut stack, &base, "", 1, children);

    while let Some(pending) = stack.pop() {
        if job.cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let info = match pending.kind {
            PendingKind::Entry(info) => info,
            PendingKind::Unlisted(reason) => {
                warn!(entry = %pending.name, reason = %reason, "skipping unlistable entry");
                items.push(WalkItem::Skipped(SkipRecord::new(
                    pending.name,
                    SkipReason::ReadFailed(reason.to_string()),
                )));
                continue;
            }
        };
        if !info.is_dir {
            items.push(WalkItem::File {
                url: pending.url,
                name: pending.name,
                info,
            });
            continue;
        }

        ancestors.truncate(pending.depth);
        let resolved = match vfs.resolve(&pending.url).await {
            Ok(resolved) => resolved,
            Err(VfsError::PathTraversal) => return Err(ArchiveError::PathTraversal),
            Err(e) => {
                items.push(skip_dir(&pending.name, e));
                continue;
            }
        };
        let real = resolved.real_path().to_path_buf();
        if ancestors.contains(&real) {
            debug!(entry = %pending.name, "directory cycle");
            items.push(WalkItem::Skipped(SkipRecord::new(
                format!("{}/", pending.name),
                SkipReason::Cycle,
            )));
            continue;
        }

        match vfs.read_dir_strict(&pending.url, job.visibility).await {
            Ok(children) => {
                ancestors.push(real);
                items.push(WalkItem::Dir {
                    name: pending.name.clone(),
                    modified: info.modified,
                });
                push_children(&mut stack, &pending.url, &pending.name, pending.depth + 1, children);
            }
            Err(VfsError::PathTraversal) => return Err(ArchiveError::PathTraversal),
            Err(e) => items.push(skip_dir(&pending.name, e)),
        }
    }

    Ok(items)
}

/// Push `children` so they pop in name order, unlisted entries included.
fn push_children(
    stack: &mut Vec<Pending>,
    parent_url: &str,
    parent_name: &str,
    depth: usize,
    children: Listing,
) {
    let mut kinds: Vec<(String, PendingKind)> = children
        .entries
        .into_iter()
        .map(|info| (info.name.clone(), PendingKind::Entry(info)))
        .chain(
            children
                .unlisted
                .into_iter()
                .map(|u| (u.name, PendingKind::Unlisted(u.reason))),
        )
        .collect();
    kinds.sort_by(|a, b| a.0.cmp(&b.0));

    for (child, kind) in kinds.into_iter().rev() {
        let url = format!("{}/{}", parent_url.trim_end_matches('/'), child);
        let name = if parent_name.is_empty() {
            child
        } else {
            format!("{parent_name}/{child}")
        };
        stack.push(Pending { url, name, kind, depth });
    }
}

fn skip_dir(name: &str, err: VfsError) -> WalkItem {
    warn!(entry = %name, error = %err, "skipping unreadable directory");
    WalkItem::Skipped(SkipRecord::new(
        format!("{name}/"),
        SkipReason::ReadFailed(err.to_string()),
    ))
}

fn normalized_url(url_path: &str) -> String {
    let segments: Vec<&str> = guard::clean_segments(url_path).collect();
    format!("/{}", segments.join("/"))
}
