//! # kura-kernel
//!
//! Secure virtual filesystem and streaming archives for kura.
//!
//! Every request path goes through the same funnel:
//! - Routed to a mount by longest prefix (`/docs/a.txt` → mount `docs`)
//! - Checked for traversal, raw and percent-encoded
//! - Joined onto the mount root and canonicalized
//! - Re-verified against the root after every filesystem call
//!
//! Anything that fails a check is reported as `PathTraversal`, which
//! adapters present exactly like "not found".
//!
//! Directory downloads stream a ZIP archive into any `AsyncWrite` with
//! bounded read concurrency and deterministic entry order.

pub mod archive;
pub mod config;
pub mod vfs;

pub use archive::{
    ArchiveError, ArchiveJob, ArchiveOptions, ArchiveProgress, ArchiveReport, ArchiveResult,
    ArchiveStreamer, Compression, SkipReason, SkipRecord,
};
pub use config::{ConfigError, KuraConfig, MountConfig};
pub use vfs::{
    Access, FileInfo, Listing, Mount, MountTable, OpenFile, ResolvedPath, Unlisted,
    UnlistedReason, VfsError, VfsResult, VirtualFs, Visibility,
};
