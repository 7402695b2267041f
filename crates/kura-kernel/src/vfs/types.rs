//! Core VFS types.

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::mount::Mount;

/// Metadata for one entry, projected from the OS.
///
/// Never cached: every `stat`/`read_dir` call builds fresh values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name (not full path).
    pub name: String,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Whether the entry (or its link target) is a directory.
    pub is_dir: bool,
    /// Whether the entry itself is a symbolic link.
    pub is_symlink: bool,
    /// Last modification time.
    pub modified: SystemTime,
}

impl FileInfo {
    /// Build from metadata of the entry (or of its link target).
    pub fn from_metadata(name: impl Into<String>, meta: &Metadata, is_symlink: bool) -> Self {
        let is_dir = meta.is_dir();
        Self {
            name: name.into(),
            size: if is_dir { 0 } else { meta.len() },
            is_dir,
            is_symlink,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        !self.is_dir
    }

    /// Returns true for dot-prefixed names.
    pub fn is_hidden(&self) -> bool {
        is_hidden_name(&self.name)
    }
}

/// A strict directory listing: readable entries plus the ones that could
/// not be represented.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub entries: Vec<FileInfo>,
    pub unlisted: Vec<Unlisted>,
}

/// A directory entry left out of a [`Listing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unlisted {
    /// Entry name, lossily decoded when it is not UTF-8.
    pub name: String,
    pub reason: UnlistedReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlistedReason {
    /// FIFO, socket or device node.
    NotRegular,
    /// The name cannot be represented as UTF-8.
    NonUtf8Name,
}

impl std::fmt::Display for UnlistedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRegular => f.write_str("not a regular file"),
            Self::NonUtf8Name => f.write_str("name is not valid UTF-8"),
        }
    }
}

/// Whether hidden (dot-prefixed) entries are included in a listing or archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Include every entry.
    ShowHidden,
    /// Drop entries whose name starts with `.`.
    #[default]
    HideHidden,
}

impl Visibility {
    /// Map a `show_hidden` flag to a policy.
    pub fn from_show_hidden(show_hidden: bool) -> Self {
        if show_hidden {
            Self::ShowHidden
        } else {
            Self::HideHidden
        }
    }

    /// Whether an entry with this name passes the policy.
    pub fn admits(self, name: &str) -> bool {
        match self {
            Self::ShowHidden => true,
            Self::HideHidden => !is_hidden_name(name),
        }
    }
}

/// What the caller intends to do with a resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// A request path bound to a mount and validated against its root.
///
/// `absolute` is always `mount.root()` or a descendant of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub(crate) mount: Arc<Mount>,
    pub(crate) relative: PathBuf,
    pub(crate) absolute: PathBuf,
    pub(crate) real: PathBuf,
}

impl ResolvedPath {
    /// The mount this path was routed to.
    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    /// Cleaned path relative to the mount root (empty for the root itself).
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// `mount.root()/relative`, as joined lexically.
    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    /// Symlink-expanded form of `absolute`, checked at resolution time.
    pub fn real_path(&self) -> &Path {
        &self.real
    }
}

fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}
