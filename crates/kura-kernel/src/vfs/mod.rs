//! Virtual filesystem over one or more mounted directories.
//!
//! Key components:
//!
//! - [`guard`] - Containment checks for user-supplied paths
//! - [`MountTable`] - Immutable longest-prefix routing to mounts
//! - [`VirtualFs`] - The single entry point for turning request paths into
//!   metadata, listings and open files
//!
//! ## Design Decisions
//!
//! - **No caching**: every call re-resolves and re-validates its path;
//!   nothing is trusted from an earlier resolution.
//! - **Double validation**: paths are checked lexically and again after
//!   symlink expansion, and once more after any call that may have followed
//!   a link.
//! - **Read-only surface**: the read-only flag is checked through
//!   [`VirtualFs::check_writable`], but no write operations exist.

pub mod guard;
mod error;
mod mount;
mod types;

pub use error::{VfsError, VfsResult};
pub use mount::{Mount, MountTable};
pub use types::{Access, FileInfo, Listing, ResolvedPath, Unlisted, UnlistedReason, Visibility};

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, warn};

/// An opened regular file together with its metadata.
#[derive(Debug)]
pub struct OpenFile {
    pub file: fs::File,
    pub info: FileInfo,
}

/// What to do with a symlinked entry whose target leaves its mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapePolicy {
    /// Leave it out of the listing.
    Omit,
    /// Fail the whole listing with `PathTraversal`.
    Reject,
}

enum LinkTarget {
    Inside(Metadata),
    Escapes,
    Dangling,
}

/// Mount-aware, containment-checked view of the host filesystem.
///
/// Cheap to clone; clones share the same immutable [`MountTable`].
#[derive(Debug, Clone)]
pub struct VirtualFs {
    table: Arc<MountTable>,
}

impl VirtualFs {
    pub fn new(table: MountTable) -> Self {
        Self::from_shared(Arc::new(table))
    }

    pub fn from_shared(table: Arc<MountTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MountTable {
        &self.table
    }

    /// Every mount, default first.
    pub fn mounts(&self) -> impl Iterator<Item = &Arc<Mount>> {
        std::iter::once(self.table.default_mount()).chain(self.table.mounts())
    }

    /// Resolve a request path for reading.
    pub async fn resolve(&self, url_path: &str) -> VfsResult<ResolvedPath> {
        self.resolve_for(url_path, Access::Read).await
    }

    /// Resolve a request path for the given access.
    ///
    /// Fails with `Forbidden` for write access to a read-only mount,
    /// `PathTraversal` if the path leaves its mount (lexically or through a
    /// symlink) and `NotFound` if nothing exists there.
    pub async fn resolve_for(&self, url_path: &str, access: Access) -> VfsResult<ResolvedPath> {
        let segments: Vec<&str> = guard::clean_segments(url_path).collect();
        let (mount, consumed) = self.table.route(&segments);

        if access == Access::Write && mount.read_only() {
            return Err(VfsError::forbidden(url_path));
        }

        let relative = segments[consumed..].join("/");
        let absolute = guard::lexical(mount.root_path(), &relative).inspect_err(|e| {
            if e.is_traversal() {
                warn!(mount = mount.name(), "rejected request path escaping mount");
            }
        })?;

        let real = canonicalize(&absolute, url_path).await?;
        guard::contain(mount.root_path(), &real).inspect_err(|_| {
            warn!(mount = mount.name(), "rejected symlink escaping mount");
        })?;

        debug!(mount = mount.name(), relative = %relative, "resolved");
        Ok(ResolvedPath {
            mount: Arc::clone(mount),
            relative: PathBuf::from(relative),
            absolute,
            real,
        })
    }

    /// Fail with `Forbidden` unless the path's mount accepts writes.
    pub async fn check_writable(&self, url_path: &str) -> VfsResult<ResolvedPath> {
        self.resolve_for(url_path, Access::Write).await
    }

    /// Metadata for the entry at `url_path`, following in-bounds symlinks.
    pub async fn stat(&self, url_path: &str) -> VfsResult<FileInfo> {
        let resolved = self.resolve(url_path).await?;
        let meta = fs::metadata(&resolved.real)
            .await
            .map_err(|e| VfsError::from_io(e, url_path))?;
        let is_symlink = is_link(&resolved.absolute).await;
        self.reverify(&resolved, url_path).await?;
        Ok(FileInfo::from_metadata(entry_name(&resolved, url_path), &meta, is_symlink))
    }

    /// Open the regular file at `url_path` for reading.
    ///
    /// The returned handle reads exactly the bytes of the resolved file:
    /// after opening, the path is resolved again and, on unix, the handle's
    /// device/inode must match what the path now names.
    ///
    /// FIFOs, sockets and device nodes fail with `Forbidden` before any
    /// open call, since opening a FIFO blocks until a writer appears.
    pub async fn open(&self, url_path: &str) -> VfsResult<OpenFile> {
        let resolved = self.resolve(url_path).await?;

        let meta = fs::metadata(&resolved.real)
            .await
            .map_err(|e| VfsError::from_io(e, url_path))?;
        if meta.is_dir() {
            return Err(VfsError::is_a_directory(url_path));
        }
        if !meta.is_file() {
            warn!(mount = resolved.mount.name(), "refusing to open special file");
            return Err(VfsError::forbidden(url_path));
        }

        let file = fs::File::open(&resolved.real)
            .await
            .map_err(|e| VfsError::from_io(e, url_path))?;
        let opened = file.metadata().await.map_err(|e| VfsError::from_io(e, url_path))?;
        if !opened.is_file() {
            return Err(VfsError::forbidden(url_path));
        }

        let current = self.reverify(&resolved, url_path).await?;
        if !same_file(&opened, &current) {
            warn!(mount = resolved.mount.name(), "file swapped during open");
            return Err(VfsError::PathTraversal);
        }

        let is_symlink = is_link(&resolved.absolute).await;
        Ok(OpenFile {
            file,
            info: FileInfo::from_metadata(entry_name(&resolved, url_path), &opened, is_symlink),
        })
    }

    /// List the directory at `url_path`, sorted by name.
    ///
    /// Hidden entries are filtered by `visibility`. Symlinks are followed
    /// only when their target stays inside the mount; other links are left
    /// out. Only regular files and directories are listed; special files
    /// and entries with non-UTF-8 names are left out. Named mounts directly
    /// below this directory appear as directory entries and shadow backing
    /// entries of the same name.
    pub async fn read_dir(&self, url_path: &str, visibility: Visibility) -> VfsResult<Vec<FileInfo>> {
        let listing = self.list(url_path, visibility, EscapePolicy::Omit).await?;
        Ok(listing.entries)
    }

    /// Like [`read_dir`](Self::read_dir), but a symlink leaving the mount
    /// fails the call with `PathTraversal` instead of being skipped, and
    /// entries that cannot be listed are reported in [`Listing::unlisted`].
    pub async fn read_dir_strict(&self, url_path: &str, visibility: Visibility) -> VfsResult<Listing> {
        self.list(url_path, visibility, EscapePolicy::Reject).await
    }

    async fn list(
        &self,
        url_path: &str,
        visibility: Visibility,
        policy: EscapePolicy,
    ) -> VfsResult<Listing> {
        let resolved = self.resolve(url_path).await?;
        let root = resolved.mount.root_path();

        let meta = fs::metadata(&resolved.real)
            .await
            .map_err(|e| VfsError::from_io(e, url_path))?;
        if !meta.is_dir() {
            return Err(VfsError::not_a_directory(url_path));
        }

        let mut dir = fs::read_dir(&resolved.real)
            .await
            .map_err(|e| VfsError::from_io(e, url_path))?;
        let mut listing = Listing::default();

        while let Some(entry) = dir.next_entry().await.map_err(|e| VfsError::from_io(e, url_path))? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    let name = raw.to_string_lossy().into_owned();
                    if visibility.admits(&name) {
                        debug!(mount = resolved.mount.name(), "unlisted entry with non-UTF-8 name");
                        listing.unlisted.push(Unlisted {
                            name,
                            reason: UnlistedReason::NonUtf8Name,
                        });
                    }
                    continue;
                }
            };
            if !visibility.admits(&name) {
                continue;
            }

            // Entries can vanish between readdir and stat.
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            let (meta, is_symlink) = if file_type.is_symlink() {
                match follow_link(root, &entry.path()).await {
                    LinkTarget::Inside(meta) => (meta, true),
                    LinkTarget::Escapes => {
                        match policy {
                            EscapePolicy::Omit => {
                                debug!(mount = resolved.mount.name(), "omitting escaping symlink");
                            }
                            EscapePolicy::Reject => {
                                warn!(mount = resolved.mount.name(), "symlink escapes mount");
                                return Err(VfsError::PathTraversal);
                            }
                        }
                        continue;
                    }
                    LinkTarget::Dangling => {
                        debug!(mount = resolved.mount.name(), entry = %name, "omitting dangling symlink");
                        continue;
                    }
                }
            } else {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                (meta, false)
            };

            if meta.is_file() || meta.is_dir() {
                listing.entries.push(FileInfo::from_metadata(name, &meta, is_symlink));
            } else {
                debug!(mount = resolved.mount.name(), entry = %name, "unlisted special file");
                listing.unlisted.push(Unlisted {
                    name,
                    reason: UnlistedReason::NotRegular,
                });
            }
        }

        let segments: Vec<&str> = guard::clean_segments(url_path).collect();
        for (name, mount) in self.table.children_of(&segments) {
            if !visibility.admits(name) {
                continue;
            }
            let Ok(meta) = fs::metadata(mount.root_path()).await else {
                continue;
            };
            listing.entries.retain(|e| e.name != name);
            listing.unlisted.retain(|u| u.name != name);
            listing.entries.push(FileInfo::from_metadata(name, &meta, false));
        }

        self.reverify(&resolved, url_path).await?;

        listing.entries.sort_by(|a, b| a.name.cmp(&b.name));
        listing.unlisted.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Re-resolve `resolved` after a call that may have followed a link.
    ///
    /// Returns the current metadata of the real path.
    async fn reverify(&self, resolved: &ResolvedPath, url_path: &str) -> VfsResult<Metadata> {
        let real = canonicalize(&resolved.absolute, url_path).await?;
        guard::contain(resolved.mount.root_path(), &real).inspect_err(|_| {
            warn!(mount = resolved.mount.name(), "path escaped mount after resolution");
        })?;
        fs::metadata(&real)
            .await
            .map_err(|e| VfsError::from_io(e, url_path))
    }
}

async fn canonicalize(path: &Path, url_path: &str) -> VfsResult<PathBuf> {
    let real = fs::canonicalize(path)
        .await
        .map_err(|e| VfsError::from_io(e, url_path))?;
    Ok(dunce::simplified(&real).to_path_buf())
}

async fn is_link(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .await
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

async fn follow_link(root: &Path, link: &Path) -> LinkTarget {
    let real = match fs::canonicalize(link).await {
        Ok(real) => dunce::simplified(&real).to_path_buf(),
        Err(_) => return LinkTarget::Dangling,
    };
    if guard::contain(root, &real).is_err() {
        return LinkTarget::Escapes;
    }
    match fs::metadata(&real).await {
        Ok(meta) => LinkTarget::Inside(meta),
        Err(_) => LinkTarget::Dangling,
    }
}

fn entry_name(resolved: &ResolvedPath, url_path: &str) -> String {
    guard::clean_segments(url_path)
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| resolved.mount.display_name().to_string())
}

#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct Fixture {
        _tmp: TempDir,
        www: PathBuf,
        docs: PathBuf,
        vfs: VirtualFs,
    }

    async fn setup() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let www = tmp.path().join("www");
        let docs = tmp.path().join("srv-docs");
        std::fs::create_dir_all(www.join("pub")).unwrap();
        std::fs::create_dir_all(docs.join("a")).unwrap();
        std::fs::write(www.join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(www.join(".htpasswd"), "secret").unwrap();
        std::fs::write(www.join("pub/readme.txt"), "readme").unwrap();
        std::fs::write(docs.join("a/b.txt"), "bee").unwrap();
        std::fs::write(docs.join(".hidden"), "h").unwrap();

        let table = MountTable::from_mounts(
            Mount::root(&www, false).unwrap(),
            [Mount::new("docs", &docs, true).unwrap()],
        )
        .unwrap();
        Fixture {
            _tmp: tmp,
            www,
            docs,
            vfs: VirtualFs::new(table),
        }
    }

    #[tokio::test]
    async fn test_traversal_through_mount_rejected() {
        let fx = setup().await;

        let result = fx.vfs.resolve("/docs/../../etc/passwd").await;
        assert!(matches!(result, Err(VfsError::PathTraversal)));

        let result = fx.vfs.stat("/docs/%2e%2e/%2e%2e/etc/passwd").await;
        assert!(matches!(result, Err(VfsError::PathTraversal)));

        let result = fx.vfs.open("/../../etc/passwd").await;
        assert!(matches!(result, Err(VfsError::PathTraversal)));
    }

    #[tokio::test]
    async fn test_stat_matches_os() {
        let fx = setup().await;

        let info = fx.vfs.stat("/docs/a/b.txt").await.unwrap();
        let meta = std::fs::metadata(fx.docs.join("a/b.txt")).unwrap();
        assert_eq!(info.name, "b.txt");
        assert_eq!(info.size, meta.len());
        assert_eq!(info.modified, meta.modified().unwrap());
        assert!(info.is_file());
        assert!(!info.is_symlink);
    }

    #[tokio::test]
    async fn test_resolve_routes_to_mount() {
        let fx = setup().await;

        let resolved = fx.vfs.resolve("/docs/a/b.txt").await.unwrap();
        assert_eq!(resolved.mount().name(), "docs");
        assert_eq!(resolved.relative(), Path::new("a/b.txt"));
        assert_eq!(
            resolved.absolute(),
            dunce::canonicalize(&fx.docs).unwrap().join("a/b.txt")
        );

        let resolved = fx.vfs.resolve("/pub/readme.txt").await.unwrap();
        assert!(resolved.mount().is_default());
    }

    #[tokio::test]
    async fn test_mounts_lists_default_first() {
        let fx = setup().await;

        let names: Vec<_> = fx.vfs.mounts().map(|m| (m.name(), m.read_only())).collect();
        assert_eq!(names, vec![("", false), ("docs", true)]);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let fx = setup().await;

        for path in ["/", "/docs", "/docs/a/b.txt", "//pub/./readme.txt"] {
            let first = fx.vfs.resolve(path).await.unwrap();
            let second = fx.vfs.resolve(path).await.unwrap();
            assert_eq!(first, second, "{path}");
        }
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let fx = setup().await;

        assert!(matches!(fx.vfs.stat("/docs/nope").await, Err(VfsError::NotFound(_))));
        assert!(matches!(fx.vfs.stat("/nope").await, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_read_only_mount_forbids_write() {
        let fx = setup().await;

        assert!(matches!(
            fx.vfs.check_writable("/docs/a/b.txt").await,
            Err(VfsError::Forbidden(_))
        ));
        assert!(fx.vfs.check_writable("/index.html").await.is_ok());
        // Reads are unaffected.
        assert!(fx.vfs.resolve_for("/docs/a/b.txt", Access::Read).await.is_ok());
    }

    #[tokio::test]
    async fn test_open_reads_exact_bytes() {
        let fx = setup().await;

        let mut open = fx.vfs.open("/docs/a/b.txt").await.unwrap();
        let mut buf = Vec::new();
        open.file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bee");
        assert_eq!(open.info.size, 3);
    }

    #[tokio::test]
    async fn test_open_directory_fails() {
        let fx = setup().await;

        assert!(matches!(fx.vfs.open("/docs/a").await, Err(VfsError::IsADirectory(_))));
    }

    #[tokio::test]
    async fn test_read_dir_on_file_fails() {
        let fx = setup().await;

        let result = fx.vfs.read_dir("/index.html", Visibility::ShowHidden).await;
        assert!(matches!(result, Err(VfsError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn test_read_dir_visibility() {
        let fx = setup().await;

        let hidden: Vec<_> = fx
            .vfs
            .read_dir("/", Visibility::HideHidden)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(hidden, vec!["docs", "index.html", "pub"]);

        let all: Vec<_> = fx
            .vfs
            .read_dir("/", Visibility::ShowHidden)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(all, vec![".htpasswd", "docs", "index.html", "pub"]);
    }

    #[tokio::test]
    async fn test_mount_shadows_backing_entry() {
        let fx = setup().await;
        std::fs::write(fx.www.join("docs"), "plain file named docs").unwrap();

        let entries = fx.vfs.read_dir("/", Visibility::HideHidden).await.unwrap();
        let docs: Vec<_> = entries.iter().filter(|e| e.name == "docs").collect();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].is_dir);
    }

    #[tokio::test]
    async fn test_read_dir_of_mount_root() {
        let fx = setup().await;

        let names: Vec<_> = fx
            .vfs
            .read_dir("/docs", Visibility::ShowHidden)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".hidden", "a"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_escaping_symlink_in_listing() {
        let fx = setup().await;
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("loot.txt"), "loot").unwrap();
        std::os::unix::fs::symlink(outside.path(), fx.www.join("escape")).unwrap();
        std::os::unix::fs::symlink(fx.www.join("pub"), fx.www.join("inside")).unwrap();
        std::os::unix::fs::symlink(fx.www.join("gone"), fx.www.join("dangling")).unwrap();

        let names: Vec<_> = fx
            .vfs
            .read_dir("/", Visibility::HideHidden)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_symlink, e.is_dir))
            .collect();
        assert!(names.contains(&("inside".to_string(), true, true)));
        assert!(!names.iter().any(|(n, _, _)| n == "escape" || n == "dangling"));

        let strict = fx.vfs.read_dir_strict("/", Visibility::HideHidden).await;
        assert!(matches!(strict, Err(VfsError::PathTraversal)));

        assert!(matches!(
            fx.vfs.open("/escape/loot.txt").await,
            Err(VfsError::PathTraversal)
        ));
        assert!(fx.vfs.open("/inside/readme.txt").await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fifo_is_never_opened() {
        let fx = setup().await;
        let status = std::process::Command::new("mkfifo")
            .arg(fx.www.join("pipe"))
            .status()
            .unwrap();
        assert!(status.success());

        let opened = tokio::time::timeout(std::time::Duration::from_secs(5), fx.vfs.open("/pipe"))
            .await
            .expect("open must not block on a FIFO");
        assert!(matches!(opened, Err(VfsError::Forbidden(_))));

        let names: Vec<_> = fx
            .vfs
            .read_dir("/", Visibility::HideHidden)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["docs", "index.html", "pub"]);

        let listing = fx.vfs.read_dir_strict("/", Visibility::HideHidden).await.unwrap();
        assert_eq!(
            listing.unlisted,
            vec![Unlisted {
                name: "pipe".to_string(),
                reason: UnlistedReason::NotRegular,
            }]
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_non_utf8_name_is_reported() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = setup().await;
        std::fs::write(fx.www.join(OsStr::from_bytes(b"caf\xe9.txt")), "latin-1").unwrap();

        let entries = fx.vfs.read_dir("/", Visibility::HideHidden).await.unwrap();
        assert!(entries.iter().all(|e| !e.name.starts_with("caf")));

        let listing = fx.vfs.read_dir_strict("/", Visibility::HideHidden).await.unwrap();
        assert_eq!(listing.unlisted.len(), 1);
        assert_eq!(listing.unlisted[0].name, "caf\u{FFFD}.txt");
        assert_eq!(listing.unlisted[0].reason, UnlistedReason::NonUtf8Name);
    }
}
