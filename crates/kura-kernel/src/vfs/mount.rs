//! Immutable mount table with longest-prefix routing.
//!
//! A request path is matched against mount names segment by segment. If
//! `docs` and `docs/v2` are both mounted, `/docs/v2/guide.md` is routed to
//! `docs/v2`. Paths matching no mount fall through to the default mount.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{VfsError, VfsResult};

/// A named binding from a URL prefix to a backing directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    name: String,
    segments: Vec<String>,
    display_name: String,
    root: PathBuf,
    read_only: bool,
}

impl Mount {
    /// Create a mount at URL prefix `name` backed by `directory`.
    ///
    /// The directory is canonicalized here so later containment checks
    /// compare real paths (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(name: &str, directory: impl AsRef<Path>, read_only: bool) -> VfsResult<Self> {
        let segments = Self::parse_name(name)?;
        if segments.is_empty() {
            return Err(VfsError::invalid_mount("mount name must not be empty"));
        }
        let root = Self::canonical_root(directory.as_ref())?;
        let name = segments.join("/");
        Ok(Self {
            display_name: name.clone(),
            name,
            segments,
            root,
            read_only,
        })
    }

    /// Create the default mount, serving `directory` at `/`.
    pub fn root(directory: impl AsRef<Path>, read_only: bool) -> VfsResult<Self> {
        let root = Self::canonical_root(directory.as_ref())?;
        let display_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        Ok(Self {
            name: String::new(),
            segments: Vec::new(),
            display_name,
            root,
            read_only,
        })
    }

    /// Set the human-readable label shown by listings.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// URL prefix (`""` for the default mount).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Canonical backing directory.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Whether this is the default (`/`) mount.
    pub fn is_default(&self) -> bool {
        self.segments.is_empty()
    }

    fn parse_name(name: &str) -> VfsResult<Vec<String>> {
        let mut segments = Vec::new();
        for segment in name.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." || segment.contains(['\0', '\\']) {
                return Err(VfsError::invalid_mount(format!(
                    "mount name {name:?} contains an illegal segment"
                )));
            }
            segments.push(segment.to_string());
        }
        Ok(segments)
    }

    fn canonical_root(directory: &Path) -> VfsResult<PathBuf> {
        let root = dunce::canonicalize(directory).map_err(|e| {
            VfsError::invalid_mount(format!("{}: {e}", directory.display()))
        })?;
        if !root.is_dir() {
            return Err(VfsError::invalid_mount(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(root)
    }

    /// Number of leading request segments this mount consumes, if it matches.
    fn match_len(&self, segments: &[&str]) -> Option<usize> {
        let len = self.segments.len();
        if len <= segments.len() && self.segments.iter().zip(segments).all(|(a, b)| a == b) {
            Some(len)
        } else {
            None
        }
    }
}

/// Ordered set of named mounts plus a default mount.
///
/// Built once at startup and never mutated; share it behind an `Arc` and
/// read it from any number of requests without locking.
#[derive(Debug, Clone)]
pub struct MountTable {
    default: Arc<Mount>,
    mounts: Vec<Arc<Mount>>,
}

impl MountTable {
    /// Create a table serving only `default`.
    pub fn new(default: Mount) -> Self {
        Self {
            default: Arc::new(default),
            mounts: Vec::new(),
        }
    }

    /// Create a table from a default mount and named mounts, in order.
    pub fn from_mounts(default: Mount, mounts: impl IntoIterator<Item = Mount>) -> VfsResult<Self> {
        mounts
            .into_iter()
            .try_fold(Self::new(default), |table, mount| table.with_mount(mount))
    }

    /// Add a named mount. Names must be unique and non-empty.
    pub fn with_mount(mut self, mount: Mount) -> VfsResult<Self> {
        if mount.is_default() {
            return Err(VfsError::invalid_mount("only the default mount may be unnamed"));
        }
        if self.mounts.iter().any(|m| m.name == mount.name) {
            return Err(VfsError::invalid_mount(format!(
                "duplicate mount name {:?}",
                mount.name
            )));
        }
        self.mounts.push(Arc::new(mount));
        Ok(self)
    }

    /// The mount serving paths that match no named mount.
    pub fn default_mount(&self) -> &Arc<Mount> {
        &self.default
    }

    /// Named mounts in declaration order.
    pub fn mounts(&self) -> &[Arc<Mount>] {
        &self.mounts
    }

    /// Find the mount for cleaned request `segments`.
    ///
    /// Returns the mount and how many leading segments its name consumed.
    pub fn route(&self, segments: &[&str]) -> (&Arc<Mount>, usize) {
        self.mounts
            .iter()
            .filter_map(|m| m.match_len(segments).map(|len| (m, len)))
            .max_by_key(|(_, len)| *len)
            .unwrap_or((&self.default, 0))
    }

    /// Named mounts that sit directly below the directory at `segments`.
    ///
    /// These appear as synthetic directory entries in that directory's
    /// listing; the returned string is the entry name.
    pub fn children_of<'a>(&'a self, segments: &[&str]) -> Vec<(&'a str, &'a Arc<Mount>)> {
        self.mounts
            .iter()
            .filter(|m| {
                m.segments.len() == segments.len() + 1
                    && m.segments.iter().zip(segments).all(|(a, b)| a == b)
            })
            .filter_map(|m| m.segments.last().map(|last| (last.as_str(), m)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Dirs {
        _tmp: TempDir,
        root: PathBuf,
        docs: PathBuf,
        v2: PathBuf,
    }

    fn dirs() -> Dirs {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("www");
        let docs = tmp.path().join("docs");
        let v2 = tmp.path().join("docs-v2");
        for d in [&root, &docs, &v2] {
            std::fs::create_dir_all(d).unwrap();
        }
        Dirs { _tmp: tmp, root, docs, v2 }
    }

    fn table(d: &Dirs) -> MountTable {
        MountTable::from_mounts(
            Mount::root(&d.root, false).unwrap(),
            [
                Mount::new("docs", &d.docs, true).unwrap(),
                Mount::new("/docs/v2/", &d.v2, false).unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let d = dirs();
        let table = table(&d);

        let (mount, used) = table.route(&["docs", "v2", "guide.md"]);
        assert_eq!(mount.name(), "docs/v2");
        assert_eq!(used, 2);

        let (mount, used) = table.route(&["docs", "v1", "guide.md"]);
        assert_eq!(mount.name(), "docs");
        assert_eq!(used, 1);
    }

    #[test]
    fn test_unmatched_goes_to_default() {
        let d = dirs();
        let table = table(&d);

        let (mount, used) = table.route(&["documents", "a.txt"]);
        assert!(mount.is_default());
        assert_eq!(used, 0);

        let (mount, used) = table.route(&[]);
        assert!(mount.is_default());
        assert_eq!(used, 0);
    }

    #[test]
    fn test_mount_point_itself_routes_to_mount() {
        let d = dirs();
        let table = table(&d);

        let (mount, used) = table.route(&["docs"]);
        assert_eq!(mount.name(), "docs");
        assert_eq!(used, 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let d = dirs();
        let result = MountTable::from_mounts(
            Mount::root(&d.root, false).unwrap(),
            [
                Mount::new("docs", &d.docs, true).unwrap(),
                Mount::new("/docs", &d.v2, true).unwrap(),
            ],
        );
        assert!(matches!(result, Err(VfsError::InvalidMount(_))));
    }

    #[test]
    fn test_bad_names_rejected() {
        let d = dirs();
        assert!(Mount::new("", &d.docs, false).is_err());
        assert!(Mount::new("///", &d.docs, false).is_err());
        assert!(Mount::new("docs/../etc", &d.docs, false).is_err());
        assert!(Mount::new("./docs", &d.docs, false).is_err());
    }

    #[test]
    fn test_root_must_be_existing_directory() {
        let d = dirs();
        let file = d.root.join("file.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(matches!(
            Mount::new("f", &file, false),
            Err(VfsError::InvalidMount(_))
        ));
        assert!(matches!(
            Mount::new("m", d.root.join("missing"), false),
            Err(VfsError::InvalidMount(_))
        ));
    }

    #[test]
    fn test_root_is_canonicalized() {
        let d = dirs();
        let indirect = d.root.join("..").join("docs");
        let mount = Mount::new("docs", &indirect, false).unwrap();
        assert_eq!(mount.root_path(), dunce::canonicalize(&d.docs).unwrap());
    }

    #[test]
    fn test_children_of() {
        let d = dirs();
        let table = table(&d);

        let top: Vec<_> = table.children_of(&[]).into_iter().map(|(n, _)| n).collect();
        assert_eq!(top, vec!["docs"]);

        let under_docs: Vec<_> = table
            .children_of(&["docs"])
            .into_iter()
            .map(|(n, m)| (n, m.name().to_string()))
            .collect();
        assert_eq!(under_docs, vec![("v2", "docs/v2".to_string())]);
    }

    #[test]
    fn test_display_name() {
        let d = dirs();
        let mount = Mount::new("docs", &d.docs, true)
            .unwrap()
            .with_display_name("Documentation");
        assert_eq!(mount.display_name(), "Documentation");
        assert_eq!(mount.name(), "docs");
        assert!(mount.read_only());
    }
}
