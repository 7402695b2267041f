//! TOML configuration for a kura server.
//!
//! ```toml
//! root = "/srv/www"
//! root_read_only = true
//! show_hidden = false
//!
//! [archive]
//! concurrency = 4
//! max_file_size = 268435456
//! compression = "deflate"
//!
//! [[mounts]]
//! path = "docs"
//! directory = "/srv/docs"
//! read_only = true
//! display_name = "Documentation"
//! ```
//!
//! Relative directories are resolved against the config file's directory
//! when loaded with [`KuraConfig::load`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::ArchiveOptions;
use crate::vfs::{Mount, MountTable, VfsError, Visibility, guard};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("mount {path:?}: {source}")]
    Mount {
        path: String,
        #[source]
        source: VfsError,
    },
}

/// One `[[mounts]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    /// URL prefix, e.g. `docs` or `media/photos`.
    pub path: String,
    pub directory: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KuraConfig {
    /// Directory served at `/`.
    pub root: PathBuf,
    #[serde(default)]
    pub root_read_only: bool,
    #[serde(default)]
    pub show_hidden: bool,
    #[serde(default)]
    pub archive: ArchiveOptions,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

impl KuraConfig {
    /// Serve a single directory with default settings.
    pub fn single_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            root_read_only: false,
            show_hidden: false,
            archive: ArchiveOptions::default(),
            mounts: Vec::new(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        Ok(config)
    }

    /// Resolve relative directories against `base`.
    fn rebase(&mut self, base: &Path) {
        let join = |dir: &mut PathBuf| {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        };
        join(&mut self.root);
        for mount in &mut self.mounts {
            join(&mut mount.directory);
        }
    }

    /// Checks that need no filesystem access.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.archive.concurrency == 0 {
            return Err(ConfigError::Invalid("archive.concurrency must be at least 1".into()));
        }
        if self.archive.max_file_size == 0 {
            return Err(ConfigError::Invalid("archive.max_file_size must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for mount in &self.mounts {
            let key = guard::clean_segments(&mount.path).collect::<Vec<_>>().join("/");
            if key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mount path {:?} is empty",
                    mount.path
                )));
            }
            if !seen.insert(key) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate mount path {:?}",
                    mount.path
                )));
            }
        }
        Ok(())
    }

    /// Build the immutable mount table. Every directory must exist.
    pub fn mount_table(&self) -> Result<MountTable, ConfigError> {
        let default = Mount::root(&self.root, self.root_read_only).map_err(|source| {
            ConfigError::Mount {
                path: "/".to_string(),
                source,
            }
        })?;

        let mut table = MountTable::new(default);
        for entry in &self.mounts {
            let mount_err = |source| ConfigError::Mount {
                path: entry.path.clone(),
                source,
            };
            let mut mount =
                Mount::new(&entry.path, &entry.directory, entry.read_only).map_err(mount_err)?;
            if let Some(display_name) = &entry.display_name {
                mount = mount.with_display_name(display_name.clone());
            }
            table = table.with_mount(mount).map_err(mount_err)?;
        }
        Ok(table)
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        self.archive.clone()
    }

    /// Default listing visibility.
    pub fn visibility(&self) -> Visibility {
        Visibility::from_show_hidden(self.show_hidden)
    }
}
