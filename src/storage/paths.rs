//! Filesystem layout under the app-private storage root

use super::md5_bytes;
use crate::error::Result;
use std::path::{Path, PathBuf};

/// Suffix appended to a form's basename to name its media directory
pub const MEDIA_SUFFIX: &str = "-media";

/// Extension of compiled form definition cache files
pub const FORMDEF_EXTENSION: &str = "formdef";

/// Logical subdirectories of the storage root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subdirectory {
    Forms,
    Instances,
    Cache,
    Metadata,
    Layers,
}

impl Subdirectory {
    pub const ALL: [Subdirectory; 5] = [
        Subdirectory::Forms,
        Subdirectory::Instances,
        Subdirectory::Cache,
        Subdirectory::Metadata,
        Subdirectory::Layers,
    ];

    /// Directory name on disk
    pub fn dir_name(&self) -> &'static str {
        match self {
            Subdirectory::Forms => "forms",
            Subdirectory::Instances => "instances",
            Subdirectory::Cache => ".cache",
            Subdirectory::Metadata => "metadata",
            Subdirectory::Layers => "layers",
        }
    }
}

/// Resolves logical locations to absolute paths. Holds no state beyond the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Default root in the user's data directory
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::APP_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, sub: Subdirectory) -> PathBuf {
        self.root.join(sub.dir_name())
    }

    pub fn all_dirs(&self) -> Vec<PathBuf> {
        Subdirectory::ALL.iter().map(|s| self.dir(*s)).collect()
    }

    /// Create any missing subdirectory
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in self.all_dirs() {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                tracing::debug!(dir = %dir.display(), "created storage directory");
            }
        }
        Ok(())
    }

    pub fn forms_db(&self) -> PathBuf {
        self.dir(Subdirectory::Metadata).join("forms.db")
    }

    pub fn instances_db(&self) -> PathBuf {
        self.dir(Subdirectory::Metadata).join("instances.db")
    }

    /// Path as stored in a registry: relative when it lives under `sub`
    pub fn to_db_path(&self, sub: Subdirectory, path: &Path) -> String {
        let dir = self.dir(sub);
        match path.strip_prefix(&dir) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Inverse of [`StoragePaths::to_db_path`]
    pub fn to_absolute(&self, sub: Subdirectory, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir(sub).join(path)
        }
    }

    /// Compiled definition cache file for a content hash
    pub fn cache_file_for(&self, md5: &str) -> PathBuf {
        self.dir(Subdirectory::Cache)
            .join(format!("{}.{}", md5, FORMDEF_EXTENSION))
    }

    /// Where the SQLite copies of a form's CSV datasets live
    pub fn external_cache_dir(&self, media_dir: &Path) -> PathBuf {
        let key = md5_bytes(media_dir.to_string_lossy().as_bytes());
        self.dir(Subdirectory::Cache).join("external").join(key)
    }
}

/// `forms/foo.xml` -> `forms/foo-media`
pub fn media_dir_for(form_file: &Path) -> PathBuf {
    let stem = form_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("{}{}", stem, MEDIA_SUFFIX);
    match form_file.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
