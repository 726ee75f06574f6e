use crate::error::{BackupError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "casefile";
pub const APP_NAME: &str = "casefile";

/// Directory (inside the live root) holding a staged restore tree and the
/// back-out copy of the live items during a swap.
pub const RESTORE_WORK_DIR: &str = ".casefile-restore";

pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| BackupError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| BackupError::Config("cannot determine config directory".into()))?;
    Ok(dirs.config_dir().to_path_buf())
}

pub fn settings_path() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("CASEFILE_BACKUP_CONFIG") {
        return Ok(PathBuf::from(override_path));
    }
    Ok(config_dir()?.join("backup.json"))
}

/// Where the application's persistent state lives.
///
/// The tracked items are the data file and the attachment directory, both
/// direct children of `root`. Manifest paths are relative to `root` and use
/// `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveLayout {
    pub root: PathBuf,
    pub data_file: String,
    pub attachments_dir: String,
}

impl LiveLayout {
    pub fn new(root: impl Into<PathBuf>, data_file: &str, attachments_dir: &str) -> Self {
        Self {
            root: root.into(),
            data_file: data_file.to_string(),
            attachments_dir: attachments_dir.to_string(),
        }
    }

    pub fn tracked_items(&self) -> [&str; 2] {
        [self.data_file.as_str(), self.attachments_dir.as_str()]
    }

    pub fn data_file_path(&self) -> PathBuf {
        self.root.join(&self.data_file)
    }

    pub fn attachments_path(&self) -> PathBuf {
        self.root.join(&self.attachments_dir)
    }

    pub fn restore_work_dir(&self) -> PathBuf {
        self.root.join(RESTORE_WORK_DIR)
    }

    /// Resolve a manifest path against `base`, rejecting anything that could
    /// escape it.
    pub fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        let escapes = rel.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if relative.is_empty() || escapes {
            return Err(BackupError::integrity(
                relative,
                "manifest path is not a plain relative path",
            ));
        }
        Ok(base.join(rel))
    }
}

/// On-disk layout of the backup store.
#[derive(Debug, Clone)]
pub struct BackupLayout {
    pub root: PathBuf,
    pub archives: PathBuf,
    pub staging: PathBuf,
    pub catalog: PathBuf,
    pub restore_state: PathBuf,
    pub history: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            archives: root.join("archives"),
            staging: root.join("staging"),
            catalog: root.join("catalog.json"),
            restore_state: root.join("restore-state.json"),
            history: root.join("history.log"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.archives)?;
        fs::create_dir_all(&self.staging)?;
        restrict_dir_permissions(&self.root);
        Ok(())
    }

    pub fn archive_path(&self, file_name: &str) -> PathBuf {
        self.archives.join(file_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "provider")]
pub enum StorageKind {
    Local,
    CloudSync(String),
}

const CLOUD_SYNC_MARKERS: &[(&str, &str)] = &[
    ("dropbox", "Dropbox"),
    ("onedrive", "OneDrive"),
    ("icloud drive", "iCloud Drive"),
    ("mobile documents", "iCloud Drive"),
    ("google drive", "Google Drive"),
    ("googledrive", "Google Drive"),
    ("my drive", "Google Drive"),
];

/// Recognise the common desktop sync clients by folder name.
pub fn classify_storage(path: &Path) -> StorageKind {
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy().to_lowercase();
        for (marker, provider) in CLOUD_SYNC_MARKERS {
            if name == *marker || name.starts_with(&format!("{marker} ")) || name.starts_with(&format!("{marker}-")) {
                return StorageKind::CloudSync((*provider).to_string());
            }
        }
    }
    StorageKind::Local
}

pub(crate) fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

pub(crate) fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = fs::OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `dest`.
pub(crate) fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let parent = dest
        .parent()
        .ok_or_else(|| BackupError::Config(format!("no parent directory for {}", dest.display())))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| BackupError::Io(e.error))?;
    fsync_dir(parent)?;
    Ok(())
}
