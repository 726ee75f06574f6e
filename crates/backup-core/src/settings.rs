use crate::error::{BackupError, Result};
use crate::paths::{self, write_atomic, BackupLayout, LiveLayout};
use crate::retention::RetentionPolicy;
use crate::snapshot::FullBackupPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupSettings {
    /// Directory holding the data file and the attachment tree.
    /// Defaults to the platform data directory.
    pub live_root: Option<PathBuf>,
    pub data_file: String,
    pub attachments_dir: String,
    /// Defaults to `backups/` under the platform data directory.
    pub backup_dir: Option<PathBuf>,
    /// Automatic triggers closer together than this are ignored.
    pub min_interval_minutes: u32,
    pub history_max_bytes: u64,
    pub full_policy: FullBackupPolicy,
    pub retention: RetentionPolicy,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            live_root: None,
            data_file: "casefile.db".into(),
            attachments_dir: "attachments".into(),
            backup_dir: None,
            min_interval_minutes: 15,
            history_max_bytes: 1024 * 1024,
            full_policy: FullBackupPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl BackupSettings {
    /// Read settings from `path`; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&json)
            .map_err(|e| BackupError::Config(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&paths::settings_path()?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    /// Reject settings the backup engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("data_file", &self.data_file), ("attachments_dir", &self.attachments_dir)] {
            let plain = Path::new(value).components().count() == 1
                && !value.is_empty()
                && value != "."
                && value != ".."
                && !value.contains('/')
                && !value.contains('\\');
            if !plain {
                return Err(BackupError::Config(format!(
                    "{field} must be a plain file name, got {value:?}"
                )));
            }
        }
        if self.data_file == self.attachments_dir {
            return Err(BackupError::Config(
                "data_file and attachments_dir must differ".into(),
            ));
        }
        if let Some(ratio) = self.full_policy.max_changed_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(BackupError::Config(format!(
                    "full_policy.max_changed_ratio must be between 0 and 1, got {ratio}"
                )));
            }
        }
        // unresolvable defaults fail later, when the layouts are used
        if let (Ok(live), Ok(store)) = (self.live_layout(), self.backup_layout()) {
            let backups = resolved(&store.root);
            let reserved = [
                ("attachments_dir", live.attachments_path()),
                ("data_file", live.data_file_path()),
                ("restore work directory", live.restore_work_dir()),
            ];
            for (what, path) in reserved {
                if backups.starts_with(resolved(&path)) {
                    return Err(BackupError::Config(format!(
                        "backup_dir {} must not be inside the {what} {}",
                        store.root.display(),
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn live_layout(&self) -> Result<LiveLayout> {
        let root = match &self.live_root {
            Some(root) => root.clone(),
            None => paths::data_dir()?,
        };
        Ok(LiveLayout::new(root, &self.data_file, &self.attachments_dir))
    }

    pub fn backup_layout(&self) -> Result<BackupLayout> {
        let root = match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => paths::data_dir()?.join("backups"),
        };
        Ok(BackupLayout::new(root))
    }
}

/// Absolute form of `path` for containment checks. The longest existing
/// ancestor is canonicalized and the rest appended as written.
fn resolved(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => return path.to_path_buf(),
        }
    };
    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(mut out) = fs::canonicalize(existing) {
            out.extend(rest.iter().rev());
            return out;
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.json");
        fs::write(&path, r#"{"min_interval_minutes": 5, "retention": {"max_chains": 3}}"#).unwrap();

        let settings = BackupSettings::load(&path).unwrap();
        assert_eq!(settings.min_interval_minutes, 5);
        assert_eq!(settings.retention.max_chains, Some(3));
        assert_eq!(settings.retention.max_age_days, Some(90));
        assert_eq!(settings.data_file, "casefile.db");
    }

    #[test]
    fn missing_file_is_default_and_save_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/backup.json");
        assert_eq!(BackupSettings::load(&path).unwrap(), BackupSettings::default());

        let settings = BackupSettings {
            live_root: Some(dir.path().join("live")),
            backup_dir: Some(dir.path().join("backups")),
            ..BackupSettings::default()
        };
        settings.save(&path).unwrap();
        let loaded = BackupSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.backup_layout().unwrap().catalog, dir.path().join("backups/catalog.json"));
    }

    #[test]
    fn rejects_nested_item_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.json");
        fs::write(&path, r#"{"data_file": "../casefile.db"}"#).unwrap();
        assert!(matches!(BackupSettings::load(&path), Err(BackupError::Config(_))));
    }

    #[test]
    fn backup_dir_must_stay_out_of_the_live_items() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("live");
        fs::create_dir_all(live.join("attachments")).unwrap();
        let with_backups = |backups: PathBuf| BackupSettings {
            live_root: Some(live.clone()),
            backup_dir: Some(backups),
            ..BackupSettings::default()
        };

        for bad in [
            live.join("attachments"),
            live.join("attachments/backups"),
            live.join("attachments/not-yet/created"),
            live.join(".casefile-restore/backups"),
            live.join("casefile.db"),
        ] {
            let err = with_backups(bad.clone()).validate().unwrap_err();
            assert!(matches!(err, BackupError::Config(_)), "{}", bad.display());
        }

        with_backups(live.join("backups")).validate().unwrap();
        with_backups(dir.path().join("elsewhere")).validate().unwrap();
        // a sibling that only shares a name prefix is fine
        with_backups(live.join("attachments-backups")).validate().unwrap();

        let path = dir.path().join("backup.json");
        let json = serde_json::json!({ "live_root": live, "backup_dir": live.join("attachments/b") });
        fs::write(&path, json.to_string()).unwrap();
        assert!(matches!(BackupSettings::load(&path), Err(BackupError::Config(_))));
    }
}
