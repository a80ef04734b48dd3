//! File snapshots taken before a patch is applied.
//!
//! Layout under the backup root:
//!
//! ```text
//! <backup_root>/<backup_id>/manifest.json
//! <backup_root>/<backup_id>/files/<relative path>
//! ```
//!
//! The manifest lists the files that were copied and the paths that did not
//! exist yet, so a restore can both put content back and remove files the
//! patch created.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diff::is_unsafe_path;
use crate::error::{PatchError, PatchResult};
use crate::sandbox::resolve_within;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// Snapshot manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    /// Repository-relative paths copied into the snapshot.
    pub files: Vec<String>,
    /// Repository-relative paths that did not exist when snapshotted.
    #[serde(default)]
    pub absent: Vec<String>,
    /// Repository the snapshot was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_root: Option<PathBuf>,
    /// Workflow run that owns the snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    fn covers(&self, path: &str) -> bool {
        self.files.iter().any(|f| f == path) || self.absent.iter().any(|f| f == path)
    }
}

/// Creates, extends, restores and deletes snapshots for one repository.
#[derive(Debug, Clone)]
pub struct BackupManager {
    repo_root: PathBuf,
    backup_root: PathBuf,
}

impl BackupManager {
    pub fn new(repo_root: impl Into<PathBuf>, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            backup_root: backup_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Snapshot `files` under a new backup id.
    pub fn backup(&self, files: &[String], backup_id: &str) -> PatchResult<Backup> {
        self.snapshot(files, backup_id, None)
    }

    /// Snapshot `files` and record the run that owns the backup.
    pub fn backup_for_run(
        &self,
        files: &[String],
        backup_id: &str,
        run_id: &str,
    ) -> PatchResult<Backup> {
        self.snapshot(files, backup_id, Some(run_id))
    }

    fn snapshot(&self, files: &[String], backup_id: &str, run_id: Option<&str>) -> PatchResult<Backup> {
        validate_backup_id(backup_id)?;
        let dir = self.backup_dir(backup_id);
        if dir.exists() {
            return Err(PatchError::backup(backup_id, "backup already exists"));
        }
        std::fs::create_dir_all(dir.join(FILES_DIR))
            .map_err(|e| PatchError::backup(backup_id, e.to_string()))?;

        let mut backup = Backup {
            id: backup_id.to_string(),
            files: Vec::new(),
            absent: Vec::new(),
            repo_root: Some(self.repo_root.clone()),
            run_id: run_id.map(String::from),
            created_at: Utc::now(),
        };
        self.snapshot_into(&mut backup, files)?;
        self.write_manifest(&backup)?;

        info!(
            backup_id,
            files = backup.files.len(),
            absent = backup.absent.len(),
            "Backup created"
        );
        Ok(backup)
    }

    /// Add files to an existing backup. Paths already recorded keep their
    /// original snapshot.
    pub fn extend(&self, backup_id: &str, files: &[String]) -> PatchResult<Backup> {
        validate_backup_id(backup_id)?;
        let mut backup = self
            .load_manifest(backup_id)?
            .ok_or_else(|| PatchError::backup(backup_id, "backup not found"))?;

        let new: Vec<String> = files
            .iter()
            .filter(|f| !backup.covers(f))
            .cloned()
            .collect();
        if new.is_empty() {
            return Ok(backup);
        }

        self.snapshot_into(&mut backup, &new)?;
        self.write_manifest(&backup)?;
        debug!(backup_id, added = new.len(), "Backup extended");
        Ok(backup)
    }

    /// Put every snapshotted file back and delete files that were absent.
    ///
    /// Returns `Ok(false)` when no manifest exists for `backup_id`.
    pub fn restore(&self, backup_id: &str) -> PatchResult<bool> {
        validate_backup_id(backup_id)?;
        let Some(backup) = self.load_manifest(backup_id)? else {
            warn!(backup_id, "No manifest found; nothing to restore");
            return Ok(false);
        };

        let files_dir = self.backup_dir(backup_id).join(FILES_DIR);
        for rel in &backup.files {
            let Some(target) = self.checked_target(rel) else {
                continue;
            };
            let source = files_dir.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PatchError::restore(backup_id, format!("{rel}: {e}")))?;
            }
            std::fs::copy(&source, &target)
                .map_err(|e| PatchError::restore(backup_id, format!("{rel}: {e}")))?;
        }

        for rel in &backup.absent {
            let Some(target) = self.checked_target(rel) else {
                continue;
            };
            if target.is_file() || target.is_symlink() {
                std::fs::remove_file(&target)
                    .map_err(|e| PatchError::restore(backup_id, format!("{rel}: {e}")))?;
            }
        }

        info!(
            backup_id,
            restored = backup.files.len(),
            removed_candidates = backup.absent.len(),
            "Backup restored"
        );
        Ok(true)
    }

    /// Delete a backup directory. Missing backups are not an error.
    pub fn cleanup(&self, backup_id: &str) -> PatchResult<()> {
        validate_backup_id(backup_id)?;
        let dir = self.backup_dir(backup_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(backup_id, "Backup removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PatchError::backup(backup_id, e.to_string())),
        }
    }

    /// Load a manifest if it exists.
    pub fn load_manifest(&self, backup_id: &str) -> PatchResult<Option<Backup>> {
        validate_backup_id(backup_id)?;
        let path = self.backup_dir(backup_id).join(MANIFEST_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.backup_root.join(backup_id)
    }

    fn write_manifest(&self, backup: &Backup) -> PatchResult<()> {
        let json = serde_json::to_string_pretty(backup)?;
        std::fs::write(self.backup_dir(&backup.id).join(MANIFEST_FILE), json)
            .map_err(|e| PatchError::backup(&backup.id, e.to_string()))
    }

    fn snapshot_into(&self, backup: &mut Backup, files: &[String]) -> PatchResult<()> {
        let files_dir = self.backup_dir(&backup.id).join(FILES_DIR);
        let mut seen: HashSet<&str> = HashSet::new();

        for rel in files {
            if !seen.insert(rel.as_str()) {
                continue;
            }
            let Some(source) = self.checked_target(rel) else {
                continue;
            };

            if source.is_file() {
                let dest = files_dir.join(rel);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| PatchError::backup(&backup.id, format!("{rel}: {e}")))?;
                }
                std::fs::copy(&source, &dest)
                    .map_err(|e| PatchError::backup(&backup.id, format!("{rel}: {e}")))?;
                backup.files.push(rel.clone());
            } else if !source.exists() {
                backup.absent.push(rel.clone());
            } else {
                warn!(path = %rel, "Not a regular file; skipping backup");
            }
        }
        Ok(())
    }

    /// Resolve a manifest path inside the repository, or log and skip it.
    fn checked_target(&self, rel: &str) -> Option<PathBuf> {
        if is_unsafe_path(rel) {
            warn!(path = %rel, "Unsafe path skipped");
            return None;
        }
        match resolve_within(&self.repo_root, rel) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(path = %rel, error = %e, "Path outside repository skipped");
                None
            }
        }
    }
}

/// Backup ids are single path components made of `[A-Za-z0-9._-]`.
pub fn validate_backup_id(backup_id: &str) -> PatchResult<()> {
    let well_formed = !backup_id.is_empty()
        && backup_id.len() <= 128
        && !backup_id.starts_with('.')
        && backup_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if well_formed {
        Ok(())
    } else {
        Err(PatchError::InvalidBackupId(backup_id.to_string()))
    }
}

/// Build a fresh backup id: `<sanitized prefix>-<utc timestamp>-<8 hex>`.
pub fn generate_backup_id(prefix: &str) -> String {
    let mut sanitized: String = prefix
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect();
    if sanitized.is_empty() {
        sanitized.push_str("backup");
    }
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{sanitized}-{stamp}-{}", &short[..8])
}
