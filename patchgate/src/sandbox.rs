//! Repository containment checks.

use std::path::{Component, Path, PathBuf};

use crate::diff::is_unsafe_path;
use crate::error::{PatchError, PatchResult};

/// Resolve `relative_path` under `root` and ensure the result stays inside it.
///
/// Symlinks are followed for the longest existing prefix of the path, so a
/// link pointing out of the repository is rejected even when the final file
/// does not exist yet.
pub fn resolve_within(root: &Path, relative_path: &str) -> PatchResult<PathBuf> {
    if is_unsafe_path(relative_path) {
        return Err(PatchError::safety(format!(
            "Path traversal detected: {relative_path}"
        )));
    }

    let canon_root = root.canonicalize()?;
    let candidate = canon_root.join(relative_path);

    // Walk up to the nearest ancestor that exists and canonicalize that.
    let mut existing = candidate.as_path();
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    let resolved = loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let mut out = canon;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                break out;
            }
            Err(_) => {
                let name = existing.file_name().ok_or_else(|| PatchError::OutsideRepository {
                    path: candidate.clone(),
                    root: canon_root.clone(),
                })?;
                tail.push(name);
                existing = existing.parent().ok_or_else(|| PatchError::OutsideRepository {
                    path: candidate.clone(),
                    root: canon_root.clone(),
                })?;
            }
        }
    };

    if !resolved.starts_with(&canon_root)
        || resolved
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(PatchError::OutsideRepository {
            path: resolved,
            root: canon_root,
        });
    }
    Ok(resolved)
}

/// Resolve a repository directory against the configured project root.
///
/// Relative paths are joined to `project_root`; the result must exist and lie
/// inside it.
pub fn resolve_repo_path(project_root: &Path, repo_path: &Path) -> PatchResult<PathBuf> {
    let canon_root = project_root.canonicalize()?;
    let joined = if repo_path.is_absolute() {
        repo_path.to_path_buf()
    } else {
        canon_root.join(repo_path)
    };
    let resolved = joined.canonicalize()?;
    if !resolved.starts_with(&canon_root) {
        return Err(PatchError::OutsideRepository {
            path: resolved,
            root: canon_root,
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_existing_and_new_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "x").unwrap();

        let root = tmp.path().canonicalize().unwrap();
        assert_eq!(resolve_within(tmp.path(), "a.txt").unwrap(), root.join("a.txt"));
        assert_eq!(
            resolve_within(tmp.path(), "new/dir/b.txt").unwrap(),
            root.join("new/dir/b.txt")
        );
    }

    #[test]
    fn test_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_within(tmp.path(), "../escape.txt").unwrap_err();
        assert!(matches!(err, PatchError::Safety { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), repo.path().join("link")).unwrap();

        let err = resolve_within(repo.path(), "link/secret.txt").unwrap_err();
        assert!(matches!(err, PatchError::OutsideRepository { .. }));
    }

    #[test]
    fn test_repo_path_must_be_inside_project_root() {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir(project.path().join("repo")).unwrap();
        let other = tempfile::tempdir().unwrap();

        assert!(resolve_repo_path(project.path(), Path::new("repo")).is_ok());
        assert!(resolve_repo_path(project.path(), other.path()).is_err());
    }
}
