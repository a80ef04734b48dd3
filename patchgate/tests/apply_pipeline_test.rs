//! Integration tests for the validate → backup → apply → restore pipeline
//!
//! Every test runs against a real git repository in a temp directory:
//! - clean modify applies and reports touched files
//! - a diff that fails `git apply --check` leaves the tree untouched
//! - traversal diffs are refused before anything is written
//! - backup/mutate/restore is byte-identical, cleanup removes the snapshot
//!   (mixed existing/created files, and three modified files)

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use patchgate::{
    generate_backup_id, BackupManager, DiffApplier, PatchValidator, TrustLimits,
};
use tempfile::tempdir;

fn init_git_repo(path: &Path) {
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
    ] {
        Command::new("git")
            .args(&args)
            .current_dir(path)
            .output()
            .expect("git setup failed");
    }
    fs::write(path.join("README.md"), "# demo\n").unwrap();
    fs::create_dir_all(path.join("src")).unwrap();
    fs::write(path.join("src/app.js"), "const a = 1;\nconst b = 2;\n").unwrap();
    fs::write(path.join("src/util.js"), "export const x = 1;\n").unwrap();
    Command::new("git")
        .args(["add", "."])
        .current_dir(path)
        .output()
        .expect("git add failed");
    Command::new("git")
        .args(["commit", "-m", "init"])
        .current_dir(path)
        .output()
        .expect("git commit failed");
}

/// Snapshot of every file under `root` except `.git`.
fn tree_snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.file_name().is_some_and(|n| n == ".git") {
                continue;
            }
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.push((rel, fs::read(&path).unwrap()));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

const GOOD_DIFF: &str = "\
diff --git a/src/app.js b/src/app.js
--- a/src/app.js
+++ b/src/app.js
@@ -1,2 +1,2 @@
 const a = 1;
-const b = 2;
+const b = 3;
diff --git a/src/new.js b/src/new.js
new file mode 100644
--- /dev/null
+++ b/src/new.js
@@ -0,0 +1 @@
+export const created = true;
";

#[tokio::test]
async fn test_clean_diff_applies() {
    let repo = tempdir().unwrap();
    init_git_repo(repo.path());

    let validation = PatchValidator::default().validate(GOOD_DIFF, repo.path(), None);
    assert!(validation.valid, "{:?}", validation.errors);
    assert!(!validation.requires_confirmation);

    let report = DiffApplier::default().apply(GOOD_DIFF, repo.path()).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.modified_files, vec!["src/app.js", "src/new.js"]);
    assert_eq!(
        fs::read_to_string(repo.path().join("src/app.js")).unwrap(),
        "const a = 1;\nconst b = 3;\n"
    );
    assert!(repo.path().join("src/new.js").exists());

    // No scratch patch files left behind.
    let leftovers: Vec<_> = fs::read_dir(repo.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".autopatch-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_failed_check_leaves_tree_unchanged() {
    let repo = tempdir().unwrap();
    init_git_repo(repo.path());
    let before = tree_snapshot(repo.path());

    let stale = "\
--- a/src/app.js
+++ b/src/app.js
@@ -1,2 +1,2 @@
 const a = 1;
-const b = 999;
+const b = 3;
";
    let report = DiffApplier::default().apply(stale, repo.path()).await;
    assert!(!report.success);
    assert!(report.error.unwrap().contains("check failed"));
    assert_eq!(tree_snapshot(repo.path()), before);
}

#[tokio::test]
async fn test_traversal_never_written() {
    let parent = tempdir().unwrap();
    let repo_path = parent.path().join("repo");
    fs::create_dir(&repo_path).unwrap();
    init_git_repo(&repo_path);

    let escape = "--- /dev/null\n+++ b/../outside.txt\n@@ -0,0 +1 @@\n+pwned\n";
    let validation = PatchValidator::default().validate(escape, &repo_path, None);
    assert!(!validation.valid);

    let report = DiffApplier::default().apply(escape, &repo_path).await;
    assert!(!report.success);
    assert!(!parent.path().join("outside.txt").exists());
}

#[tokio::test]
async fn test_backup_apply_restore_is_byte_identical() {
    let repo = tempdir().unwrap();
    let backups = tempdir().unwrap();
    init_git_repo(repo.path());
    let before = tree_snapshot(repo.path());

    let mgr = BackupManager::new(repo.path(), backups.path());
    let id = generate_backup_id("run-1");
    let validation = PatchValidator::default().validate(GOOD_DIFF, repo.path(), None);

    let mut files = validation.touched_paths();
    files.push("README.md".to_string());
    let backup = mgr.backup(&files, &id).unwrap();
    assert_eq!(backup.files.len(), 2);
    assert_eq!(backup.absent, vec!["src/new.js"]);

    let report = DiffApplier::default().apply(GOOD_DIFF, repo.path()).await;
    assert!(report.success);
    fs::write(repo.path().join("README.md"), "scribbled\n").unwrap();
    assert_ne!(tree_snapshot(repo.path()), before);

    assert!(mgr.restore(&id).unwrap());
    assert_eq!(tree_snapshot(repo.path()), before);

    mgr.cleanup(&id).unwrap();
    assert!(!backups.path().join(&id).exists());
}

const THREE_FILE_DIFF: &str = "\
diff --git a/README.md b/README.md
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-# demo
+# demo app
diff --git a/src/app.js b/src/app.js
--- a/src/app.js
+++ b/src/app.js
@@ -1,2 +1,3 @@
 const a = 1;
 const b = 2;
+module.exports = { a, b };
diff --git a/src/util.js b/src/util.js
--- a/src/util.js
+++ b/src/util.js
@@ -1 +1 @@
-export const x = 1;
+export const x = 42;
";

#[tokio::test]
async fn test_three_modified_files_restore_byte_identical() {
    let repo = tempdir().unwrap();
    let backups = tempdir().unwrap();
    init_git_repo(repo.path());
    let before = tree_snapshot(repo.path());

    let validation = PatchValidator::default().validate(THREE_FILE_DIFF, repo.path(), None);
    assert!(validation.valid, "{:?}", validation.errors);
    let files = validation.touched_paths();
    assert_eq!(files.len(), 3);

    let mgr = BackupManager::new(repo.path(), backups.path());
    let id = generate_backup_id("run-3");
    let backup = mgr.backup(&files, &id).unwrap();
    assert_eq!(backup.files.len(), 3);
    assert!(backup.absent.is_empty());

    let report = DiffApplier::default().apply(THREE_FILE_DIFF, repo.path()).await;
    assert!(report.success, "{:?}", report.error);
    let after = tree_snapshot(repo.path());
    for rel in ["README.md", "src/app.js", "src/util.js"] {
        let old = before.iter().find(|(p, _)| p == Path::new(rel)).unwrap();
        let new = after.iter().find(|(p, _)| p == Path::new(rel)).unwrap();
        assert_ne!(old.1, new.1, "{rel} should have changed");
    }

    assert!(mgr.restore(&id).unwrap());
    assert_eq!(tree_snapshot(repo.path()), before);

    mgr.cleanup(&id).unwrap();
    assert!(!backups.path().join(&id).exists());
    assert!(mgr.load_manifest(&id).unwrap().is_none());
}

#[test]
fn test_sensitive_delete_needs_confirmation_in_real_repo() {
    let repo = tempdir().unwrap();
    init_git_repo(repo.path());
    fs::create_dir_all(repo.path().join("server")).unwrap();
    fs::write(repo.path().join("server/config.ts"), "export default {};\n").unwrap();

    let diff = "\
diff --git a/server/config.ts b/server/config.ts
deleted file mode 100644
--- a/server/config.ts
+++ /dev/null
@@ -1 +0,0 @@
-export default {};
";
    let result = PatchValidator::new(TrustLimits::default()).validate(diff, repo.path(), None);
    assert!(result.valid);
    assert!(result.requires_confirmation);
    let reasons: Vec<String> = result
        .danger_summary
        .iter()
        .map(|d| serde_json::to_value(d.reason).unwrap().as_str().unwrap().to_string())
        .collect();
    assert_eq!(reasons, vec!["delete", "sensitive_path"]);
}
