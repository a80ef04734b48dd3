//! Unified diff parsing.
//!
//! Turns model-generated unified-diff text into file-level [`Hunk`]s. The
//! parser is deliberately forgiving: a `---` line without a matching `+++`
//! line is simply not a header, so a malformed file section is dropped
//! instead of aborting the whole scan. Callers must not treat a non-empty
//! result as proof of a complete diff; the validator re-checks structurally.
//!
//! ```text
//! --- a/src/main.rs        ← header pair opens a hunk
//! +++ b/src/main.rs
//! @@ -1,3 +1,3 @@
//! -old line                ← counted
//! +new line                ← counted
//! ```

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Sentinel path used by unified diffs for "no file on this side".
pub const DEV_NULL: &str = "/dev/null";

/// What a file-level hunk does to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One file-level change in a unified diff.
///
/// `Create` hunks have no `old_path`, `Delete` hunks have no `new_path`,
/// `Modify` hunks have both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub operation: FileOperation,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    /// Number of `+`/`-` body lines for this file.
    pub line_count: usize,
}

impl Hunk {
    /// Every distinct path referenced by this hunk.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(2);
        if let Some(old) = self.old_path.as_deref() {
            out.push(old);
        }
        if let Some(new) = self.new_path.as_deref() {
            if Some(new) != self.old_path.as_deref() {
                out.push(new);
            }
        }
        out
    }
}

/// Normalize a header path: drop a trailing timestamp, strip `a/`/`b/`
/// prefixes, convert backslashes to forward slashes.
pub fn normalize_path(raw: &str) -> String {
    let without_timestamp = raw.split('\t').next().unwrap_or(raw).trim();
    let slashed = without_timestamp.replace('\\', "/");
    if slashed == DEV_NULL {
        return slashed;
    }
    slashed
        .strip_prefix("a/")
        .or_else(|| slashed.strip_prefix("b/"))
        .unwrap_or(&slashed)
        .to_string()
}

/// Whether a normalized path could escape the repository: `..` segments,
/// absolute paths, drive prefixes, NUL bytes, or an empty path.
pub fn is_unsafe_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return true;
    }
    let normalized = path.replace('\\', "/");
    if normalized.starts_with('/') {
        return true;
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    normalized.split('/').any(|segment| segment == "..")
}

/// Parse unified-diff text into file-level hunks, in order of appearance.
pub fn parse_unified_diff(diff_text: &str) -> Vec<Hunk> {
    let lines: Vec<&str> = diff_text.lines().collect();
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(old_raw) = line.strip_prefix("--- ") {
            if let Some(new_raw) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ ")) {
                if let Some(done) = current.take() {
                    hunks.push(done);
                }
                current = Some(header_to_hunk(old_raw, new_raw));
                i += 2;
                continue;
            }
        }

        if let Some(hunk) = current.as_mut() {
            if line.starts_with('+') || line.starts_with('-') {
                hunk.line_count += 1;
            }
        }
        i += 1;
    }

    if let Some(done) = current.take() {
        hunks.push(done);
    }
    hunks
}

fn header_to_hunk(old_raw: &str, new_raw: &str) -> Hunk {
    let old = normalize_path(old_raw);
    let new = normalize_path(new_raw);

    let (operation, old_path, new_path) = if old == DEV_NULL {
        (FileOperation::Create, None, Some(new))
    } else if new == DEV_NULL {
        (FileOperation::Delete, Some(old), None)
    } else {
        (FileOperation::Modify, Some(old), Some(new))
    };

    Hunk {
        operation,
        old_path,
        new_path,
        line_count: 0,
    }
}

/// Deduplicated paths touched by a set of hunks, in order of first appearance.
pub fn touched_paths(hunks: &[Hunk]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for hunk in hunks {
        for path in hunk.paths() {
            if seen.insert(path.to_string()) {
                out.push(path.to_string());
            }
        }
    }
    out
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*(?:diff|patch|udiff)?[ \t]*\r?\n(.*?)```")
            .expect("fence regex is valid")
    })
}

/// Pull unified-diff text out of free-form model output.
///
/// Fenced blocks that look like diffs are concatenated; without fences, the
/// text from the first `diff --git` or `--- ` line onwards is used. The
/// returned diff always ends with a newline so `git apply` accepts it.
pub fn extract_unified_diff(model_output: &str) -> Option<String> {
    let fenced: Vec<&str> = fence_regex()
        .captures_iter(model_output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|block| block.contains("--- ") && block.contains("+++ "))
        .collect();

    let raw = if !fenced.is_empty() {
        fenced.join("\n")
    } else {
        let mut body = String::new();
        let mut started = false;
        for line in model_output.split_inclusive('\n') {
            if !started {
                started = line.starts_with("diff --git") || line.starts_with("--- ");
            } else if line.starts_with("```") {
                break;
            }
            if started {
                body.push_str(line);
            }
        }
        if !started {
            return None;
        }
        body
    };

    let trimmed = raw.trim_matches('\n');
    if !(trimmed.contains("--- ") && trimmed.contains("+++ ")) {
        return None;
    }
    Some(format!("{trimmed}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODIFY: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,2 @@
 fn keep() {}
-fn old() {}
+fn new() {}
";

    #[test]
    fn test_parse_modify() {
        let hunks = parse_unified_diff(MODIFY);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].operation, FileOperation::Modify);
        assert_eq!(hunks[0].old_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(hunks[0].new_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(hunks[0].line_count, 2);
    }

    #[test]
    fn test_parse_create_and_delete() {
        let diff = "\
--- /dev/null
+++ b/new.txt
@@ -0,0 +1,2 @@
+one
+two
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";
        let hunks = parse_unified_diff(diff);
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0].operation, FileOperation::Create);
        assert_eq!(hunks[0].old_path, None);
        assert_eq!(hunks[0].new_path.as_deref(), Some("new.txt"));
        assert_eq!(hunks[0].line_count, 2);
        assert_eq!(hunks[1].operation, FileOperation::Delete);
        assert_eq!(hunks[1].new_path, None);
        assert_eq!(hunks[1].line_count, 1);
    }

    #[test]
    fn test_header_count_matches_hunk_count() {
        for n in 0..6 {
            let mut diff = String::new();
            for i in 0..n {
                diff.push_str(&format!(
                    "--- a/f{i}.txt\n+++ b/f{i}.txt\n@@ -1 +1 @@\n-a\n+b\n"
                ));
            }
            assert_eq!(parse_unified_diff(&diff).len(), n);
        }
    }

    #[test]
    fn test_unmatched_minus_header_is_dropped() {
        let diff = "--- a/orphan.txt\nnot a plus line\n--- a/real.txt\n+++ b/real.txt\n+x\n";
        let hunks = parse_unified_diff(diff);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].new_path.as_deref(), Some("real.txt"));
    }

    #[test]
    fn test_removed_line_starting_with_dashes_counts_as_body() {
        let diff = "--- a/x.md\n+++ b/x.md\n@@ -1,2 +1,1 @@\n--- separator\n keep\n";
        let hunks = parse_unified_diff(diff);
        assert_eq!(hunks.len(), 1);
        assert_eq!(hunks[0].line_count, 1);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a/src/main.rs"), "src/main.rs");
        assert_eq!(normalize_path("b/src/main.rs"), "src/main.rs");
        assert_eq!(normalize_path("src\\win\\path.rs"), "src/win/path.rs");
        assert_eq!(
            normalize_path("a/file.txt\t2024-01-01 10:00:00.000000000 +0000"),
            "file.txt"
        );
        assert_eq!(normalize_path("/dev/null"), DEV_NULL);
        assert_eq!(normalize_path("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_unsafe_paths() {
        assert!(is_unsafe_path("../outside.txt"));
        assert!(is_unsafe_path("src/../../etc/passwd"));
        assert!(is_unsafe_path("/etc/passwd"));
        assert!(is_unsafe_path("C:/Windows/system.ini"));
        assert!(is_unsafe_path("..\\up.txt"));
        assert!(is_unsafe_path(""));
        assert!(!is_unsafe_path("src/main.rs"));
        assert!(!is_unsafe_path("docs/..hidden/notes.md"));
    }

    #[test]
    fn test_touched_paths_deduplicates() {
        let diff = format!("{MODIFY}--- a/src/lib.rs\n+++ b/src/lib2.rs\n+x\n");
        let hunks = parse_unified_diff(&diff);
        assert_eq!(touched_paths(&hunks), vec!["src/lib.rs", "src/lib2.rs"]);
    }

    #[test]
    fn test_extract_from_fenced_block() {
        let output = format!("Here is the change:\n\n```diff\n{MODIFY}```\n\nDone.");
        let diff = extract_unified_diff(&output).unwrap();
        assert!(diff.starts_with("diff --git"));
        assert!(diff.ends_with("+fn new() {}\n"));
        assert_eq!(parse_unified_diff(&diff).len(), 1);
    }

    #[test]
    fn test_extract_from_raw_text() {
        let output = format!("Plan done.\n{MODIFY}");
        let diff = extract_unified_diff(&output).unwrap();
        assert!(diff.starts_with("diff --git"));
    }

    #[test]
    fn test_extract_none_without_headers() {
        assert!(extract_unified_diff("no changes needed").is_none());
        assert!(extract_unified_diff("```rust\nfn main() {}\n```").is_none());
    }
}
