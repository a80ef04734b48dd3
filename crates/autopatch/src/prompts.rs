//! Prompts for each workflow phase.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes
//! so stored steps can be traced back to the prompt that produced them.

use std::path::Path;

use ignore::WalkBuilder;
use patchgate::GlobMatcher;
use tracing::debug;

use crate::model::ChatMessage;

pub const PROMPT_VERSION: &str = "1.2.0";

const MAX_LISTED_FILES: usize = 300;
const MAX_INLINED_FILES: usize = 8;
const MAX_INLINED_CHARS: usize = 16_000;

pub const PLANNER_PREAMBLE: &str = "\
You are the planning stage of an autonomous code editor. Given a goal and the \
repository layout, write a short numbered plan: which files to create, modify or \
delete, and what each change does. Name files by their repository-relative path. \
Do not write code.";

pub const IMPLEMENTER_PREAMBLE: &str = "\
You are the implementation stage of an autonomous code editor. Produce exactly one \
unified diff (git format, `--- a/path` / `+++ b/path` headers, `/dev/null` for created \
or deleted files) inside a ```diff fenced block. Paths are relative to the repository \
root. Hunk context must match the current file contents exactly. Change only what the \
plan requires; never touch lock files, secrets or `.git`.";

pub const FIXER_PREAMBLE: &str = "\
You are the repair stage of an autonomous code editor. The previous patch was applied \
and the tests failed; the repository has been reset to its state before that patch. \
Produce ONE complete replacement unified diff against the current (clean) files inside \
a ```diff fenced block that achieves the goal and makes the tests pass.";

pub const REVIEWER_PREAMBLE: &str = "\
You are the review stage of an autonomous code editor. Summarize what the applied \
patch does, flag risky or incomplete changes, and list follow-up work. Be brief.";

/// Repository snapshot given to the model.
#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    pub files: Vec<String>,
    /// `(path, contents)` of files referenced by the plan.
    pub inlined: Vec<(String, String)>,
}

impl RepoContext {
    /// List the repository and inline the files whose paths appear in `hint`.
    ///
    /// Hidden and gitignored files are never listed. Files matching a
    /// `sensitive` glob are listed but their contents never leave the repo.
    pub fn gather(repo: &Path, hint: &str, sensitive: &[GlobMatcher]) -> Self {
        let mut files = list_files(repo);
        files.sort();
        files.truncate(MAX_LISTED_FILES);

        let inlined = files
            .iter()
            .filter(|f| hint.contains(f.as_str()))
            .filter(|f| {
                let secret = sensitive.iter().any(|m| m.is_match(f));
                if secret {
                    debug!(path = %f, "Sensitive file not inlined");
                }
                !secret
            })
            .take(MAX_INLINED_FILES)
            .filter_map(|f| {
                let contents = std::fs::read_to_string(repo.join(f)).ok()?;
                let contents: String = contents.chars().take(MAX_INLINED_CHARS).collect();
                Some((f.clone(), contents))
            })
            .collect();

        Self { files, inlined }
    }

    fn render(&self) -> String {
        let mut out = String::from("## Repository files\n");
        if self.files.is_empty() {
            out.push_str("(empty repository)\n");
        }
        for f in &self.files {
            out.push_str("- ");
            out.push_str(f);
            out.push('\n');
        }
        for (path, contents) in &self.inlined {
            out.push_str(&format!("\n## {path}\n```\n{contents}\n```\n"));
        }
        out
    }
}

/// Repository-relative paths of regular files, respecting .gitignore even
/// outside a git checkout.
fn list_files(repo: &Path) -> Vec<String> {
    let walker = WalkBuilder::new(repo)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build();

    let mut out = Vec::new();
    for entry in walker.flatten() {
        if out.len() >= MAX_LISTED_FILES * 4 {
            break;
        }
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(repo) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    out
}

pub fn plan_messages(goal: &str, ctx: &RepoContext) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(PLANNER_PREAMBLE),
        ChatMessage::user(format!("# Goal\n{goal}\n\n{}", ctx.render())),
    ]
}

pub fn implement_messages(goal: &str, plan: &str, ctx: &RepoContext) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(IMPLEMENTER_PREAMBLE),
        ChatMessage::user(format!(
            "# Goal\n{goal}\n\n# Plan\n{plan}\n\n{}",
            ctx.render()
        )),
    ]
}

pub fn fix_messages(
    goal: &str,
    plan: &str,
    previous_diff: &str,
    test_output: &str,
    attempt: u32,
    ctx: &RepoContext,
) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(FIXER_PREAMBLE),
        ChatMessage::user(format!(
            "# Goal\n{goal}\n\n# Plan\n{plan}\n\n# Previous patch (reverted)\n```diff\n{previous_diff}```\n\n\
             # Test output (attempt {attempt})\n```\n{test_output}\n```\n\n{}",
            ctx.render()
        )),
    ]
}

pub fn review_messages(goal: &str, diff: &str, test_summary: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(REVIEWER_PREAMBLE),
        ChatMessage::user(format!(
            "# Goal\n{goal}\n\n# Applied patch\n```diff\n{diff}```\n\n# Tests\n{test_summary}"
        )),
    ]
}
