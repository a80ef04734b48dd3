//! Sensitive-path glob compiler.
//!
//! Only three constructs are recognized:
//!
//! | Glob | Matches |
//! |------|---------|
//! | `**` | any run of characters, including `/` |
//! | `*`  | any run of characters except `/` |
//! | anything else | itself, literally (`.` included) |
//!
//! Patterns are anchored at both ends, so `server/**` matches
//! `server/config.ts` but not `app/server/config.ts`.

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid glob '{glob}': {message}")]
pub struct GlobError {
    pub glob: String,
    pub message: String,
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    glob: String,
    regex: Regex,
}

impl GlobMatcher {
    /// Compile a glob into an anchored regular expression.
    pub fn compile(glob: &str) -> Result<Self, GlobError> {
        let regex = Regex::new(&glob_to_regex(glob)).map_err(|e| GlobError {
            glob: glob.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// The source glob.
    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// Test a repository-relative, forward-slash path.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut literal = String::new();
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '*' {
            literal.push(c);
            continue;
        }
        out.push_str(&regex::escape(&literal));
        literal.clear();
        if chars.peek() == Some(&'*') {
            chars.next();
            // Collapse runs like `***` into a single `**`.
            while chars.peek() == Some(&'*') {
                chars.next();
            }
            out.push_str(".*");
        } else {
            out.push_str("[^/]*");
        }
    }

    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

/// Compile a list of globs, skipping (and logging) any that fail.
pub fn compile_all(globs: &[String]) -> Vec<GlobMatcher> {
    globs
        .iter()
        .filter_map(|g| match GlobMatcher::compile(g) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping sensitive path glob");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(glob: &str) -> GlobMatcher {
        GlobMatcher::compile(glob).unwrap()
    }

    #[test]
    fn test_double_star_crosses_separators() {
        let g = m("server/**");
        assert!(g.is_match("server/config.ts"));
        assert!(g.is_match("server/routes/api/users.ts"));
        assert!(!g.is_match("client/server/config.ts"));
        assert!(!g.is_match("server"));
    }

    #[test]
    fn test_single_star_stops_at_separator() {
        let g = m("src/*.rs");
        assert!(g.is_match("src/main.rs"));
        assert!(!g.is_match("src/bin/tool.rs"));
        assert!(g.is_match("src/.rs"));
    }

    #[test]
    fn test_dot_is_literal() {
        let g = m(".env");
        assert!(g.is_match(".env"));
        assert!(!g.is_match("xenv"));
        assert!(!g.is_match("a.env"));

        let g = m("**/*.pem");
        assert!(g.is_match("certs/server.pem"));
        assert!(!g.is_match("certs/serverXpem"));
        assert!(!g.is_match("server.pem"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let g = m("docs/(draft)+[1].md");
        assert!(g.is_match("docs/(draft)+[1].md"));
        assert!(!g.is_match("docs/draft1.md"));
    }

    #[test]
    fn test_anchored() {
        let g = m("Cargo.lock");
        assert!(g.is_match("Cargo.lock"));
        assert!(!g.is_match("sub/Cargo.lock"));
        assert!(!g.is_match("Cargo.lock.bak"));
    }

    #[test]
    fn test_patterns_against_tricky_paths() {
        let cases: &[(&str, &str, bool)] = &[
            ("**", "", true),
            ("**", "a/b/c", true),
            ("*", "a/b", false),
            ("*", "file.txt", true),
            ("a/**/b", "a/x/y/b", true),
            ("a/**/b", "a//b", true),
            ("a/*/b", "a/x/y/b", false),
            ("***", "deep/path", true),
            ("*.*", "name.ext", true),
            ("*.*", "dir.d/name", false),
            (".git/**", ".git/HEAD", true),
            (".git/**", "x.git/HEAD", false),
        ];
        for (glob, path, expected) in cases {
            assert_eq!(
                m(glob).is_match(path),
                *expected,
                "glob {glob:?} vs path {path:?}"
            );
        }
    }

    #[test]
    fn test_compile_all_keeps_valid() {
        let globs = vec!["server/**".to_string(), "*.lock".to_string()];
        let compiled = compile_all(&globs);
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled[0].glob(), "server/**");
    }
}
