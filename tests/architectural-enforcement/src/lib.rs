//! Source-level policy checks for the conduit workspace.
//!
//! The crates under `conduit/` are async end to end and log through
//! `tracing`. The tests in `tests/` walk the workspace sources with these
//! helpers and reject patterns that break those rules:
//!
//! - blocking `std::thread::sleep` calls in async code
//! - stray `println!`/`eprintln!`/`dbg!` output instead of `tracing`
//! - `.unwrap()`/`.expect(` in the core library outside of tests
//! - the core library exiting the process or blocking on a runtime
//!
//! Scanning is textual. Lines inside `#[cfg(test)]` modules and comment
//! lines are ignored, which is accurate for this codebase because every
//! in-file test module sits at the bottom of its file.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A policy violation found in a source file.
#[derive(Debug)]
pub struct Violation {
    /// File the pattern was found in.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: usize,
    /// The offending source line, trimmed.
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.text)
    }
}

/// All `.rs` files under `root`, recursively.
#[must_use]
pub fn source_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// The part of `content` before any `#[cfg(test)]` module. Test code may
/// use patterns the production half must not.
#[must_use]
pub fn non_test_content(content: &str) -> &str {
    match content.find("#[cfg(test)]") {
        Some(index) => &content[..index],
        None => content,
    }
}

/// Non-test, non-comment lines under `root` that contain `pattern`.
#[must_use]
pub fn find_violations(root: &Path, pattern: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in source_files(root) {
        let Ok(content) = fs::read_to_string(&file) else {
            continue;
        };
        for (index, line) in non_test_content(&content).lines().enumerate() {
            if line.trim_start().starts_with("//") {
                continue;
            }
            if line.contains(pattern) {
                violations.push(Violation {
                    file: file.clone(),
                    line: index + 1,
                    text: line.trim().to_owned(),
                });
            }
        }
    }
    violations
}

/// Render violations one per line for assertion messages.
#[must_use]
pub fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_test_content_stops_at_test_module() {
        let content = "fn real() {}\n#[cfg(test)]\nmod tests {}\n";
        assert_eq!(non_test_content(content), "fn real() {}\n");
    }

    #[test]
    fn test_non_test_content_passes_through_without_tests() {
        let content = "fn real() {}\n";
        assert_eq!(non_test_content(content), content);
    }

    #[test]
    fn test_source_files_finds_this_crate() {
        let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
        let files = source_files(&src);
        assert!(
            files.iter().any(|f| f.ends_with("lib.rs")),
            "expected lib.rs under {}",
            src.display()
        );
    }
}
