//! Unified-diff extraction and normalization.
//!
//! The patch-creation model answers in prose with a diff somewhere inside,
//! usually fenced. Extraction finds the diff, validates its shape, and
//! lists the files it touches. Normalization strips the noise that makes
//! textually different but semantically identical patches look distinct.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchParseError {
    #[error("no unified diff found in model output")]
    NoDiff,
    #[error("diff has file headers but no hunks")]
    NoHunks,
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:diff|patch)?\n(.*?)```").unwrap())
}

/// Extract a unified diff from model output. Prefers fenced blocks, falls
/// back to scanning for raw `---`/`+++` headers.
pub fn extract_patch(text: &str) -> Result<String, PatchParseError> {
    for caps in fence_re().captures_iter(text) {
        let candidate = caps[1].trim_matches('\n');
        if looks_like_diff(candidate) {
            return validated(candidate);
        }
    }
    if let Some(start) = text.find("--- ") {
        let candidate = &text[start..];
        if looks_like_diff(candidate) {
            return validated(candidate.trim_end());
        }
    }
    Err(PatchParseError::NoDiff)
}

fn looks_like_diff(text: &str) -> bool {
    text.lines().any(|l| l.starts_with("--- "))
        && text.lines().any(|l| l.starts_with("+++ "))
}

fn validated(candidate: &str) -> Result<String, PatchParseError> {
    if !candidate.lines().any(|l| l.starts_with("@@")) {
        return Err(PatchParseError::NoHunks);
    }
    let mut patch = candidate.to_string();
    if !patch.ends_with('\n') {
        patch.push('\n');
    }
    Ok(patch)
}

/// Paths modified by a unified diff, taken from `+++` headers with the
/// conventional `b/` prefix stripped. `/dev/null` targets are skipped.
pub fn modified_files(patch: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in patch.lines() {
        let Some(target) = line.strip_prefix("+++ ") else {
            continue;
        };
        let target = target.split_whitespace().next().unwrap_or(target);
        if target == "/dev/null" {
            continue;
        }
        let target = target.strip_prefix("b/").unwrap_or(target);
        if !files.iter().any(|f| f == target) {
            files.push(target.to_string());
        }
    }
    files
}

/// Canonical form for duplicate detection: hunk headers collapsed (line
/// offsets shift between attempts), trailing whitespace dropped, blank
/// lines squeezed.
pub fn normalize_patch(patch: &str) -> String {
    let mut out = Vec::new();
    for line in patch.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("@@") {
            out.push("@@".to_string());
        } else {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FENCED: &str = "Here is the fix:\n\
```diff\n\
--- a/src/parse.c\n\
+++ b/src/parse.c\n\
@@ -10,7 +10,7 @@\n\
-    if (len > buf_size)\n\
+    if (len >= buf_size)\n\
         return -1;\n\
```\n\
This bounds the read correctly.";

    #[test]
    fn extracts_fenced_diff() {
        let patch = extract_patch(FENCED).unwrap();
        assert!(patch.starts_with("--- a/src/parse.c"));
        assert!(patch.ends_with('\n'));
        assert!(!patch.contains("```"));
    }

    #[test]
    fn extracts_raw_diff_without_fences() {
        let raw = "--- a/x.c\n+++ b/x.c\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(extract_patch(raw).unwrap(), raw);
    }

    #[test]
    fn rejects_prose_without_a_diff() {
        assert_eq!(
            extract_patch("I could not produce a patch."),
            Err(PatchParseError::NoDiff)
        );
    }

    #[test]
    fn rejects_headers_without_hunks() {
        assert_eq!(
            extract_patch("--- a/x.c\n+++ b/x.c\n"),
            Err(PatchParseError::NoHunks)
        );
    }

    #[test]
    fn lists_modified_files_without_prefixes() {
        let patch = "--- a/src/a.c\n+++ b/src/a.c\n@@ -1 +1 @@\n-x\n+y\n\
                     --- a/fuzz/harness.c\n+++ b/fuzz/harness.c\n@@ -2 +2 @@\n-p\n+q\n";
        assert_eq!(modified_files(patch), vec!["src/a.c", "fuzz/harness.c"]);
    }

    #[test]
    fn deleted_files_are_not_modified_targets() {
        let patch = "--- a/gone.c\n+++ /dev/null\n@@ -1 +0,0 @@\n-x\n";
        assert!(modified_files(patch).is_empty());
    }

    #[test]
    fn normalization_ignores_offsets_and_trailing_whitespace() {
        let a = "--- a/f.c\n+++ b/f.c\n@@ -10,3 +10,3 @@\n-x\n+y  \n";
        let b = "--- a/f.c\n+++ b/f.c\n@@ -20,3 +20,3 @@\n-x\n+y\n";
        assert_eq!(normalize_patch(a), normalize_patch(b));

        let c = "--- a/f.c\n+++ b/f.c\n@@ -10,3 +10,3 @@\n-x\n+z\n";
        assert_ne!(normalize_patch(a), normalize_patch(c));
    }
}
