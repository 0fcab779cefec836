//! Language validation strategy.
//!
//! Each project declares an implementation language; a patch that turns a
//! C file into something else is rejected before submission. The check
//! shells out to the language-identifier binary, whose CLI contract is
//! `--language L --path P`, exit 0 iff the file is written in L.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

/// File extensions exempt from the language check (build files, data).
const EXEMPT_EXTENSIONS: &[&str] = &["md", "txt", "json", "yaml", "yml", "toml", "mk", "cmake"];

#[derive(Debug)]
pub struct LanguageValidator {
    binary: PathBuf,
}

impl LanguageValidator {
    /// A missing binary is a startup-fatal configuration error, not a
    /// per-patch failure.
    pub fn new(binary: PathBuf) -> Result<Self> {
        if !binary.exists() {
            anyhow::bail!(
                "language-identifier binary not found at {}",
                binary.display()
            );
        }
        Ok(Self { binary })
    }

    /// Whether `path` is written in `language`. Exempt file kinds always
    /// pass.
    pub async fn matches_language(&self, language: &str, path: &Path) -> Result<bool> {
        if let Some(ext) = path.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            if EXEMPT_EXTENSIONS.contains(&ext.as_str()) {
                return Ok(true);
            }
        }
        let status = Command::new(&self.binary)
            .arg("--language")
            .arg(language)
            .arg("--path")
            .arg(path)
            .status()
            .await
            .with_context(|| format!("running {}", self.binary.display()))?;
        debug!(
            "Language check for {} as {}: {:?}",
            path.display(),
            language,
            status.code()
        );
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_fatal() {
        let err = LanguageValidator::new(PathBuf::from("/nonexistent/lang-id")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn exempt_extensions_always_pass() {
        // The check must not even run the binary for exempt files, but a
        // real one keeps the fixture honest.
        let validator = LanguageValidator::new(PathBuf::from("/bin/sh")).unwrap();
        assert!(validator
            .matches_language("c", Path::new("README.md"))
            .await
            .unwrap());
    }
}
