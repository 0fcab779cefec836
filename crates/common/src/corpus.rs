//! Content-addressed corpus and crash stores.
//!
//! Per (task, harness) there is a local and a remote directory; files are
//! named by the hex SHA-256 of their content. Fuzzer workers may drop
//! arbitrarily named files into the local tree; `hash_new_corpus` renames
//! them in place. Remote sync always goes through atomic renames, so the
//! remote tree only ever holds complete files.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::Result;
use crate::node_local::NodeLocal;

/// Hex SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether a file name is a content hash (64 hex characters).
pub fn has_hashed_name(name: &str) -> bool {
    name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Rename every non-hashed file in `dir` to its content hash. Files whose
/// hashed name already exists are dropped as duplicates.
pub fn hash_corpus_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if has_hashed_name(&name) {
            continue;
        }
        let hashed = dir.join(hash_file(&entry.path())?);
        if hashed.exists() {
            fs::remove_file(entry.path())?;
        } else {
            fs::rename(entry.path(), hashed)?;
        }
    }
    Ok(())
}

/// The corpus of one (task, harness) pair.
pub struct Corpus {
    node_local: NodeLocal,
    local_dir: PathBuf,
}

impl Corpus {
    /// Open (and create if needed) the corpus under
    /// `<root>/<base>/<task_id>/corpus/<harness_name>`.
    pub fn new(
        node_local: NodeLocal,
        base: &str,
        task_id: &str,
        harness_name: &str,
    ) -> Result<Self> {
        let local_dir = node_local
            .root()
            .join(base)
            .join(task_id)
            .join("corpus")
            .join(harness_name);
        fs::create_dir_all(&local_dir)?;
        let corpus = Self {
            node_local,
            local_dir,
        };
        fs::create_dir_all(corpus.remote_dir()?)?;
        Ok(corpus)
    }

    pub fn path(&self) -> &Path {
        &self.local_dir
    }

    pub fn remote_dir(&self) -> Result<PathBuf> {
        self.node_local.remote_path(&self.local_dir)
    }

    /// Give every new local file its content-hash name.
    pub fn hash_new_corpus(&self) -> Result<()> {
        hash_corpus_dir(&self.local_dir)
    }

    pub fn list_local_corpus(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.local_dir)
    }

    pub fn list_remote_corpus(&self) -> Result<Vec<PathBuf>> {
        list_files(&self.remote_dir()?)
    }

    /// Names of hashed local files.
    pub fn local_hashed_names(&self) -> Result<HashSet<String>> {
        Ok(hashed_names(&self.list_local_corpus()?))
    }

    /// Names of hashed remote files.
    pub fn remote_hashed_names(&self) -> Result<HashSet<String>> {
        Ok(hashed_names(&self.list_remote_corpus()?))
    }

    /// Stage every remote file that is missing locally.
    pub fn sync_from_remote(&self) -> Result<()> {
        for remote_file in self.list_remote_corpus()? {
            let Some(name) = file_name(&remote_file) else {
                continue;
            };
            let local = self.local_dir.join(&name);
            if local.exists() {
                continue;
            }
            if let Err(e) = self.node_local.make_locally_available(&local) {
                warn!("Failed to stage corpus file {}: {}", name, e);
            }
        }
        Ok(())
    }

    /// Publish specific local files to the remote tree. Content-addressed
    /// names make concurrent publication idempotent.
    pub fn sync_specific_files_to_remote<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize> {
        let remote_dir = self.remote_dir()?;
        let mut pushed = 0;
        for name in names {
            let local = self.local_dir.join(name);
            let remote = remote_dir.join(name);
            if remote.exists() {
                continue;
            }
            let mut src = File::open(&local)?;
            let mut tmp = NamedTempFile::new_in(&remote_dir)?;
            io::copy(&mut src, tmp.as_file_mut())?;
            let tmp_path = tmp.into_temp_path().keep().map_err(|e| e.error)?;
            if self.node_local.rename_atomically(&tmp_path, &remote)?.is_none() {
                let _ = fs::remove_file(&tmp_path);
            }
            pushed += 1;
        }
        Ok(pushed)
    }

    pub fn remove_local_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.local_dir.join(name))?;
        Ok(())
    }

    /// Copy a local corpus file into a staging directory.
    pub fn stage_into(&self, name: &str, dir: &Path) -> Result<()> {
        fs::copy(self.local_dir.join(name), dir.join(name))?;
        Ok(())
    }
}

/// Crash inputs for one (task, harness), named
/// `<crash_token>_<sanitizer>_<content_hash>` so related variants can be
/// listed by token.
pub struct CrashDir {
    node_local: NodeLocal,
    local_dir: PathBuf,
}

impl CrashDir {
    pub fn new(
        node_local: NodeLocal,
        base: &str,
        task_id: &str,
        harness_name: &str,
    ) -> Result<Self> {
        let local_dir = node_local
            .root()
            .join(base)
            .join(task_id)
            .join("crashes")
            .join(harness_name);
        fs::create_dir_all(&local_dir)?;
        let dir = Self {
            node_local,
            local_dir,
        };
        fs::create_dir_all(dir.node_local.remote_path(&dir.local_dir)?)?;
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.local_dir
    }

    /// Store a crash input locally and publish it remotely. Returns the
    /// remote path other nodes can stage from.
    pub fn store(&self, crash_token: &str, sanitizer: &str, input: &Path) -> Result<PathBuf> {
        let content_hash = hash_file(input)?;
        let name = format!("{crash_token}_{sanitizer}_{content_hash}");
        let local = self.local_dir.join(&name);
        if !local.exists() {
            fs::copy(input, &local)?;
        }

        let remote_dir = self.node_local.remote_path(&self.local_dir)?;
        let remote = remote_dir.join(&name);
        if !remote.exists() {
            let mut src = File::open(&local)?;
            let mut tmp = NamedTempFile::new_in(&remote_dir)?;
            io::copy(&mut src, tmp.as_file_mut())?;
            let tmp_path = tmp.into_temp_path().keep().map_err(|e| e.error)?;
            if self.node_local.rename_atomically(&tmp_path, &remote)?.is_none() {
                let _ = fs::remove_file(&tmp_path);
            }
        }
        Ok(remote)
    }

    /// Crash inputs sharing a (token, sanitizer) pair. With `get_remote`,
    /// other nodes' crashes are staged in first.
    pub fn list_crashes_for_token(
        &self,
        crash_token: &str,
        sanitizer: &str,
        get_remote: bool,
    ) -> Result<Vec<PathBuf>> {
        if get_remote {
            let remote_dir = self.node_local.remote_path(&self.local_dir)?;
            for remote_file in list_files(&remote_dir)? {
                let Some(name) = file_name(&remote_file) else {
                    continue;
                };
                let local = self.local_dir.join(&name);
                if !local.exists() {
                    if let Err(e) = self.node_local.make_locally_available(&local) {
                        debug!("Failed to stage crash {}: {}", name, e);
                    }
                }
            }
        }
        let prefix = format!("{crash_token}_{sanitizer}_");
        let mut matches: Vec<PathBuf> = list_files(&self.local_dir)?
            .into_iter()
            .filter(|p| file_name(p).is_some_and(|n| n.starts_with(&prefix)))
            .collect();
        matches.sort();
        Ok(matches)
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn hashed_names(paths: &[PathBuf]) -> HashSet<String> {
    paths
        .iter()
        .filter_map(|p| file_name(p))
        .filter(|n| has_hashed_name(n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, TempDir, NodeLocal) {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let nl = NodeLocal::new(local.path().to_path_buf())
            .with_remote_root(remote.path().to_path_buf());
        (local, remote, nl)
    }

    #[test]
    fn recognizes_hashed_names() {
        assert!(has_hashed_name(&"a".repeat(64)));
        assert!(!has_hashed_name("crash-1234"));
        assert!(!has_hashed_name(&"A".repeat(64)));
        assert!(!has_hashed_name(&"a".repeat(63)));
    }

    #[test]
    fn hash_new_corpus_renames_in_place() {
        let (_l, _r, nl) = fixture();
        let corpus = Corpus::new(nl, "crs", "t1", "h1").unwrap();
        fs::write(corpus.path().join("crash-abc"), b"seed one").unwrap();

        corpus.hash_new_corpus().unwrap();

        let names = corpus.local_hashed_names().unwrap();
        assert_eq!(names.len(), 1);
        let name = names.iter().next().unwrap();
        assert_eq!(*name, hash_file(&corpus.path().join(name)).unwrap());
    }

    #[test]
    fn hash_new_corpus_drops_duplicate_content() {
        let (_l, _r, nl) = fixture();
        let corpus = Corpus::new(nl, "crs", "t1", "h1").unwrap();
        fs::write(corpus.path().join("a"), b"same").unwrap();
        fs::write(corpus.path().join("b"), b"same").unwrap();

        corpus.hash_new_corpus().unwrap();

        assert_eq!(corpus.list_local_corpus().unwrap().len(), 1);
    }

    #[test]
    fn sync_round_trip() {
        let (_l, _r, nl) = fixture();
        let corpus = Corpus::new(nl, "crs", "t1", "h1").unwrap();
        fs::write(corpus.path().join("seed"), b"content").unwrap();
        corpus.hash_new_corpus().unwrap();
        let name = corpus.local_hashed_names().unwrap().into_iter().next().unwrap();

        corpus.sync_specific_files_to_remote([name.as_str()]).unwrap();
        assert!(corpus.remote_hashed_names().unwrap().contains(&name));

        corpus.remove_local_file(&name).unwrap();
        assert!(corpus.local_hashed_names().unwrap().is_empty());

        corpus.sync_from_remote().unwrap();
        assert!(corpus.local_hashed_names().unwrap().contains(&name));
    }

    #[test]
    fn crash_dir_lists_by_token_and_sanitizer() {
        let (_l, _r, nl) = fixture();
        let crash_dir = CrashDir::new(nl, "crs", "t1", "h1").unwrap();
        let input = crash_dir.path().parent().unwrap().join("raw_input");
        fs::write(&input, b"boom").unwrap();

        crash_dir.store("tok1", "address", &input).unwrap();
        crash_dir.store("tok2", "address", &input).unwrap();

        let matches = crash_dir
            .list_crashes_for_token("tok1", "address", false)
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert!(file_name(&matches[0]).unwrap().starts_with("tok1_address_"));

        assert!(crash_dir
            .list_crashes_for_token("tok1", "memory", false)
            .unwrap()
            .is_empty());
    }
}
