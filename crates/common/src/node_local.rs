//! Node-local staging of shared-filesystem artifacts.
//!
//! The shared filesystem ("remote") is visible to every node; each node
//! mirrors the artifacts it needs under its own root directory ("local",
//! `NODE_DATA_DIR`). Every promotion goes through a scratch file on the
//! destination filesystem followed by an atomic rename, so a reader that
//! observes a published path sees either a complete artifact or nothing.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{CommonError, Result};

/// A scoped temporary directory. Deleted on drop unless committed.
#[derive(Debug)]
pub struct TmpDir {
    path: PathBuf,
    committed: bool,
}

impl TmpDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory on disk and return its path.
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.path.clone()
    }
}

impl Drop for TmpDir {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Handle to the node-local root, resolved once at process init.
#[derive(Debug, Clone)]
pub struct NodeLocal {
    root: PathBuf,
    remote_root: PathBuf,
}

impl NodeLocal {
    /// Resolve the root from `NODE_DATA_DIR`. Missing configuration is
    /// fatal at startup.
    pub fn from_env() -> Result<Self> {
        let root = std::env::var("NODE_DATA_DIR").map_err(|_| {
            CommonError::Configuration("NODE_DATA_DIR environment variable is not defined".into())
        })?;
        Ok(Self::new(PathBuf::from(root)))
    }

    /// Use an explicit root. The shared filesystem is addressed by the
    /// path that remains after stripping the root prefix.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            remote_root: PathBuf::from("/"),
        }
    }

    /// Override where the shared filesystem is mounted (tests).
    pub fn with_remote_root(mut self, remote_root: PathBuf) -> Self {
        self.remote_root = remote_root;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared-filesystem path corresponding to a node-local path.
    pub fn remote_path(&self, local: &Path) -> Result<PathBuf> {
        let rel = local
            .strip_prefix(&self.root)
            .map_err(|_| CommonError::NotNodeLocal(local.to_path_buf()))?;
        Ok(self.remote_root.join(rel))
    }

    /// Shared-filesystem path of the `.tgz` archive form of a local dir.
    pub fn remote_archive_path(&self, local: &Path) -> Result<PathBuf> {
        let remote = self.remote_path(local)?;
        Ok(archive_name(&remote))
    }

    /// Node-local path corresponding to a shared-filesystem path. Paths
    /// already under the local root are returned unchanged.
    pub fn local_path(&self, path: &Path) -> PathBuf {
        if path.starts_with(&self.root) {
            return path.to_path_buf();
        }
        match path.strip_prefix(&self.remote_root) {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(path.to_string_lossy().trim_start_matches('/')),
        }
    }

    /// The node-local scratch root. Created on first use.
    pub fn scratch_path(&self) -> Result<PathBuf> {
        let scratch = self.root.join("scratch");
        if !scratch.exists() {
            fs::create_dir_all(&scratch)?;
        }
        Ok(scratch)
    }

    /// A fresh scoped directory under scratch.
    pub fn scratch_dir(&self) -> Result<TmpDir> {
        let dir = tempfile::Builder::new()
            .prefix("scratch-")
            .tempdir_in(self.scratch_path()?)?;
        Ok(TmpDir {
            path: dir.into_path(),
            committed: false,
        })
    }

    /// A temp file under local scratch, deleted on drop unless persisted.
    pub fn local_scratch_file(&self) -> Result<NamedTempFile> {
        Ok(NamedTempFile::new_in(self.scratch_path()?)?)
    }

    /// A temp file on the remote filesystem, next to where `local`'s
    /// remote counterpart will be published.
    pub fn remote_scratch_file(&self, local: &Path) -> Result<NamedTempFile> {
        let remote = self.remote_path(local)?;
        let parent = remote
            .parent()
            .ok_or_else(|| CommonError::NotNodeLocal(local.to_path_buf()))?;
        fs::create_dir_all(parent)?;
        Ok(NamedTempFile::new_in(parent)?)
    }

    /// Rename `src` onto `dst`. Returns `None` when the destination already
    /// exists (another worker won the race; the destination is valid).
    /// Any other failure propagates.
    pub fn rename_atomically(&self, src: &Path, dst: &Path) -> Result<Option<PathBuf>> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(src, dst) {
            Ok(()) => Ok(Some(dst.to_path_buf())),
            Err(e) if destination_exists(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure a shared-filesystem file is present at its node-local path.
    /// Accepts either form of the path. Idempotent and safe under races.
    pub fn make_locally_available(&self, path: &Path) -> Result<PathBuf> {
        let local = self.local_path(path);
        if local.exists() {
            return Ok(local);
        }
        let remote = self.remote_path(&local)?;
        let parent = local
            .parent()
            .ok_or_else(|| CommonError::NotNodeLocal(local.clone()))?;
        fs::create_dir_all(parent)?;

        // Stage on the same filesystem as the destination, then rename.
        let mut remote_file = File::open(&remote)?;
        let mut scratch = NamedTempFile::new_in(parent)?;
        io::copy(&mut remote_file, scratch.as_file_mut())?;
        let tmp_path = scratch.into_temp_path().keep().map_err(|e| e.error)?;
        if self.rename_atomically(&tmp_path, &local)?.is_none() {
            let _ = fs::remove_file(&tmp_path);
        }
        Ok(local)
    }

    /// Ensure the unpacked form of a remote `.tgz` archive is present at
    /// the node-local directory path.
    pub fn remote_archive_to_dir(&self, local_dir: &Path) -> Result<PathBuf> {
        if local_dir.exists() {
            return Ok(local_dir.to_path_buf());
        }
        let archive = self.remote_archive_path(local_dir)?;
        let unpack_dir = self.scratch_dir()?;

        let file = File::open(&archive)?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        tar.unpack(unpack_dir.path())?;

        let staged = unpack_dir.commit();
        if self.rename_atomically(&staged, local_dir)?.is_none() {
            debug!("Lost unpack race for {}", local_dir.display());
            let _ = fs::remove_dir_all(&staged);
        }
        Ok(local_dir.to_path_buf())
    }

    /// Publish a local directory to the shared filesystem in `.tgz` form.
    /// Returns the remote archive path.
    pub fn dir_to_remote_archive(&self, local_dir: &Path) -> Result<PathBuf> {
        let remote_archive = self.remote_archive_path(local_dir)?;

        // Build the archive in local scratch first.
        let mut local_tmp = self.local_scratch_file()?;
        {
            let encoder = GzEncoder::new(local_tmp.as_file_mut(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(".", local_dir)?;
            builder.into_inner()?.finish()?;
        }

        // Stream to a scratch file on the remote filesystem, then rename.
        let mut archive_reader = local_tmp.reopen()?;
        let mut remote_tmp = self.remote_scratch_file(local_dir)?;
        io::copy(&mut archive_reader, remote_tmp.as_file_mut())?;
        let tmp_path = remote_tmp.into_temp_path().keep().map_err(|e| e.error)?;
        if self.rename_atomically(&tmp_path, &remote_archive)?.is_none() {
            debug!("Lost archive race for {}", remote_archive.display());
            let _ = fs::remove_file(&tmp_path);
        }
        Ok(remote_archive)
    }
}

/// `<path>.tgz`, appended to whatever extension the path already has.
fn archive_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tgz");
    PathBuf::from(name)
}

fn destination_exists(e: &io::Error) -> bool {
    // ENOTEMPTY (39) is how rename reports an existing non-empty directory
    e.kind() == io::ErrorKind::AlreadyExists || e.raw_os_error() == Some(39)
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
    fn remote_path_strips_root() {
        let (_local, _remote, nl) = fixture();
        let local_file = nl.root().join("sample/path");
        let remote = nl.remote_path(&local_file).unwrap();
        assert!(remote.ends_with("sample/path"));
        assert!(!remote.starts_with(nl.root()));
    }

    #[test]
    fn remote_path_rejects_foreign_paths() {
        let (_local, _remote, nl) = fixture();
        assert!(matches!(
            nl.remote_path(Path::new("/some/other/path")),
            Err(CommonError::NotNodeLocal(_))
        ));
    }

    #[test]
    fn archive_path_appends_tgz() {
        let (_local, _remote, nl) = fixture();
        let local_dir = nl.root().join("tasks/t1");
        let archive = nl.remote_archive_path(&local_dir).unwrap();
        assert_eq!(archive.extension().unwrap(), "tgz");
    }

    #[test]
    fn scratch_dir_removed_on_drop() {
        let (_local, _remote, nl) = fixture();
        let path = {
            let tmp = nl.scratch_dir().unwrap();
            tmp.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn committed_scratch_dir_survives() {
        let (_local, _remote, nl) = fixture();
        let tmp = nl.scratch_dir().unwrap();
        let path = tmp.commit();
        assert!(path.exists());
    }

    #[test]
    fn rename_atomically_reports_lost_race_for_dirs() {
        let (_local, _remote, nl) = fixture();
        let src = nl.root().join("src_dir");
        let dst = nl.root().join("dst_dir");
        fs::create_dir_all(src.join("inner")).unwrap();
        fs::create_dir_all(dst.join("other")).unwrap();
        fs::write(dst.join("other/file"), b"x").unwrap();

        let result = nl.rename_atomically(&src, &dst).unwrap();
        assert!(result.is_none());
        // The destination still holds the winner's content
        assert!(dst.join("other/file").exists());
    }

    #[test]
    fn make_locally_available_stages_remote_file() {
        let (_local, remote, nl) = fixture();
        fs::create_dir_all(remote.path().join("povs")).unwrap();
        fs::write(remote.path().join("povs/input"), b"crash bytes").unwrap();

        let staged = nl
            .make_locally_available(&nl.root().join("povs/input"))
            .unwrap();
        assert_eq!(fs::read(&staged).unwrap(), b"crash bytes");

        // Second call is a no-op hit on the local copy
        let again = nl.make_locally_available(&staged).unwrap();
        assert_eq!(again, staged);
    }

    #[test]
    fn make_locally_available_accepts_remote_form() {
        let (_local, remote, nl) = fixture();
        fs::create_dir_all(remote.path().join("povs")).unwrap();
        fs::write(remote.path().join("povs/pov1"), b"abc").unwrap();

        let staged = nl
            .make_locally_available(&remote.path().join("povs/pov1"))
            .unwrap();
        assert!(staged.starts_with(nl.root()));
        assert_eq!(fs::read(&staged).unwrap(), b"abc");
    }

    #[test]
    fn archive_round_trip_is_atomic_at_destination() {
        let (_local, _remote, nl) = fixture();
        let src_dir = nl.root().join("tasks/t1");
        fs::create_dir_all(src_dir.join("src")).unwrap();
        fs::write(src_dir.join("src/main.c"), b"int main(){}").unwrap();

        nl.dir_to_remote_archive(&src_dir).unwrap();

        // Simulate a second node staging the archive
        let other_root = TempDir::new().unwrap();
        let other = NodeLocal::new(other_root.path().to_path_buf())
            .with_remote_root(nl.remote_root.clone());
        let restored = other
            .remote_archive_to_dir(&other.root().join("tasks/t1"))
            .unwrap();
        assert_eq!(
            fs::read(restored.join("src/main.c")).unwrap(),
            b"int main(){}"
        );
    }
}
