use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// Mirror directory receiving evicted files and buckets.
///
/// Eviction is a rename, so the source and the bin must live on the same
/// volume. An existing entry with the same leaf name is replaced.
#[derive(Clone, Debug)]
pub struct RecycleBin {
    root: PathBuf,
}

impl RecycleBin {
    pub fn open(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PipelineError::filesystem(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `path` lands once evicted.
    pub fn destination(&self, path: &Path) -> PipelineResult<PathBuf> {
        let leaf = path.file_name().ok_or_else(|| {
            PipelineError::filesystem(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;
        Ok(self.root.join(leaf))
    }

    /// Move a file or directory into the bin.
    pub fn evict(&self, path: &Path) -> PipelineResult<PathBuf> {
        let dest = self.destination(path)?;
        if dest.exists() {
            let removed = if dest.is_dir() {
                fs::remove_dir_all(&dest)
            } else {
                fs::remove_file(&dest)
            };
            removed.map_err(|e| PipelineError::filesystem(&dest, e))?;
        }
        fs::rename(path, &dest).map_err(|e| PipelineError::filesystem(path, e))?;
        log::debug!("recycled {} -> {}", path.display(), dest.display());
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evict_moves_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let bin = RecycleBin::open(dir.path().join("bin")).unwrap();

        let file = dir.path().join("a.bmp");
        fs::write(&file, b"first").unwrap();
        let dest = bin.evict(&file).unwrap();
        assert!(!file.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"first");

        fs::write(&file, b"second").unwrap();
        bin.evict(&file).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");
    }

    #[test]
    fn evict_moves_directories() {
        let dir = tempfile::tempdir().unwrap();
        let bin = RecycleBin::open(dir.path().join("bin")).unwrap();
        let bucket = dir.path().join("20240101-000000");
        fs::create_dir(&bucket).unwrap();
        fs::write(bucket.join("x.bmp"), b"x").unwrap();

        // stale copy from an earlier run
        fs::create_dir(bin.root().join("20240101-000000")).unwrap();

        let dest = bin.evict(&bucket).unwrap();
        assert!(dest.join("x.bmp").exists());
        assert!(!bucket.exists());
    }

    #[test]
    fn missing_source_is_a_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let bin = RecycleBin::open(dir.path().join("bin")).unwrap();
        let err = bin.evict(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, PipelineError::Filesystem { .. }));
    }
}
