//! Rotating on-disk frame storage.
//!
//! Layout: `<root>/<rotation key>/<file>`, where the rotation key is the
//! local time truncated to the rotation interval (`%Y%m%d-%H%M%S`).
//! Two quotas bound the current bucket (item count, then cumulative bytes)
//! and a third bounds how many buckets are kept. Anything over a bound is
//! moved into the recycle bin, oldest first. Nothing is ever deleted here.

mod bucket;
mod image_file;
mod recycle;
mod writer;

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Local};

pub use bucket::{RetainedItem, RotationBucket};
pub use image_file::{save_converted, save_raw, ImageFormat, RawArchive};
pub use recycle::RecycleBin;
pub use writer::{StorageWriter, WriteLevel, WriterConfig};

use crate::error::{PipelineError, PipelineResult};

/// Bounds enforced by a [`BucketStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_retained_rotations: usize,
    pub max_item_count: usize,
    pub max_total_bytes: u64,
    /// Rotation granularity in seconds.
    pub rotation_interval_secs: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_retained_rotations: 10,
            max_item_count: 30_000,
            max_total_bytes: 30 * 1024 * 1024 * 1024,
            rotation_interval_secs: 1,
        }
    }
}

/// Rotate/Write/Evict state machine over the current bucket.
pub struct BucketStore {
    root: PathBuf,
    limits: StoreLimits,
    recycle: RecycleBin,
    current: Option<RotationBucket>,
    history: VecDeque<PathBuf>,
}

impl BucketStore {
    pub fn open(
        root: impl Into<PathBuf>,
        recycle_root: impl Into<PathBuf>,
        limits: StoreLimits,
    ) -> PipelineResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PipelineError::filesystem(&root, e))?;
        let recycle = RecycleBin::open(recycle_root)?;
        Ok(Self {
            root,
            limits,
            recycle,
            current: None,
            history: VecDeque::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    pub fn recycle_bin(&self) -> &RecycleBin {
        &self.recycle
    }

    pub fn current(&self) -> Option<&RotationBucket> {
        self.current.as_ref()
    }

    /// Retained bucket directories, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Path> {
        self.history.iter().map(PathBuf::as_path)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Directory key for `now`.
    pub fn rotation_key(&self, now: DateTime<Local>) -> String {
        let interval = self.limits.rotation_interval_secs.max(1) as i64;
        let secs = now.timestamp();
        let excess = secs.rem_euclid(interval);
        let bucket_start = now - ChronoDuration::seconds(excess);
        bucket_start.format("%Y%m%d-%H%M%S").to_string()
    }

    /// Switch to the bucket for `now`, creating it if needed.
    ///
    /// Returns true when a new directory was created. Calling again with a
    /// time in the same interval is a no-op.
    pub fn rotate(&mut self, now: DateTime<Local>) -> PipelineResult<bool> {
        let key = self.rotation_key(now);
        if self.current.as_ref().map(RotationBucket::key) == Some(key.as_str()) {
            return Ok(false);
        }

        let path = self.root.join(&key);
        if path.exists() {
            if self.current.is_none() {
                log::info!("resuming existing bucket {}", path.display());
                self.history.push_back(path.clone());
                self.current = Some(RotationBucket::new(key, path, now));
                self.enforce_history();
            }
            return Ok(false);
        }

        fs::create_dir_all(&path).map_err(|e| PipelineError::filesystem(&path, e))?;
        log::debug!("rotated to {}", path.display());
        self.history.push_back(path.clone());
        self.current = Some(RotationBucket::new(key, path, now));
        self.enforce_history();
        Ok(true)
    }

    fn enforce_history(&mut self) {
        while self.history.len() > self.limits.max_retained_rotations {
            let Some(oldest) = self.history.pop_front() else {
                break;
            };
            if let Err(e) = self.recycle.evict(&oldest) {
                log::error!("failed to recycle bucket: {}", e);
            }
        }
    }

    /// Write `file_name` into the current bucket using `encode`, record it,
    /// then enforce the count quota and the byte quota.
    pub fn write_with<F>(&mut self, file_name: &str, encode: F) -> PipelineResult<PathBuf>
    where
        F: FnOnce(&Path) -> PipelineResult<()>,
    {
        let bucket = self.current.as_mut().ok_or_else(|| {
            PipelineError::filesystem(
                &self.root,
                io::Error::new(io::ErrorKind::NotFound, "no current rotation bucket"),
            )
        })?;
        let path = bucket.path().join(file_name);
        encode(&path)?;
        let byte_size = fs::metadata(&path)
            .map_err(|e| PipelineError::filesystem(&path, e))?
            .len();
        bucket.push(RetainedItem {
            path: path.clone(),
            byte_size,
        });
        self.enforce_quotas();
        Ok(path)
    }

    fn enforce_quotas(&mut self) {
        let Some(bucket) = self.current.as_mut() else {
            return;
        };
        while bucket.len() > self.limits.max_item_count {
            if let Some(item) = bucket.pop_oldest() {
                evict_item(&self.recycle, &item);
            }
        }
        while bucket.cumulative_bytes() > self.limits.max_total_bytes {
            match bucket.pop_oldest() {
                Some(item) => evict_item(&self.recycle, &item),
                None => break,
            }
        }
    }
}

fn evict_item(recycle: &RecycleBin, item: &RetainedItem) {
    if let Err(e) = recycle.evict(&item.path) {
        log::error!("failed to recycle {}: {}", item.path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 5, 12, 0, 0)
            .single()
            .unwrap()
            + ChronoDuration::seconds(secs as i64)
    }

    fn store(dir: &Path, limits: StoreLimits) -> BucketStore {
        BucketStore::open(dir.join("root"), dir.join("root/recycle_bin"), limits).unwrap()
    }

    fn write_bytes(store: &mut BucketStore, name: &str, size: usize) -> PathBuf {
        store
            .write_with(name, |path| {
                fs::write(path, vec![0u8; size]).map_err(|e| PipelineError::filesystem(path, e))
            })
            .unwrap()
    }

    #[test]
    fn rotation_key_truncates_to_interval() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(
            dir.path(),
            StoreLimits {
                rotation_interval_secs: 10,
                ..StoreLimits::default()
            },
        );
        assert_eq!(s.rotation_key(at(0)), s.rotation_key(at(9)));
        assert_ne!(s.rotation_key(at(9)), s.rotation_key(at(10)));
        assert_eq!(s.rotation_key(at(0)), "20240305-120000");
    }

    #[test]
    fn rotate_is_idempotent_and_keeps_items() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path(), StoreLimits::default());
        assert!(s.rotate(at(0)).unwrap());
        write_bytes(&mut s, "a.bin", 10);
        assert!(!s.rotate(at(0)).unwrap());
        assert_eq!(s.current().unwrap().len(), 1);
        assert_eq!(s.history_len(), 1);
    }

    #[test]
    fn write_without_bucket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path(), StoreLimits::default());
        let err = s.write_with("x", |_| Ok(())).unwrap_err();
        assert!(matches!(err, PipelineError::Filesystem { .. }));
    }

    #[test]
    fn existing_directory_is_adopted_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path(), StoreLimits::default());
        let key = s.rotation_key(at(0));
        fs::create_dir_all(s.root().join(&key)).unwrap();
        assert!(!s.rotate(at(0)).unwrap());
        assert_eq!(s.current().unwrap().key(), key);
        assert_eq!(s.history_len(), 1);
    }

    #[test]
    fn single_oversized_item_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(
            dir.path(),
            StoreLimits {
                max_total_bytes: 100,
                ..StoreLimits::default()
            },
        );
        s.rotate(at(0)).unwrap();
        let path = write_bytes(&mut s, "big.bin", 500);
        assert!(!path.exists());
        assert!(s.recycle_bin().root().join("big.bin").exists());
        assert_eq!(s.current().unwrap().cumulative_bytes(), 0);
    }
}
