use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

/// A file written into a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetainedItem {
    pub path: PathBuf,
    pub byte_size: u64,
}

/// Output directory for one rotation interval.
#[derive(Debug)]
pub struct RotationBucket {
    key: String,
    path: PathBuf,
    created_at: DateTime<Local>,
    retained_items: VecDeque<RetainedItem>,
    cumulative_bytes: u64,
}

impl RotationBucket {
    pub(crate) fn new(key: String, path: PathBuf, created_at: DateTime<Local>) -> Self {
        Self {
            key,
            path,
            created_at,
            retained_items: VecDeque::new(),
            cumulative_bytes: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    /// Items in write order, oldest first.
    pub fn retained_items(&self) -> impl Iterator<Item = &RetainedItem> {
        self.retained_items.iter()
    }

    pub fn len(&self) -> usize {
        self.retained_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained_items.is_empty()
    }

    pub fn cumulative_bytes(&self) -> u64 {
        self.cumulative_bytes
    }

    pub(crate) fn push(&mut self, item: RetainedItem) {
        self.cumulative_bytes += item.byte_size;
        self.retained_items.push_back(item);
    }

    pub(crate) fn pop_oldest(&mut self) -> Option<RetainedItem> {
        let item = self.retained_items.pop_front()?;
        self.cumulative_bytes = self.cumulative_bytes.saturating_sub(item.byte_size);
        Some(item)
    }
}
