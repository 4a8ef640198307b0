//! Images waiting to be attached to the subject's next text message.
//!
//! Every file handed to the store is deleted exactly once: when it is replaced, when it
//! expires, or when whoever took it calls [`PendingImage::discard`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use mpgate_core::current_unix_timestamp_ms;
use tracing::debug;

pub const DEFAULT_PENDING_IMAGE_TTL_MS: u64 = 5 * 60 * 1_000;

#[derive(Debug, PartialEq, Eq)]
pub struct PendingImage {
    pub file_path: PathBuf,
    pub timestamp_unix_ms: u64,
}

impl PendingImage {
    /// Deletes the downloaded file.
    pub fn discard(self) {
        discard_file(&self.file_path);
    }
}

#[derive(Debug)]
pub struct PendingImageStore {
    ttl_ms: u64,
    entries: Mutex<HashMap<String, PendingImage>>,
}

impl Default for PendingImageStore {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_IMAGE_TTL_MS)
    }
}

impl PendingImageStore {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, subject: &str, file_path: PathBuf) {
        self.insert_at(subject, file_path, current_unix_timestamp_ms());
    }

    /// Replaces the subject's pending image and prunes expired entries of every subject.
    pub fn insert_at(&self, subject: &str, file_path: PathBuf, now_ms: u64) {
        let mut discarded = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|_, image| {
                let stale = self.is_stale(image, now_ms);
                if stale {
                    discarded.push(image.file_path.clone());
                }
                !stale
            });
            let previous = entries.insert(
                subject.to_string(),
                PendingImage {
                    file_path: file_path.clone(),
                    timestamp_unix_ms: now_ms,
                },
            );
            if let Some(previous) = previous {
                if previous.file_path != file_path {
                    discarded.push(previous.file_path);
                }
            }
        }
        if !discarded.is_empty() {
            debug!(count = discarded.len(), "discarding replaced or expired pending images");
        }
        for path in discarded {
            discard_file(&path);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self, subject: &str) -> Option<PendingImage> {
        self.take_at(subject, current_unix_timestamp_ms())
    }

    /// Always removes the entry; returns it only while it is inside the expiry window.
    pub fn take_at(&self, subject: &str, now_ms: u64) -> Option<PendingImage> {
        let image = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subject)?;
        if self.is_stale(&image, now_ms) {
            debug!(
                subject,
                path = %image.file_path.display(),
                "discarding expired pending image"
            );
            discard_file(&image.file_path);
            return None;
        }
        Some(image)
    }

    fn is_stale(&self, image: &PendingImage, now_ms: u64) -> bool {
        now_ms.saturating_sub(image.timestamp_unix_ms) > self.ttl_ms
    }
}

fn discard_file(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        debug!(path = %path.display(), %error, "pending image file already gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functional_fresh_image_is_taken_once() {
        let store = PendingImageStore::default();
        store.insert_at("wx:o-user", PathBuf::from("/tmp/none.jpg"), 1_000);
        assert_eq!(store.len(), 1);
        let image = store.take_at("wx:o-user", 2_000).expect("fresh");
        assert_eq!(image.file_path, PathBuf::from("/tmp/none.jpg"));
        assert!(store.take_at("wx:o-user", 2_000).is_none());
    }

    #[test]
    fn regression_expired_image_is_removed_and_deleted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("pic.jpg");
        std::fs::write(&file, b"jpeg").expect("write");

        let store = PendingImageStore::new(1_000);
        store.insert_at("wx:o-user", file.clone(), 0);
        assert!(store.take_at("wx:o-user", 1_001).is_none());
        assert!(!file.exists());
        assert!(store.take_at("wx:o-user", 0).is_none());
    }

    #[test]
    fn unit_replacing_image_deletes_previous_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("a.jpg");
        let second = temp.path().join("b.jpg");
        std::fs::write(&first, b"a").expect("write");
        std::fs::write(&second, b"b").expect("write");

        let store = PendingImageStore::default();
        store.insert_at("s", first.clone(), 0);
        store.insert_at("s", second.clone(), 10);
        assert!(!first.exists());
        assert_eq!(store.take_at("s", 20).expect("image").file_path, second);
    }

    #[test]
    fn regression_insert_prunes_expired_images_of_other_subjects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let abandoned = temp.path().join("abandoned.jpg");
        let fresh = temp.path().join("fresh.jpg");
        std::fs::write(&abandoned, b"old").expect("write");
        std::fs::write(&fresh, b"new").expect("write");

        let store = PendingImageStore::new(1_000);
        store.insert_at("wx:gone", abandoned.clone(), 0);
        store.insert_at("wx:active", fresh.clone(), 5_000);
        assert!(!abandoned.exists());
        assert!(fresh.exists());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unit_discard_deletes_taken_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("pic.jpg");
        std::fs::write(&file, b"jpeg").expect("write");
        let store = PendingImageStore::default();
        store.insert_at("s", file.clone(), 0);
        store.take_at("s", 1).expect("image").discard();
        assert!(!file.exists());
        assert!(store.is_empty());
    }
}
