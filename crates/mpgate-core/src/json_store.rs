//! Versioned JSON documents persisted with atomic writes.
//!
//! Reads never fail: a missing file yields the default document, and an unreadable,
//! unparseable, or version-mismatched file is logged and replaced by the default.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::atomic_io::write_text_atomic;
use crate::file_lock::{acquire_file_lock, with_file_lock, FileLockGuard, FileLockPolicy};

/// Schema version written by every persisted document.
pub const DOCUMENT_SCHEMA_VERSION: u32 = 1;

pub fn document_schema_version() -> u32 {
    DOCUMENT_SCHEMA_VERSION
}

/// A persisted document carrying a `version` field.
pub trait VersionedDocument:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn schema_version(&self) -> u32;
}

/// Loads a document, falling back to `T::default()` on any failure.
pub fn read_json_or_default<T: VersionedDocument>(path: &Path) -> T {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "document missing; using default");
            return T::default();
        }
        Err(error) => {
            error!(path = %path.display(), %error, "failed to read document; using default");
            return T::default();
        }
    };
    if raw.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str::<T>(&raw) {
        Ok(document) if document.schema_version() == DOCUMENT_SCHEMA_VERSION => document,
        Ok(document) => {
            error!(
                path = %path.display(),
                found = document.schema_version(),
                expected = DOCUMENT_SCHEMA_VERSION,
                "unsupported document schema version; using default"
            );
            T::default()
        }
        Err(error) => {
            error!(path = %path.display(), %error, "failed to parse document; using default");
            T::default()
        }
    }
}

/// Serializes `value` as pretty JSON and replaces `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(value).context("failed to serialize document")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
        .with_context(|| format!("failed to write document {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileFingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

fn fingerprint(path: &Path) -> Option<FileFingerprint> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(FileFingerprint {
        modified: metadata.modified().ok(),
        len: metadata.len(),
    })
}

struct CachedDocument<T> {
    fingerprint: Option<FileFingerprint>,
    document: T,
}

/// One JSON document on disk with a process-local cache and locked mutations.
///
/// Reads bypass the lock and reuse the cached copy while the file's size and mtime are
/// unchanged. Updates take the advisory lock, re-read from disk, mutate, and write back.
pub struct JsonDocumentStore<T> {
    path: PathBuf,
    lock_policy: FileLockPolicy,
    cache: Mutex<Option<CachedDocument<T>>>,
}

impl<T: VersionedDocument> JsonDocumentStore<T> {
    pub fn new(path: impl Into<PathBuf>, lock_policy: FileLockPolicy) -> Self {
        Self {
            path: path.into(),
            lock_policy,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> T {
        let current = fingerprint(&self.path);
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.as_ref() {
                if cached.fingerprint == current {
                    return cached.document.clone();
                }
            }
        }
        let document = read_json_or_default::<T>(&self.path);
        self.remember(current, &document);
        document
    }

    pub async fn update<R, F>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        with_file_lock(&self.path, self.lock_policy, move || async move {
            let mut document = read_json_or_default::<T>(&self.path);
            let outcome = mutate(&mut document);
            write_json_atomic(&self.path, &document)?;
            self.remember(fingerprint(&self.path), &document);
            Ok(outcome)
        })
        .await
    }

    /// Takes the document lock and a fresh copy for a critical section that spans awaits.
    /// Changes are discarded unless [`LockedDocument::commit`] is called.
    pub async fn lock(&self) -> Result<LockedDocument<'_, T>> {
        let guard = acquire_file_lock(&self.path, self.lock_policy).await?;
        let document = read_json_or_default::<T>(&self.path);
        Ok(LockedDocument {
            store: self,
            _guard: guard,
            document,
        })
    }

    fn remember(&self, fingerprint: Option<FileFingerprint>, document: &T) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedDocument {
                fingerprint,
                document: document.clone(),
            });
        }
    }
}

/// A document read under its advisory lock; the lock is released on drop.
pub struct LockedDocument<'a, T: VersionedDocument> {
    store: &'a JsonDocumentStore<T>,
    _guard: FileLockGuard,
    pub document: T,
}

impl<T: VersionedDocument> LockedDocument<'_, T> {
    pub fn commit(self) -> Result<()> {
        write_json_atomic(&self.store.path, &self.document)?;
        self.store.remember(fingerprint(&self.store.path), &self.document);
        Ok(())
    }
}
