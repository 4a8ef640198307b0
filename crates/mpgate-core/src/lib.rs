//! Foundational persistence utilities shared across mpgate crates.
//!
//! Provides atomic file writes, versioned JSON documents with a process-local cache,
//! advisory marker-file locks, and time helpers used for expiry calculations.

pub mod atomic_io;
pub mod file_lock;
pub mod json_store;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use file_lock::{
    acquire_file_lock, lock_path_for, with_file_lock, FileLockError, FileLockGuard,
    FileLockPolicy,
};
pub use json_store::{
    document_schema_version, read_json_or_default, write_json_atomic, JsonDocumentStore,
    LockedDocument, VersionedDocument, DOCUMENT_SCHEMA_VERSION,
};
pub use time_utils::{current_unix_timestamp_ms, deadline_unix_ms, is_expired_unix_ms};
