//! One-shot pairing codes persisted in the pairing metadata document.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use mpgate_core::{
    deadline_unix_ms, document_schema_version, is_expired_unix_ms, FileLockPolicy,
    JsonDocumentStore, LockedDocument, VersionedDocument, DOCUMENT_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};

pub const PAIRING_CODE_LENGTH: usize = 8;
pub const PAIRING_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const DEFAULT_PAIRING_CODE_TTL_MS: u64 = 60 * 60 * 1_000;
pub const DEFAULT_MAX_PENDING_CODES_PER_ACCOUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeRecord {
    pub account_id: String,
    pub open_id: String,
    pub created_at_unix_ms: u64,
    pub expires_at_unix_ms: u64,
}

impl PairingCodeRecord {
    pub fn is_expired(&self, now_unix_ms: u64) -> bool {
        is_expired_unix_ms(self.expires_at_unix_ms, now_unix_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCodeDocument {
    #[serde(default = "document_schema_version")]
    pub version: u32,
    #[serde(default)]
    pub codes: BTreeMap<String, PairingCodeRecord>,
}

impl Default for PairingCodeDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_SCHEMA_VERSION,
            codes: BTreeMap::new(),
        }
    }
}

impl VersionedDocument for PairingCodeDocument {
    fn schema_version(&self) -> u32 {
        self.version
    }
}

impl PairingCodeDocument {
    pub fn prune_expired(&mut self, now_unix_ms: u64) -> usize {
        let before = self.codes.len();
        self.codes.retain(|_, record| !record.is_expired(now_unix_ms));
        before - self.codes.len()
    }
}

/// Normalizes user input to the stored code form; `None` when it cannot be a code.
pub fn normalize_pairing_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    let valid = code.len() == PAIRING_CODE_LENGTH
        && code.bytes().all(|byte| PAIRING_CODE_ALPHABET.contains(&byte));
    valid.then_some(code)
}

/// UUID v4 byte positions whose bits are all random; byte 6 carries the version nibble
/// and byte 8 the variant bits.
const RANDOM_UUID_BYTES: [usize; PAIRING_CODE_LENGTH] = [0, 1, 2, 3, 4, 5, 7, 9];

fn generate_pairing_code() -> String {
    let uuid = uuid::Uuid::new_v4();
    let bytes = uuid.as_bytes();
    RANDOM_UUID_BYTES
        .iter()
        .map(|index| {
            PAIRING_CODE_ALPHABET[(bytes[*index] as usize) % PAIRING_CODE_ALPHABET.len()] as char
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedPairingCode {
    pub code: String,
    pub expires_at_unix_ms: u64,
    pub reused: bool,
}

pub struct PairingCodeStore {
    store: JsonDocumentStore<PairingCodeDocument>,
    ttl_ms: u64,
    max_pending_per_account: usize,
}

impl PairingCodeStore {
    pub fn new(
        path: impl Into<PathBuf>,
        lock_policy: FileLockPolicy,
        ttl_ms: u64,
        max_pending_per_account: usize,
    ) -> Self {
        Self {
            store: JsonDocumentStore::new(path, lock_policy),
            ttl_ms: ttl_ms.max(1),
            max_pending_per_account: max_pending_per_account.max(1),
        }
    }

    /// Issues a code for the subject, reusing its unexpired code when one exists.
    pub async fn issue(
        &self,
        account_id: &str,
        open_id: &str,
        now_unix_ms: u64,
    ) -> Result<IssuedPairingCode> {
        let ttl_ms = self.ttl_ms;
        let max_pending = self.max_pending_per_account;
        self.store
            .update(|document| {
                document.prune_expired(now_unix_ms);
                if let Some((code, record)) = document
                    .codes
                    .iter()
                    .find(|(_, record)| record.account_id == account_id && record.open_id == open_id)
                {
                    return IssuedPairingCode {
                        code: code.clone(),
                        expires_at_unix_ms: record.expires_at_unix_ms,
                        reused: true,
                    };
                }

                let mut pending: Vec<(String, u64)> = document
                    .codes
                    .iter()
                    .filter(|(_, record)| record.account_id == account_id)
                    .map(|(code, record)| (code.clone(), record.created_at_unix_ms))
                    .collect();
                pending.sort_by_key(|(_, created)| *created);
                let excess = (pending.len() + 1).saturating_sub(max_pending);
                for (code, _) in pending.into_iter().take(excess) {
                    document.codes.remove(&code);
                }

                let code = loop {
                    let candidate = generate_pairing_code();
                    if !document.codes.contains_key(&candidate) {
                        break candidate;
                    }
                };
                let expires_at_unix_ms = deadline_unix_ms(now_unix_ms, ttl_ms);
                document.codes.insert(
                    code.clone(),
                    PairingCodeRecord {
                        account_id: account_id.to_string(),
                        open_id: open_id.to_string(),
                        created_at_unix_ms: now_unix_ms,
                        expires_at_unix_ms,
                    },
                );
                IssuedPairingCode {
                    code,
                    expires_at_unix_ms,
                    reused: false,
                }
            })
            .await
    }

    /// Locks the code document for a redeem critical section.
    pub async fn lock(&self) -> Result<LockedDocument<'_, PairingCodeDocument>> {
        self.store.lock().await
    }

    pub fn pending_codes(&self) -> BTreeMap<String, PairingCodeRecord> {
        self.store.load().codes
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn store(dir: &std::path::Path) -> PairingCodeStore {
        PairingCodeStore::new(
            dir.join("pairing-codes.json"),
            FileLockPolicy::default(),
            60_000,
            DEFAULT_MAX_PENDING_CODES_PER_ACCOUNT,
        )
    }

    #[test]
    fn unit_generated_codes_use_unambiguous_alphabet() {
        for _ in 0..32 {
            let code = generate_pairing_code();
            assert_eq!(normalize_pairing_code(&code), Some(code.clone()));
            assert!(!code.contains('0') && !code.contains('O') && !code.contains('I'));
        }
    }

    #[test]
    fn regression_every_code_position_reaches_the_full_alphabet() {
        let mut seen = vec![std::collections::BTreeSet::new(); PAIRING_CODE_LENGTH];
        for _ in 0..2_000 {
            for (position, symbol) in generate_pairing_code().chars().enumerate() {
                seen[position].insert(symbol);
            }
        }
        for (position, symbols) in seen.iter().enumerate() {
            assert_eq!(
                symbols.len(),
                PAIRING_CODE_ALPHABET.len(),
                "position {position}"
            );
        }
    }

    #[test]
    fn unit_normalize_pairing_code_accepts_lowercase_and_rejects_garbage() {
        assert_eq!(
            normalize_pairing_code(" abcd2345 "),
            Some("ABCD2345".to_string())
        );
        assert_eq!(normalize_pairing_code("ABC"), None);
        assert_eq!(normalize_pairing_code("ABCD234O"), None);
    }

    #[tokio::test]
    async fn functional_issue_reuses_unexpired_code_for_same_subject() {
        let temp = tempdir().expect("tempdir");
        let store = store(temp.path());
        let first = store.issue("wx-main", "o-user", 1_000).await.expect("issue");
        let second = store.issue("wx-main", "o-user", 2_000).await.expect("reissue");
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.code, second.code);
        assert_eq!(first.expires_at_unix_ms, 61_000);
    }

    #[tokio::test]
    async fn functional_issue_replaces_expired_code() {
        let temp = tempdir().expect("tempdir");
        let store = store(temp.path());
        let first = store.issue("wx-main", "o-user", 1_000).await.expect("issue");
        let second = store
            .issue("wx-main", "o-user", 61_000)
            .await
            .expect("issue after expiry");
        assert!(!second.reused);
        let pending = store.pending_codes();
        assert_eq!(pending.len(), 1);
        let record = pending.get(&second.code).expect("fresh record");
        assert_eq!(record.created_at_unix_ms, 61_000);
        assert_eq!(first.expires_at_unix_ms, 61_000);
    }

    #[tokio::test]
    async fn regression_pending_codes_are_capped_per_account() {
        let temp = tempdir().expect("tempdir");
        let store = store(temp.path());
        let oldest = store.issue("wx-main", "o-1", 1_000).await.expect("issue");
        store.issue("wx-main", "o-2", 2_000).await.expect("issue");
        store.issue("wx-main", "o-3", 3_000).await.expect("issue");
        store.issue("wx-main", "o-4", 4_000).await.expect("issue");
        store.issue("wx-other", "o-1", 5_000).await.expect("issue");

        let pending = store.pending_codes();
        assert!(!pending.contains_key(&oldest.code));
        let main_pending = pending
            .values()
            .filter(|record| record.account_id == "wx-main")
            .count();
        assert_eq!(main_pending, 3);
        assert_eq!(pending.len(), 4);
    }
}
