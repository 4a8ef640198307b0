//! Persisted per-subject state: opt-out overlay, AI-assistant toggles, and menu payloads.
//!
//! Each concern is one versioned JSON document under the state directory. Mutations go
//! through the document lock; reads use the cached copy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use mpgate_core::{
    current_unix_timestamp_ms, document_schema_version, FileLockPolicy, JsonDocumentStore,
    VersionedDocument, DOCUMENT_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};

/// File locations for every persisted access document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessStorePaths {
    pub opt_out: PathBuf,
    pub ai_assistant: PathBuf,
    pub menu_payloads: PathBuf,
    pub pairing_codes: PathBuf,
    pub allowlist: PathBuf,
}

impl AccessStorePaths {
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self {
            opt_out: state_dir.join("opt-out.json"),
            ai_assistant: state_dir.join("ai-assistant.json"),
            menu_payloads: state_dir.join("menu-payloads.json"),
            pairing_codes: state_dir.join("pairing-codes.json"),
            allowlist: state_dir.join("allowlist.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptOutDocument {
    #[serde(default = "document_schema_version")]
    pub version: u32,
    #[serde(default)]
    pub opt_out: BTreeMap<String, bool>,
}

impl Default for OptOutDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_SCHEMA_VERSION,
            opt_out: BTreeMap::new(),
        }
    }
}

impl VersionedDocument for OptOutDocument {
    fn schema_version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiAssistantDocument {
    #[serde(default = "document_schema_version")]
    pub version: u32,
    #[serde(default)]
    pub enabled: BTreeMap<String, bool>,
}

impl Default for AiAssistantDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_SCHEMA_VERSION,
            enabled: BTreeMap::new(),
        }
    }
}

impl VersionedDocument for AiAssistantDocument {
    fn schema_version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuPayload {
    pub text: String,
    pub updated_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuPayloadDocument {
    #[serde(default = "document_schema_version")]
    pub version: u32,
    #[serde(default)]
    pub payloads: BTreeMap<String, MenuPayload>,
}

impl Default for MenuPayloadDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_SCHEMA_VERSION,
            payloads: BTreeMap::new(),
        }
    }
}

impl VersionedDocument for MenuPayloadDocument {
    fn schema_version(&self) -> u32 {
        self.version
    }
}

/// Local override forcing subjects back to unpaired.
pub struct OptOutStore {
    store: JsonDocumentStore<OptOutDocument>,
}

impl OptOutStore {
    pub fn new(path: impl Into<PathBuf>, lock_policy: FileLockPolicy) -> Self {
        Self {
            store: JsonDocumentStore::new(path, lock_policy),
        }
    }

    pub fn is_opted_out(&self, subject: &str) -> bool {
        self.store
            .load()
            .opt_out
            .get(subject)
            .copied()
            .unwrap_or(false)
    }

    pub async fn set(&self, subject: &str, opted_out: bool) -> Result<()> {
        self.store
            .update(|document| {
                if opted_out {
                    document.opt_out.insert(subject.to_string(), true);
                } else {
                    document.opt_out.remove(subject);
                }
            })
            .await
    }
}

/// Per-subject switch for AI replies.
pub struct AiAssistantStore {
    store: JsonDocumentStore<AiAssistantDocument>,
}

impl AiAssistantStore {
    pub fn new(path: impl Into<PathBuf>, lock_policy: FileLockPolicy) -> Self {
        Self {
            store: JsonDocumentStore::new(path, lock_policy),
        }
    }

    pub fn is_enabled(&self, subject: &str, default_enabled: bool) -> bool {
        self.store
            .load()
            .enabled
            .get(subject)
            .copied()
            .unwrap_or(default_enabled)
    }

    pub async fn set_enabled(&self, subject: &str, enabled: bool) -> Result<()> {
        self.store
            .update(|document| {
                document.enabled.insert(subject.to_string(), enabled);
            })
            .await
    }
}

/// Text dispatched when a menu button with a given event key is clicked.
pub struct MenuPayloadStore {
    store: JsonDocumentStore<MenuPayloadDocument>,
}

fn menu_payload_key(account_id: &str, event_key: &str) -> String {
    format!("{account_id}:{event_key}")
}

impl MenuPayloadStore {
    pub fn new(path: impl Into<PathBuf>, lock_policy: FileLockPolicy) -> Self {
        Self {
            store: JsonDocumentStore::new(path, lock_policy),
        }
    }

    pub fn get(&self, account_id: &str, event_key: &str) -> Option<MenuPayload> {
        self.store
            .load()
            .payloads
            .get(&menu_payload_key(account_id, event_key))
            .cloned()
    }

    /// Returns `false` when the stored text already matches and nothing was written.
    pub async fn upsert(&self, account_id: &str, event_key: &str, text: &str) -> Result<bool> {
        let key = menu_payload_key(account_id, event_key);
        self.store
            .update(|document| {
                if document
                    .payloads
                    .get(&key)
                    .is_some_and(|existing| existing.text == text)
                {
                    return false;
                }
                document.payloads.insert(
                    key,
                    MenuPayload {
                        text: text.to_string(),
                        updated_at_unix_ms: current_unix_timestamp_ms(),
                    },
                );
                true
            })
            .await
    }
}
