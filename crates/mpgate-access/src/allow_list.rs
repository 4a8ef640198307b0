//! Allow-list collaborators: where paired subjects come from and how approvals land.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mpgate_core::{
    document_schema_version, FileLockPolicy, JsonDocumentStore, VersionedDocument,
    DOCUMENT_SCHEMA_VERSION,
};
use mpgate_runtime::{run_command_with_timeout, CommandOutput};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Pulls the subject ids paired on a channel.
#[async_trait]
pub trait AllowListSource: Send + Sync {
    async fn pull(&self, channel: &str) -> Result<Vec<String>>;
}

/// Default source: nobody is paired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAllowListSource;

#[async_trait]
impl AllowListSource for NoopAllowListSource {
    async fn pull(&self, _channel: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Inputs handed to the approval executor once a pairing code has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingApprovalRequest {
    pub channel: String,
    pub code: String,
    pub subject_id: String,
}

/// Grants a validated pairing in the external allow-list.
#[async_trait]
pub trait PairingApprovalExecutor: Send + Sync {
    async fn approve(&self, request: &PairingApprovalRequest) -> Result<CommandOutput>;
}

/// Default executor: approves without side effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPairingApprovalExecutor;

#[async_trait]
impl PairingApprovalExecutor for NoopPairingApprovalExecutor {
    async fn approve(&self, _request: &PairingApprovalRequest) -> Result<CommandOutput> {
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

/// Runs an external program; `{channel}`, `{code}` and `{subject}` in args are substituted.
#[derive(Debug, Clone)]
pub struct CommandPairingApprovalExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPairingApprovalExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn render_args(&self, request: &PairingApprovalRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{channel}", &request.channel)
                    .replace("{code}", &request.code)
                    .replace("{subject}", &request.subject_id)
            })
            .collect()
    }
}

#[async_trait]
impl PairingApprovalExecutor for CommandPairingApprovalExecutor {
    async fn approve(&self, request: &PairingApprovalRequest) -> Result<CommandOutput> {
        let args = self.render_args(request);
        run_command_with_timeout(&self.program, &args, self.timeout).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListDocument {
    #[serde(default = "document_schema_version")]
    pub version: u32,
    #[serde(default)]
    pub channels: BTreeMap<String, Vec<String>>,
}

impl Default for AllowListDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_SCHEMA_VERSION,
            channels: BTreeMap::new(),
        }
    }
}

impl VersionedDocument for AllowListDocument {
    fn schema_version(&self) -> u32 {
        self.version
    }
}

/// Allow-list kept in a local JSON document; serves as both source and approver.
pub struct FileAllowList {
    store: JsonDocumentStore<AllowListDocument>,
}

impl FileAllowList {
    pub fn new(path: impl Into<PathBuf>, lock_policy: FileLockPolicy) -> Self {
        Self {
            store: JsonDocumentStore::new(path, lock_policy),
        }
    }
}

#[async_trait]
impl AllowListSource for FileAllowList {
    async fn pull(&self, channel: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .load()
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PairingApprovalExecutor for FileAllowList {
    async fn approve(&self, request: &PairingApprovalRequest) -> Result<CommandOutput> {
        let added = self
            .store
            .update(|document| {
                let subjects = document.channels.entry(request.channel.clone()).or_default();
                if subjects.iter().any(|existing| existing == &request.subject_id) {
                    return false;
                }
                subjects.push(request.subject_id.clone());
                subjects.sort();
                true
            })
            .await?;
        info!(channel = %request.channel, added, "allow-list approval recorded");
        Ok(CommandOutput {
            stdout: if added { "added" } else { "unchanged" }.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}
