//! Hand-off of inbound messages to the external agent runtime.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mpgate_access::AccessTier;
use mpgate_runtime::SafeFetcher;
use serde::{Deserialize, Serialize};

/// Everything the agent needs to answer one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDispatchRequest {
    pub channel: String,
    pub account_id: String,
    pub open_id: String,
    pub subject_id: String,
    pub access_tier: AccessTier,
    pub text: String,
    pub msg_type: String,
    pub msg_id: Option<String>,
    pub create_time: u64,
    pub image_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct AgentDispatchResponse {
    #[serde(default)]
    reply: Option<String>,
}

#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Single attempt; `Ok(None)` means the agent chose not to reply.
    async fn dispatch(&self, request: &AgentDispatchRequest) -> Result<Option<String>>;
}

/// Default dispatcher when no agent endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAgentDispatcher;

#[async_trait]
impl AgentDispatcher for NoopAgentDispatcher {
    async fn dispatch(&self, _request: &AgentDispatchRequest) -> Result<Option<String>> {
        Ok(None)
    }
}

/// POSTs the request as JSON and reads `{"reply": ...}` back.
pub struct HttpAgentDispatcher {
    endpoint: String,
    fetcher: Arc<SafeFetcher>,
}

impl HttpAgentDispatcher {
    pub fn new(endpoint: impl Into<String>, fetcher: Arc<SafeFetcher>) -> Self {
        Self {
            endpoint: endpoint.into(),
            fetcher,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn dispatch(&self, request: &AgentDispatchRequest) -> Result<Option<String>> {
        let payload = serde_json::to_value(request).context("failed to encode agent request")?;
        let response = self
            .fetcher
            .post_json(&self.endpoint, &payload)
            .await
            .with_context(|| format!("agent dispatch to {} failed", self.endpoint))?;
        let decoded: AgentDispatchResponse = serde_json::from_value(response)
            .with_context(|| format!("agent at {} returned an unexpected body", self.endpoint))?;
        Ok(decoded
            .reply
            .filter(|reply| !reply.trim().is_empty()))
    }
}
