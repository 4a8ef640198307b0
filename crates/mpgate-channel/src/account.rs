//! Channel credential sets and their resolved, immutable runtime form.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::envelope_crypto::EnvelopeCipher;
use crate::routing::normalize_webhook_path;

pub const DEFAULT_WEBHOOK_PATH: &str = "/wechat";
pub const DEFAULT_API_BASE: &str = "https://api.weixin.qq.com";
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_500;

fn default_webhook_path() -> String {
    DEFAULT_WEBHOOK_PATH.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_true() -> bool {
    true
}

/// What an unpaired subject gets when it sends a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnpairedPolicy {
    /// Dispatch to the agent with the unpaired tier.
    #[default]
    Agent,
    /// Reply with a hint to send `/pair` instead of dispatching.
    PairingHint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccountConfig {
    pub account_id: String,
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    pub token: String,
    #[serde(default)]
    pub encoding_aes_key: Option<String>,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pairing_token: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub unpaired_policy: UnpairedPolicy,
    #[serde(default = "default_true")]
    pub ai_default_enabled: bool,
    #[serde(default)]
    pub welcome_text: Option<String>,
}

impl ChannelAccountConfig {
    pub fn resolve(&self) -> Result<ResolvedAccount> {
        let account_id = self.account_id.trim();
        if account_id.is_empty() {
            bail!("account_id cannot be empty");
        }
        if account_id.contains(':') {
            bail!("account_id '{account_id}' cannot contain ':'");
        }
        if self.token.trim().is_empty() {
            bail!("account '{account_id}' requires a non-empty token");
        }
        let cipher = match self
            .encoding_aes_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            Some(key) => Some(EnvelopeCipher::new(key, &self.app_id).with_context(|| {
                format!("account '{account_id}' has an invalid encoding_aes_key")
            })?),
            None => None,
        };
        let pairing_token = self
            .pairing_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        Ok(ResolvedAccount {
            account_id: account_id.to_string(),
            app_id: self.app_id.trim().to_string(),
            app_secret: self.app_secret.trim().to_string(),
            token: self.token.trim().to_string(),
            cipher,
            webhook_path: normalize_webhook_path(&self.webhook_path),
            enabled: self.enabled,
            pairing_token,
            api_base: self.api_base.trim().trim_end_matches('/').to_string(),
            debounce_ms: self.debounce_ms,
            unpaired_policy: self.unpaired_policy,
            ai_default_enabled: self.ai_default_enabled,
            welcome_text: self.welcome_text.clone(),
        })
    }
}

/// Validated credentials shared read-only for the process lifetime.
#[derive(Clone)]
pub struct ResolvedAccount {
    pub account_id: String,
    pub app_id: String,
    pub app_secret: String,
    pub token: String,
    pub cipher: Option<EnvelopeCipher>,
    pub webhook_path: String,
    pub enabled: bool,
    pub pairing_token: Option<String>,
    pub api_base: String,
    pub debounce_ms: u64,
    pub unpaired_policy: UnpairedPolicy,
    pub ai_default_enabled: bool,
    pub welcome_text: Option<String>,
}

impl std::fmt::Debug for ResolvedAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAccount")
            .field("account_id", &self.account_id)
            .field("app_id", &self.app_id)
            .field("webhook_path", &self.webhook_path)
            .field("enabled", &self.enabled)
            .field("encrypted", &self.cipher.is_some())
            .field("pairing_api", &self.pairing_token.is_some())
            .field("api_base", &self.api_base)
            .field("debounce_ms", &self.debounce_ms)
            .field("unpaired_policy", &self.unpaired_policy)
            .finish_non_exhaustive()
    }
}

pub type SharedAccount = Arc<ResolvedAccount>;

/// Resolves every enabled account, rejecting duplicate ids.
pub fn resolve_accounts(configs: &[ChannelAccountConfig]) -> Result<Vec<SharedAccount>> {
    let mut resolved: Vec<SharedAccount> = Vec::new();
    for config in configs {
        let account = config.resolve()?;
        if resolved
            .iter()
            .any(|existing| existing.account_id == account.account_id)
        {
            bail!("duplicate account_id '{}'", account.account_id);
        }
        if account.enabled {
            resolved.push(Arc::new(account));
        }
    }
    Ok(resolved)
}
