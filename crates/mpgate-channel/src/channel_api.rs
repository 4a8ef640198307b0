//! Outbound calls to the channel provider's HTTP API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use mpgate_core::current_unix_timestamp_ms;
use mpgate_runtime::{SafeFetchError, SafeFetcher};
use reqwest::Url;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::account::ResolvedAccount;

pub const ACCESS_TOKEN_REFRESH_MARGIN_SECS: u64 = 300;
pub const MAX_REPLY_CHUNK_BYTES: usize = 2_000;
const TOKEN_INVALID_ERRCODES: [i64; 3] = [40001, 42001, 40014];

#[derive(Debug, Error)]
pub enum ChannelApiError {
    #[error(transparent)]
    Fetch(#[from] SafeFetchError),
    #[error("channel api returned errcode {errcode}: {errmsg}")]
    Api { errcode: i64, errmsg: String },
    #[error("channel api response missing '{field}'")]
    MissingField { field: &'static str },
    #[error("invalid channel api url: {0}")]
    InvalidUrl(String),
}

impl ChannelApiError {
    pub fn is_token_invalid(&self) -> bool {
        matches!(self, Self::Api { errcode, .. } if TOKEN_INVALID_ERRCODES.contains(errcode))
    }
}

/// Delivers text replies to a subject of an account.
#[async_trait]
pub trait ChannelReplySender: Send + Sync {
    async fn send_text(
        &self,
        account: &ResolvedAccount,
        open_id: &str,
        text: &str,
    ) -> Result<(), ChannelApiError>;
}

#[derive(Debug, Clone)]
struct CachedAccessToken {
    token: String,
    refresh_after_unix_ms: u64,
}

/// Held across a refresh so concurrent callers for one account share a single fetch.
type TokenSlot = Arc<Mutex<Option<CachedAccessToken>>>;

/// Channel API client with a per-account access-token cache.
pub struct ChannelApiClient {
    fetcher: Arc<SafeFetcher>,
    tokens: StdMutex<HashMap<String, TokenSlot>>,
}

impl ChannelApiClient {
    pub fn new(fetcher: Arc<SafeFetcher>) -> Self {
        Self {
            fetcher,
            tokens: StdMutex::new(HashMap::new()),
        }
    }

    fn token_slot(&self, account_id: &str) -> TokenSlot {
        let mut slots = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(account_id.to_string()).or_default())
    }

    /// Returns a cached token until shortly before expiry, fetching a new one otherwise.
    /// Only callers for the same account wait on a refresh.
    pub async fn access_token(&self, account: &ResolvedAccount) -> Result<String, ChannelApiError> {
        let slot = self.token_slot(&account.account_id);
        let mut cached = slot.lock().await;
        let now_ms = current_unix_timestamp_ms();
        if let Some(current) = cached.as_ref() {
            if current.refresh_after_unix_ms > now_ms {
                return Ok(current.token.clone());
            }
        }

        let url = Url::parse_with_params(
            &format!("{}/cgi-bin/token", account.api_base),
            &[
                ("grant_type", "client_credential"),
                ("appid", account.app_id.as_str()),
                ("secret", account.app_secret.as_str()),
            ],
        )
        .map_err(|error| ChannelApiError::InvalidUrl(error.to_string()))?;
        let response = self.fetcher.get_json(url.as_str()).await?;
        check_errcode(&response)?;
        let token = response
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or(ChannelApiError::MissingField {
                field: "access_token",
            })?
            .to_string();
        let expires_in = response
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(7_200);
        let lifetime_ms = expires_in
            .saturating_sub(ACCESS_TOKEN_REFRESH_MARGIN_SECS)
            .saturating_mul(1_000);
        debug!(
            account_id = %account.account_id,
            expires_in,
            "refreshed channel access token"
        );
        *cached = Some(CachedAccessToken {
            token: token.clone(),
            refresh_after_unix_ms: now_ms.saturating_add(lifetime_ms),
        });
        Ok(token)
    }

    pub async fn invalidate_token(&self, account_id: &str) {
        *self.token_slot(account_id).lock().await = None;
    }

    #[cfg(test)]
    async fn prime_token(&self, account_id: &str, token: &str) {
        *self.token_slot(account_id).lock().await = Some(CachedAccessToken {
            token: token.to_string(),
            refresh_after_unix_ms: u64::MAX,
        });
    }

    async fn post_custom_message(
        &self,
        account: &ResolvedAccount,
        body: &Value,
    ) -> Result<(), ChannelApiError> {
        let mut retried = false;
        loop {
            let token = self.access_token(account).await?;
            let url = Url::parse_with_params(
                &format!("{}/cgi-bin/message/custom/send", account.api_base),
                &[("access_token", token.as_str())],
            )
            .map_err(|error| ChannelApiError::InvalidUrl(error.to_string()))?;
            let response = self.fetcher.post_json(url.as_str(), body).await?;
            match check_errcode(&response) {
                Err(error) if !retried && error.is_token_invalid() => {
                    warn!(
                        account_id = %account.account_id,
                        %error,
                        "channel access token rejected; refreshing once"
                    );
                    self.invalidate_token(&account.account_id).await;
                    retried = true;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl ChannelReplySender for ChannelApiClient {
    async fn send_text(
        &self,
        account: &ResolvedAccount,
        open_id: &str,
        text: &str,
    ) -> Result<(), ChannelApiError> {
        for chunk in split_reply_chunks(text, MAX_REPLY_CHUNK_BYTES) {
            let body = json!({
                "touser": open_id,
                "msgtype": "text",
                "text": { "content": chunk },
            });
            self.post_custom_message(account, &body).await?;
        }
        Ok(())
    }
}

fn check_errcode(response: &Value) -> Result<(), ChannelApiError> {
    let errcode = response.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if errcode == 0 {
        return Ok(());
    }
    Err(ChannelApiError::Api {
        errcode,
        errmsg: response
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Splits `text` into chunks of at most `max_bytes` UTF-8 bytes on char boundaries.
pub fn split_reply_chunks(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(4);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max_bytes {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
